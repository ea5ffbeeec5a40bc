//! NFSv4 state manager (RFC 7530 §9, §16): client leases, open and lock
//! state with per-owner sequence-id discipline, delegations with
//! callback-driven recall, the grace period and the lease reaper.
//!
//! One coarse mutex covers clients, opens, locks, delegations and the
//! grace flag. The mutex is never held across callback or VFS I/O: where
//! the caller must perform I/O (CB_RECALL after a delegation conflict),
//! the needed coordinates are handed out and the lock released first.
//!
//! Byte ranges live in the shared [`ByteRangeLockTable`] under
//! `nfs4:{clientid}:{owner}` keys, so NFSv4 and NLM locks exclude each
//! other in both directions. A lock-state record maps a stateid and its
//! sequence number onto that table entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::locking::ByteRangeLockTable;
use crate::protocol::nfs4::callback::CallbackInfo;
use crate::protocol::nfs4::{
    Nfs4Stat, StateId, NFS4_LEASE_TIME, OPEN4_SHARE_ACCESS_WRITE, OPEN_DELEGATE_READ,
    OPEN_DELEGATE_WRITE, READ_LT, WRITE_LT,
};
use crate::vfs::FileHandle;

/// How often the reaper sweeps for dead clients.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// RFC 7530 §16.10 lock owner identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOwner {
    pub clientid: u64,
    pub owner: Vec<u8>,
}

/// LOCK4denied coordinates returned to a refused locker.
#[derive(Clone, Debug)]
pub struct LockDenied {
    pub offset: u64,
    pub length: u64,
    pub locktype: u32,
    pub owner: LockOwner,
}

/// A delegation grant reported from OPEN.
#[derive(Clone, Copy, Debug)]
pub struct DelegationGrant {
    pub deleg_type: u32,
    pub stateid: StateId,
}

/// Everything the caller needs to issue CB_RECALL after the state mutex
/// is released.
#[derive(Clone, Debug)]
pub struct DelegRecall {
    pub cb: CallbackInfo,
    pub stateid: StateId,
    pub fh: FileHandle,
}

/// Successful OPEN outcome.
#[derive(Clone, Debug)]
pub struct OpenGrant {
    pub stateid: StateId,
    pub needs_confirm: bool,
    pub delegation: Option<DelegationGrant>,
}

/// OPEN failure: either a plain status, or a delegation conflict that the
/// caller answers with CB_RECALL plus NFS4ERR_DELAY.
#[derive(Debug)]
pub enum OpenError {
    Status(Nfs4Stat),
    DelegationConflict(Option<DelegRecall>),
}

/// LOCK/LOCKT failure.
#[derive(Debug)]
pub enum LockError {
    Status(Nfs4Stat),
    Denied(LockDenied),
}

struct ClientRecord {
    clientid: u64,
    verifier: [u8; 8],
    confirm_verifier: [u8; 8],
    client_id: Vec<u8>,
    confirmed: bool,
    last_renewed: Instant,
    cb_info: CallbackInfo,
}

struct OpenState {
    stateid: StateId,
    clientid: u64,
    fh: FileHandle,
    access: u32,
    deny: u32,
    owner: Vec<u8>,
    /// Last sequence number the owner consumed on this open.
    open_seqid: u32,
    confirmed: bool,
}

struct LockState {
    stateid: StateId,
    lock_owner: LockOwner,
    fh: FileHandle,
    clientid: u64,
    /// Backlink to the open this lock-state was created under, for the
    /// LOCKS_HELD check and cleanup at CLOSE.
    open_stateid_other: [u8; 12],
    lock_seqid: u32,
    /// Key under which the ranges live in the shared table.
    owner_key: String,
}

struct DelegState {
    stateid: StateId,
    clientid: u64,
    fh: FileHandle,
    deleg_type: u32,
    recalled: bool,
}

struct StateInner {
    next_clientid: u64,
    next_state: u64,
    clients: HashMap<u64, ClientRecord>,
    client_index: HashMap<Vec<u8>, u64>,
    opens: Vec<OpenState>,
    locks: Vec<LockState>,
    delegs: Vec<DelegState>,
    lock_table: ByteRangeLockTable,
    in_grace: bool,
}

pub struct StateManager {
    inner: Mutex<StateInner>,
    lease_time: Duration,
    reaper_stop: AtomicBool,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Owner key for NFSv4 locks in the shared table.
fn nfs4_owner_key(owner: &LockOwner) -> String {
    format!("nfs4:{:x}:{}", owner.clientid, hex(&owner.owner))
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self::with_lease_time(Duration::from_secs(u64::from(NFS4_LEASE_TIME)))
    }

    /// Lease duration is injectable so expiry is testable without waiting
    /// out the protocol's 90 seconds.
    pub fn with_lease_time(lease_time: Duration) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                next_clientid: 1,
                next_state: 1,
                clients: HashMap::new(),
                client_index: HashMap::new(),
                opens: Vec::new(),
                locks: Vec::new(),
                delegs: Vec::new(),
                lock_table: ByteRangeLockTable::new(),
                in_grace: true,
            }),
            lease_time,
            reaper_stop: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- clients ---

    /// RFC 7530 §16.33 SETCLIENTID. Known client identities get a new
    /// verifier, callback info and confirm verifier and revert to
    /// unconfirmed; new ones get a fresh clientid.
    pub fn set_clientid(
        &self,
        verifier: [u8; 8],
        client_id: &[u8],
        cb_info: CallbackInfo,
    ) -> (u64, [u8; 8]) {
        let mut inner = self.lock();
        let confirm_verifier: [u8; 8] = rand::random();

        if let Some(&clientid) = inner.client_index.get(client_id) {
            if let Some(client) = inner.clients.get_mut(&clientid) {
                client.verifier = verifier;
                client.confirm_verifier = confirm_verifier;
                client.confirmed = false;
                client.cb_info = cb_info;
                client.last_renewed = Instant::now();
                return (clientid, confirm_verifier);
            }
        }

        let clientid = inner.next_clientid;
        inner.next_clientid += 1;
        inner.client_index.insert(client_id.to_vec(), clientid);
        inner.clients.insert(
            clientid,
            ClientRecord {
                clientid,
                verifier,
                confirm_verifier,
                client_id: client_id.to_vec(),
                confirmed: false,
                last_renewed: Instant::now(),
                cb_info,
            },
        );
        (clientid, confirm_verifier)
    }

    /// RFC 7530 §16.34 SETCLIENTID_CONFIRM.
    pub fn confirm_clientid(&self, clientid: u64, confirm: &[u8; 8]) -> Result<(), Nfs4Stat> {
        let mut inner = self.lock();
        let client = inner.clients.get_mut(&clientid).ok_or(Nfs4Stat::StaleClientid)?;
        if client.confirm_verifier != *confirm {
            return Err(Nfs4Stat::StaleClientid);
        }
        client.confirmed = true;
        client.last_renewed = Instant::now();
        Ok(())
    }

    /// RFC 7530 §16.27 RENEW.
    pub fn renew(&self, clientid: u64) -> Result<(), Nfs4Stat> {
        let mut inner = self.lock();
        let client = inner.clients.get_mut(&clientid).ok_or(Nfs4Stat::StaleClientid)?;
        client.last_renewed = Instant::now();
        Ok(())
    }

    pub fn get_client_callback(&self, clientid: u64) -> Option<CallbackInfo> {
        self.lock().clients.get(&clientid).map(|c| c.cb_info.clone())
    }

    /// Mark a client's callback channel unusable; no delegations will be
    /// offered to it afterwards.
    pub fn invalidate_client_callback(&self, clientid: u64) {
        if let Some(client) = self.lock().clients.get_mut(&clientid) {
            client.cb_info.valid = false;
        }
    }

    // --- opens ---

    /// RFC 7530 §16.16 OPEN: share-state bookkeeping, seqid discipline
    /// and the delegation grant/recall policy.
    pub fn open_file(
        &self,
        clientid: u64,
        owner: &[u8],
        seqid: u32,
        fh: &FileHandle,
        access: u32,
        deny: u32,
    ) -> Result<OpenGrant, OpenError> {
        let mut inner = self.lock();

        let confirmed = inner
            .clients
            .get(&clientid)
            .map(|c| c.confirmed)
            .ok_or(OpenError::Status(Nfs4Stat::StaleClientid))?;
        if !confirmed {
            return Err(OpenError::Status(Nfs4Stat::StaleClientid));
        }

        // A conflicting delegation held by another client has to be
        // recalled before this open can proceed. The caller sends
        // CB_RECALL outside the lock and answers NFS4ERR_DELAY.
        let wants_write = access & OPEN4_SHARE_ACCESS_WRITE != 0;
        let conflicts: Vec<usize> = inner
            .delegs
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.fh == *fh
                    && d.clientid != clientid
                    && (d.deleg_type == OPEN_DELEGATE_WRITE || wants_write)
            })
            .map(|(i, _)| i)
            .collect();
        if !conflicts.is_empty() {
            let mut recall = None;
            for idx in conflicts {
                let fresh = !inner.delegs[idx].recalled;
                inner.delegs[idx].recalled = true;
                if recall.is_none() && fresh {
                    let holder = inner.delegs[idx].clientid;
                    let stateid = inner.delegs[idx].stateid;
                    recall = inner
                        .clients
                        .get(&holder)
                        .filter(|c| c.cb_info.valid)
                        .map(|c| DelegRecall { cb: c.cb_info.clone(), stateid, fh: *fh });
                }
            }
            return Err(OpenError::DelegationConflict(recall));
        }

        let (stateid, needs_confirm) = match inner
            .opens
            .iter_mut()
            .find(|os| os.clientid == clientid && os.owner == owner && os.fh == *fh)
        {
            Some(os) => {
                if seqid != os.open_seqid.wrapping_add(1) {
                    return Err(OpenError::Status(Nfs4Stat::BadSeqid));
                }
                os.access |= access;
                os.stateid.seqid += 1;
                os.open_seqid = seqid;
                (os.stateid, !os.confirmed)
            }
            None => {
                let mut other = [0u8; 12];
                other[..8].copy_from_slice(&inner.next_state.to_le_bytes());
                inner.next_state += 1;
                let stateid = StateId { seqid: 1, other };
                inner.opens.push(OpenState {
                    stateid,
                    clientid,
                    fh: *fh,
                    access,
                    deny,
                    owner: owner.to_vec(),
                    open_seqid: seqid,
                    confirmed: false,
                });
                (stateid, true)
            }
        };

        // Delegation grant policy: only when no other client holds the
        // file open and the callback channel is known-good.
        let other_client_open =
            inner.opens.iter().any(|os| os.fh == *fh && os.clientid != clientid);
        let cb_valid = inner.clients.get(&clientid).is_some_and(|c| c.cb_info.valid);
        let delegation = if !other_client_open && cb_valid {
            match inner.delegs.iter().find(|d| d.clientid == clientid && d.fh == *fh) {
                Some(d) => Some(DelegationGrant { deleg_type: d.deleg_type, stateid: d.stateid }),
                None => {
                    let deleg_type =
                        if wants_write { OPEN_DELEGATE_WRITE } else { OPEN_DELEGATE_READ };
                    let next_state = &mut inner.next_state;
                    let mut other = [0u8; 12];
                    other[..8].copy_from_slice(&next_state.to_le_bytes());
                    *next_state += 1;
                    let stateid = StateId { seqid: 1, other };
                    inner.delegs.push(DelegState {
                        stateid,
                        clientid,
                        fh: *fh,
                        deleg_type,
                        recalled: false,
                    });
                    Some(DelegationGrant { deleg_type, stateid })
                }
            }
        } else {
            None
        };

        if let Some(client) = inner.clients.get_mut(&clientid) {
            client.last_renewed = Instant::now();
        }

        Ok(OpenGrant { stateid, needs_confirm, delegation })
    }

    /// RFC 7530 §16.18 OPEN_CONFIRM.
    pub fn confirm_open(&self, stateid: &StateId, seqid: u32) -> Result<StateId, Nfs4Stat> {
        let mut inner = self.lock();
        let os = inner
            .opens
            .iter_mut()
            .find(|os| os.stateid.other == stateid.other)
            .ok_or(Nfs4Stat::BadStateid)?;
        if seqid != os.open_seqid.wrapping_add(1) {
            return Err(Nfs4Stat::BadSeqid);
        }
        os.confirmed = true;
        os.stateid.seqid += 1;
        os.open_seqid = seqid;
        let out = os.stateid;
        let clientid = os.clientid;
        if let Some(client) = inner.clients.get_mut(&clientid) {
            client.last_renewed = Instant::now();
        }
        Ok(out)
    }

    /// RFC 7530 §16.19 OPEN_DOWNGRADE: the new mode must be a subset of
    /// the current one.
    pub fn open_downgrade(
        &self,
        stateid: &StateId,
        seqid: u32,
        access: u32,
        deny: u32,
    ) -> Result<StateId, Nfs4Stat> {
        let mut inner = self.lock();
        let os = inner
            .opens
            .iter_mut()
            .find(|os| os.stateid.other == stateid.other)
            .ok_or(Nfs4Stat::BadStateid)?;
        if seqid != os.open_seqid.wrapping_add(1) {
            return Err(Nfs4Stat::BadSeqid);
        }
        if access & os.access != access {
            return Err(Nfs4Stat::Inval);
        }
        os.access = access;
        os.deny = deny;
        os.stateid.seqid += 1;
        os.open_seqid = seqid;
        let out = os.stateid;
        let clientid = os.clientid;
        if let Some(client) = inner.clients.get_mut(&clientid) {
            client.last_renewed = Instant::now();
        }
        Ok(out)
    }

    /// RFC 7530 §16.4 CLOSE. Refused with LOCKS_HELD while any lock-state
    /// created under this open still covers byte ranges; empty lock-states
    /// are swept away with the open.
    pub fn close_file(&self, stateid: &StateId, seqid: u32) -> Result<StateId, Nfs4Stat> {
        let mut inner = self.lock();
        let idx = inner
            .opens
            .iter()
            .position(|os| os.stateid.other == stateid.other)
            .ok_or(Nfs4Stat::BadStateid)?;
        if seqid != inner.opens[idx].open_seqid.wrapping_add(1) {
            return Err(Nfs4Stat::BadSeqid);
        }

        let open_other = inner.opens[idx].stateid.other;
        let held = inner.locks.iter().any(|ls| {
            ls.open_stateid_other == open_other
                && inner.lock_table.has_locks(&ls.fh, &ls.owner_key)
        });
        if held {
            return Err(Nfs4Stat::LocksHeld);
        }

        inner.locks.retain(|ls| ls.open_stateid_other != open_other);
        let os = inner.opens.remove(idx);
        let mut out = os.stateid;
        out.seqid = u32::MAX;
        if let Some(client) = inner.clients.get_mut(&os.clientid) {
            client.last_renewed = Instant::now();
        }
        Ok(out)
    }

    /// Validate a stateid presented with READ/WRITE/SETATTR. Special
    /// stateids always pass; open stateids are checked against their
    /// share mode; lock stateids pass; a read delegation cannot write.
    pub fn validate_stateid(&self, stateid: &StateId, required_access: u32) -> Result<(), Nfs4Stat> {
        if stateid.is_special() {
            return Ok(());
        }
        let inner = self.lock();

        if let Some(os) = inner.opens.iter().find(|os| os.stateid.other == stateid.other) {
            if required_access & os.access != required_access {
                return Err(Nfs4Stat::Access);
            }
            return Ok(());
        }
        if inner.locks.iter().any(|ls| ls.stateid.other == stateid.other) {
            return Ok(());
        }
        if let Some(d) = inner.delegs.iter().find(|d| d.stateid.other == stateid.other) {
            if d.deleg_type == OPEN_DELEGATE_READ && required_access & OPEN4_SHARE_ACCESS_WRITE != 0
            {
                return Err(Nfs4Stat::Access);
            }
            return Ok(());
        }
        Err(Nfs4Stat::BadStateid)
    }

    // --- byte-range locks ---

    fn denied_from_conflict(
        inner: &StateInner,
        conflict: crate::locking::LockConflict,
    ) -> LockDenied {
        let owner = inner
            .locks
            .iter()
            .find(|ls| ls.owner_key == conflict.owner)
            .map(|ls| ls.lock_owner.clone())
            .unwrap_or_else(|| LockOwner { clientid: 0, owner: conflict.owner.into_bytes() });
        LockDenied {
            offset: conflict.offset,
            length: conflict.length,
            locktype: if conflict.exclusive { WRITE_LT } else { READ_LT },
            owner,
        }
    }

    /// RFC 7530 §16.10 LOCK with a new lock owner bound to an open.
    ///
    /// The open's seqid is consumed whether or not the lock is granted
    /// (RFC 7530 §8.1.5).
    #[allow(clippy::too_many_arguments)]
    pub fn lock_new(
        &self,
        clientid: u64,
        open_stateid: &StateId,
        open_seqid: u32,
        lock_owner: &LockOwner,
        lock_seqid: u32,
        fh: &FileHandle,
        locktype: u32,
        offset: u64,
        length: u64,
    ) -> Result<StateId, LockError> {
        let mut inner = self.lock();

        let open_idx = inner
            .opens
            .iter()
            .position(|os| os.stateid.other == open_stateid.other)
            .ok_or(LockError::Status(Nfs4Stat::BadStateid))?;
        if open_seqid != inner.opens[open_idx].open_seqid.wrapping_add(1) {
            return Err(LockError::Status(Nfs4Stat::BadSeqid));
        }
        inner.opens[open_idx].open_seqid = open_seqid;
        let open_other = inner.opens[open_idx].stateid.other;

        let key = nfs4_owner_key(lock_owner);
        let exclusive = locktype == WRITE_LT;
        if let Some(conflict) = inner.lock_table.test(fh, &key, exclusive, offset, length) {
            let denied = Self::denied_from_conflict(&inner, conflict);
            return Err(LockError::Denied(denied));
        }
        inner
            .lock_table
            .acquire(fh, &key, exclusive, offset, length)
            .expect("conflict checked above");

        let stateid = match inner
            .locks
            .iter_mut()
            .find(|ls| ls.lock_owner == *lock_owner && ls.fh == *fh)
        {
            Some(ls) => {
                ls.stateid.seqid += 1;
                ls.lock_seqid = lock_seqid;
                ls.stateid
            }
            None => {
                let mut other = [0u8; 12];
                other[..8].copy_from_slice(&inner.next_state.to_le_bytes());
                inner.next_state += 1;
                let stateid = StateId { seqid: 1, other };
                inner.locks.push(LockState {
                    stateid,
                    lock_owner: lock_owner.clone(),
                    fh: *fh,
                    clientid,
                    open_stateid_other: open_other,
                    lock_seqid,
                    owner_key: key,
                });
                stateid
            }
        };

        if let Some(client) = inner.clients.get_mut(&clientid) {
            client.last_renewed = Instant::now();
        }
        Ok(stateid)
    }

    /// RFC 7530 §16.10 LOCK on an existing lock stateid.
    pub fn lock_existing(
        &self,
        lock_stateid: &StateId,
        lock_seqid: u32,
        locktype: u32,
        offset: u64,
        length: u64,
    ) -> Result<StateId, LockError> {
        let mut inner = self.lock();

        let idx = inner
            .locks
            .iter()
            .position(|ls| ls.stateid.other == lock_stateid.other)
            .ok_or(LockError::Status(Nfs4Stat::BadStateid))?;
        if lock_seqid != inner.locks[idx].lock_seqid.wrapping_add(1) {
            return Err(LockError::Status(Nfs4Stat::BadSeqid));
        }
        // Sequence numbers advance on DENIED as well.
        inner.locks[idx].lock_seqid = lock_seqid;

        let fh = inner.locks[idx].fh;
        let key = inner.locks[idx].owner_key.clone();
        let exclusive = locktype == WRITE_LT;
        if let Some(conflict) = inner.lock_table.test(&fh, &key, exclusive, offset, length) {
            let denied = Self::denied_from_conflict(&inner, conflict);
            return Err(LockError::Denied(denied));
        }
        inner
            .lock_table
            .acquire(&fh, &key, exclusive, offset, length)
            .expect("conflict checked above");

        inner.locks[idx].stateid.seqid += 1;
        let out = inner.locks[idx].stateid;
        let clientid = inner.locks[idx].clientid;
        if let Some(client) = inner.clients.get_mut(&clientid) {
            client.last_renewed = Instant::now();
        }
        Ok(out)
    }

    /// RFC 7530 §16.11 LOCKT: pure conflict probe, no state change.
    pub fn lock_test(
        &self,
        fh: &FileHandle,
        locktype: u32,
        offset: u64,
        length: u64,
        lock_owner: &LockOwner,
    ) -> Result<(), LockError> {
        let inner = self.lock();
        let key = nfs4_owner_key(lock_owner);
        let exclusive = locktype == WRITE_LT;
        match inner.lock_table.test(fh, &key, exclusive, offset, length) {
            Some(conflict) => Err(LockError::Denied(Self::denied_from_conflict(&inner, conflict))),
            None => Ok(()),
        }
    }

    /// RFC 7530 §16.12 LOCKU: remove a window, splitting ranges that
    /// straddle it. The (possibly empty) lock-state survives until CLOSE.
    pub fn lock_unlock(
        &self,
        lock_stateid: &StateId,
        seqid: u32,
        offset: u64,
        length: u64,
    ) -> Result<StateId, Nfs4Stat> {
        let mut inner = self.lock();

        let idx = inner
            .locks
            .iter()
            .position(|ls| ls.stateid.other == lock_stateid.other)
            .ok_or(Nfs4Stat::BadStateid)?;
        if seqid != inner.locks[idx].lock_seqid.wrapping_add(1) {
            return Err(Nfs4Stat::BadSeqid);
        }

        let fh = inner.locks[idx].fh;
        let key = inner.locks[idx].owner_key.clone();
        inner.lock_table.release(&fh, &key, offset, length);

        inner.locks[idx].lock_seqid = seqid;
        inner.locks[idx].stateid.seqid += 1;
        Ok(inner.locks[idx].stateid)
    }

    /// RFC 7530 §16.26 RELEASE_LOCKOWNER: drop every lock-state of the
    /// owner, no stateid semantics involved.
    pub fn release_lock_owner(&self, lock_owner: &LockOwner) {
        let mut inner = self.lock();
        let key = nfs4_owner_key(lock_owner);
        inner.lock_table.release_all(&key);
        inner.locks.retain(|ls| ls.lock_owner != *lock_owner);
    }

    // --- delegations ---

    /// RFC 7530 §16.7 DELEGRETURN.
    pub fn delegreturn(&self, stateid: &StateId) -> Result<(), Nfs4Stat> {
        let mut inner = self.lock();
        let before = inner.delegs.len();
        inner.delegs.retain(|d| d.stateid.other != stateid.other);
        if inner.delegs.len() == before {
            return Err(Nfs4Stat::BadStateid);
        }
        Ok(())
    }

    /// RFC 7530 §16.6 DELEGPURGE.
    pub fn delegpurge(&self, clientid: u64) -> Result<(), Nfs4Stat> {
        let mut inner = self.lock();
        inner.delegs.retain(|d| d.clientid != clientid);
        Ok(())
    }

    // --- grace period ---

    pub fn in_grace_period(&self) -> bool {
        self.lock().in_grace
    }

    /// End the startup grace period (administrative action).
    pub fn end_grace_period(&self) {
        self.lock().in_grace = false;
    }

    // --- shared lock table (NLM / NSM path) ---

    /// Run an operation against the shared byte-range table under the
    /// state manager's mutex. This is the NLM/NSM entry point, so NFSv4
    /// and NLM serialize on the same lock.
    pub fn with_lock_table<R>(&self, f: impl FnOnce(&mut ByteRangeLockTable) -> R) -> R {
        f(&mut self.lock().lock_table)
    }

    // --- lease expiry ---

    /// One reaper sweep: atomically drop every confirmed client whose
    /// lease ran out, with all of its delegations, locks and opens.
    pub fn expire_stale_clients(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired: Vec<u64> = inner
            .clients
            .values()
            .filter(|c| c.confirmed && now.duration_since(c.last_renewed) > self.lease_time)
            .map(|c| c.clientid)
            .collect();

        for clientid in expired {
            info!("lease expired for client {clientid}, revoking state");
            inner.delegs.retain(|d| d.clientid != clientid);

            let keys: Vec<String> = inner
                .locks
                .iter()
                .filter(|ls| ls.clientid == clientid)
                .map(|ls| ls.owner_key.clone())
                .collect();
            for key in keys {
                inner.lock_table.release_all(&key);
            }
            inner.locks.retain(|ls| ls.clientid != clientid);
            inner.opens.retain(|os| os.clientid != clientid);

            if let Some(client) = inner.clients.remove(&clientid) {
                inner.client_index.remove(&client.client_id);
            }
        }
    }

    /// Spawn the background reaper. It sweeps every 30 seconds until
    /// [`StateManager::stop_reaper`] is called.
    pub fn start_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if state.reaper_stop.load(Ordering::SeqCst) {
                    debug!("lease reaper stopping");
                    return;
                }
                state.expire_stale_clients();
            }
        })
    }

    pub fn stop_reaper(&self) {
        self.reaper_stop.store(true, Ordering::SeqCst);
    }

    // --- introspection ---

    /// Is any open, lock, delegation or index entry still attached to
    /// this client?
    pub fn client_has_state(&self, clientid: u64) -> bool {
        let inner = self.lock();
        inner.clients.contains_key(&clientid)
            || inner.opens.iter().any(|os| os.clientid == clientid)
            || inner.locks.iter().any(|ls| ls.clientid == clientid)
            || inner.delegs.iter().any(|d| d.clientid == clientid)
            || inner.client_index.values().any(|&id| id == clientid)
    }
}
