use std::time::Duration;

use nfs_aurochs::protocol::nfs4::callback::CallbackInfo;
use nfs_aurochs::protocol::nfs4::state::{LockError, LockOwner, OpenError, StateManager};
use nfs_aurochs::protocol::nfs4::{
    Nfs4Stat, StateId, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_ACCESS_WRITE,
    OPEN4_SHARE_DENY_NONE, OPEN_DELEGATE_READ, OPEN_DELEGATE_WRITE, READ_LT, WRITE_LT,
};
use nfs_aurochs::vfs::FileHandle;

fn make_fh(id: u8) -> FileHandle {
    let mut bytes = [0u8; 16];
    bytes[0] = id;
    FileHandle::from_bytes(&bytes).unwrap()
}

fn valid_cb() -> CallbackInfo {
    CallbackInfo {
        cb_program: 0x4000_0000,
        netid: "tcp".to_string(),
        addr: "127.0.0.1.8.1".to_string(),
        ident: 1,
        valid: true,
    }
}

/// Confirmed client with a working callback channel.
fn setup_client_with_cb(mgr: &StateManager, id: u8) -> u64 {
    let (clientid, confirm) = mgr.set_clientid([id; 8], &[id], valid_cb());
    mgr.confirm_clientid(clientid, &confirm).unwrap();
    clientid
}

/// Confirmed client without a callback channel (no delegations).
fn setup_client_no_cb(mgr: &StateManager, id: u8) -> u64 {
    let (clientid, confirm) = mgr.set_clientid([id; 8], &[id], CallbackInfo::default());
    mgr.confirm_clientid(clientid, &confirm).unwrap();
    clientid
}

// --- client lifecycle ---

#[test]
fn set_clientid_and_confirm() {
    let mgr = StateManager::new();
    let (clientid, confirm) = mgr.set_clientid([1, 2, 3, 4, 5, 6, 7, 8], &[10, 20, 30], valid_cb());
    assert!(clientid > 0);

    assert!(mgr.confirm_clientid(clientid, &confirm).is_ok());
    assert_eq!(mgr.confirm_clientid(clientid, &[0u8; 8]), Err(Nfs4Stat::StaleClientid));
}

#[test]
fn same_identity_keeps_clientid() {
    let mgr = StateManager::new();
    let (id1, c1) = mgr.set_clientid([1; 8], &[1], valid_cb());
    mgr.confirm_clientid(id1, &c1).unwrap();

    // Re-registration with the same identity: same clientid, new confirm
    // verifier, back to unconfirmed.
    let (id2, c2) = mgr.set_clientid([9; 8], &[1], valid_cb());
    assert_eq!(id1, id2);
    assert_ne!(c1, c2);
    assert!(mgr.confirm_clientid(id2, &c2).is_ok());
}

#[test]
fn unknown_clientid_is_stale() {
    let mgr = StateManager::new();
    assert_eq!(mgr.confirm_clientid(999, &[0u8; 8]), Err(Nfs4Stat::StaleClientid));
    assert_eq!(mgr.renew(999), Err(Nfs4Stat::StaleClientid));
}

// --- open / confirm / close ---

#[test]
fn open_confirm_close() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);
    let fh = make_fh(42);

    let grant = mgr
        .open_file(clientid, &[1, 2, 3], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert!(grant.needs_confirm);
    assert_eq!(grant.stateid.seqid, 1);

    let confirmed = mgr.confirm_open(&grant.stateid, 2).unwrap();
    assert!(mgr.validate_stateid(&confirmed, OPEN4_SHARE_ACCESS_READ).is_ok());

    let closed = mgr.close_file(&confirmed, 3).unwrap();
    assert_eq!(closed.seqid, u32::MAX);

    assert_eq!(
        mgr.validate_stateid(&confirmed, OPEN4_SHARE_ACCESS_READ),
        Err(Nfs4Stat::BadStateid)
    );
}

#[test]
fn open_access_is_checked_by_validate() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert_eq!(
        mgr.validate_stateid(&grant.stateid, OPEN4_SHARE_ACCESS_WRITE),
        Err(Nfs4Stat::Access)
    );
}

#[test]
fn special_stateids_always_validate() {
    let anon = StateId::anonymous();
    let bypass = StateId::bypass();
    let current = StateId::current();
    assert!(anon.is_special());
    assert!(bypass.is_special());
    assert!(current.is_special());

    let normal = StateId { seqid: 1, other: [1; 12] };
    assert!(!normal.is_special());

    let mgr = StateManager::new();
    assert!(mgr.validate_stateid(&anon, OPEN4_SHARE_ACCESS_READ).is_ok());
    assert!(mgr.validate_stateid(&bypass, OPEN4_SHARE_ACCESS_WRITE).is_ok());
}

#[test]
fn bad_seqid_is_rejected() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);
    let fh = make_fh(42);

    let grant = mgr
        .open_file(clientid, &[1, 2, 3], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();

    // Confirm must use last+1.
    assert_eq!(mgr.confirm_open(&grant.stateid, 5), Err(Nfs4Stat::BadSeqid));
    let confirmed = mgr.confirm_open(&grant.stateid, 2).unwrap();

    assert_eq!(mgr.close_file(&confirmed, 1), Err(Nfs4Stat::BadSeqid));
    assert!(mgr.close_file(&confirmed, 3).is_ok());
}

#[test]
fn reopen_by_same_owner_upgrades_access() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);
    let fh = make_fh(1);

    let first = mgr
        .open_file(clientid, &[7], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    mgr.confirm_open(&first.stateid, 2).unwrap();

    // Upgrade to write with the next seqid; the stateid seqid advances.
    let second = mgr
        .open_file(clientid, &[7], 3, &fh, OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert_eq!(second.stateid.other, first.stateid.other);
    assert!(second.stateid.seqid > first.stateid.seqid);
    assert!(mgr.validate_stateid(&second.stateid, OPEN4_SHARE_ACCESS_BOTH).is_ok());

    // A stale seqid on the same open is rejected.
    assert!(matches!(
        mgr.open_file(clientid, &[7], 3, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE),
        Err(OpenError::Status(Nfs4Stat::BadSeqid))
    ));
}

#[test]
fn downgrade_requires_subset() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let confirmed = mgr.confirm_open(&grant.stateid, 2).unwrap();

    // Widening is not a downgrade.
    assert_eq!(
        mgr.open_downgrade(&confirmed, 3, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_DENY_NONE),
        Err(Nfs4Stat::Inval)
    );
    assert!(mgr
        .open_downgrade(&confirmed, 3, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .is_ok());
}

// --- locking through the state manager ---

struct LockFixture {
    mgr: StateManager,
    clientid: u64,
    open_stateid: StateId,
    fh: FileHandle,
    next_open_seqid: u32,
}

impl LockFixture {
    fn new() -> Self {
        let mgr = StateManager::new();
        mgr.end_grace_period();
        let clientid = setup_client_no_cb(&mgr, 1);
        let fh = make_fh(42);

        let grant = mgr
            .open_file(clientid, &[1, 2, 3], 1, &fh, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_DENY_NONE)
            .unwrap();
        let open_stateid = mgr.confirm_open(&grant.stateid, 2).unwrap();
        Self { mgr, clientid, open_stateid, fh, next_open_seqid: 3 }
    }

    fn owner(&self, tag: u8) -> LockOwner {
        LockOwner { clientid: self.clientid, owner: vec![tag] }
    }

    fn lock_new(
        &mut self,
        owner: &LockOwner,
        locktype: u32,
        offset: u64,
        length: u64,
    ) -> Result<StateId, LockError> {
        let seqid = self.next_open_seqid;
        self.next_open_seqid += 1;
        self.mgr.lock_new(
            self.clientid,
            &self.open_stateid,
            seqid,
            owner,
            0,
            &self.fh,
            locktype,
            offset,
            length,
        )
    }
}

#[test]
fn write_write_conflict() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);

    f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();

    match f.lock_new(&owner2, WRITE_LT, 50, 100) {
        Err(LockError::Denied(denied)) => {
            assert_eq!(denied.locktype, WRITE_LT);
            assert_eq!(denied.offset, 0);
            assert_eq!(denied.length, 100);
            assert_eq!(denied.owner.owner, owner1.owner);
        }
        other => panic!("expected DENIED, got {other:?}"),
    }
}

#[test]
fn read_read_compatible() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);

    f.lock_new(&owner1, READ_LT, 0, 100).unwrap();
    f.lock_new(&owner2, READ_LT, 0, 100).unwrap();
}

#[test]
fn read_write_exclusive() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);

    f.lock_new(&owner1, READ_LT, 0, 100).unwrap();
    assert!(matches!(f.lock_new(&owner2, WRITE_LT, 0, 100), Err(LockError::Denied(_))));
}

#[test]
fn same_owner_never_conflicts() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);

    let sid = f.lock_new(&owner1, READ_LT, 0, 100).unwrap();
    // Overlapping write by the same owner through the lock stateid.
    f.mgr.lock_existing(&sid, 1, WRITE_LT, 50, 100).unwrap();
}

#[test]
fn lock_unlock_relock() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);

    let sid = f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();
    f.mgr.lock_unlock(&sid, 1, 0, 100).unwrap();
    f.lock_new(&owner2, WRITE_LT, 0, 100).unwrap();
}

#[test]
fn lock_seqid_discipline() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);

    let sid = f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();

    assert!(matches!(
        f.mgr.lock_existing(&sid, 99, WRITE_LT, 200, 100),
        Err(LockError::Status(Nfs4Stat::BadSeqid))
    ));
    assert_eq!(f.mgr.lock_unlock(&sid, 99, 0, 100), Err(Nfs4Stat::BadSeqid));
}

/// The open seqid is consumed by LOCK even when the lock is denied.
#[test]
fn denied_lock_still_consumes_open_seqid() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);
    let owner3 = f.owner(30);

    f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();
    assert!(matches!(f.lock_new(&owner2, WRITE_LT, 0, 100), Err(LockError::Denied(_))));
    // The fixture advanced the seqid for the denied call; the next one
    // must still be accepted.
    f.lock_new(&owner3, WRITE_LT, 200, 100).unwrap();
}

#[test]
fn lockt_probes_without_mutating() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);

    f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();

    match f.mgr.lock_test(&f.fh, WRITE_LT, 0, 100, &owner2) {
        Err(LockError::Denied(denied)) => assert_eq!(denied.owner.owner, owner1.owner),
        other => panic!("expected DENIED, got {other:?}"),
    }
    assert!(f.mgr.lock_test(&f.fh, WRITE_LT, 200, 100, &owner2).is_ok());
}

#[test]
fn release_lockowner_frees_ranges() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);

    f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();
    f.mgr.release_lock_owner(&owner1);
    f.lock_new(&owner2, WRITE_LT, 0, 100).unwrap();
}

#[test]
fn close_with_locks_held() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);

    let lock_sid = f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();

    let close_seqid = f.next_open_seqid;
    assert_eq!(f.mgr.close_file(&f.open_stateid, close_seqid), Err(Nfs4Stat::LocksHeld));

    f.mgr.lock_unlock(&lock_sid, 1, 0, 100).unwrap();
    assert!(f.mgr.close_file(&f.open_stateid, close_seqid).is_ok());
}

#[test]
fn unlock_splits_ranges() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);
    let owner2 = f.owner(20);
    let owner3 = f.owner(30);

    let sid = f.lock_new(&owner1, WRITE_LT, 0, 1000).unwrap();
    f.mgr.lock_unlock(&sid, 1, 300, 300).unwrap();

    f.lock_new(&owner2, WRITE_LT, 300, 300).unwrap();
    assert!(matches!(f.lock_new(&owner3, WRITE_LT, 0, 100), Err(LockError::Denied(_))));
    assert!(matches!(f.lock_new(&owner3, WRITE_LT, 600, 100), Err(LockError::Denied(_))));
}

/// NLM locks taken through the shared table conflict with NFSv4 locks.
#[test]
fn nlm_and_nfs4_locks_exclude_each_other() {
    let mut f = LockFixture::new();
    let owner1 = f.owner(10);

    f.lock_new(&owner1, WRITE_LT, 0, 100).unwrap();

    let fh = f.fh;
    let conflict =
        f.mgr.with_lock_table(|table| table.acquire(&fh, "nlm:hostA:7", true, 50, 10));
    assert!(conflict.is_err());

    // And the other way round.
    f.mgr
        .with_lock_table(|table| table.acquire(&fh, "nlm:hostA:7", true, 5000, 10))
        .unwrap();
    let owner2 = f.owner(20);
    assert!(matches!(f.lock_new(&owner2, WRITE_LT, 5000, 5), Err(LockError::Denied(_))));
}

// --- delegations ---

#[test]
fn read_delegation_granted_with_callback() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let deleg = grant.delegation.expect("read delegation expected");
    assert_eq!(deleg.deleg_type, OPEN_DELEGATE_READ);
    assert_ne!(deleg.stateid.seqid, 0);
}

#[test]
fn write_delegation_granted_for_write_open() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert_eq!(grant.delegation.unwrap().deleg_type, OPEN_DELEGATE_WRITE);
}

#[test]
fn no_delegation_without_callback() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert!(grant.delegation.is_none());
}

#[test]
fn no_delegation_when_other_client_has_open() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let client1 = setup_client_with_cb(&mgr, 1);
    let client2 = setup_client_no_cb(&mgr, 2);
    let fh = make_fh(1);

    mgr.open_file(client2, &[2], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let grant = mgr
        .open_file(client1, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert!(grant.delegation.is_none());
}

#[test]
fn delegreturn_invalidates_stateid() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let deleg = grant.delegation.unwrap();

    assert!(mgr.delegreturn(&deleg.stateid).is_ok());
    assert_eq!(
        mgr.validate_stateid(&deleg.stateid, OPEN4_SHARE_ACCESS_READ),
        Err(Nfs4Stat::BadStateid)
    );
    assert_eq!(mgr.delegreturn(&deleg.stateid), Err(Nfs4Stat::BadStateid));
}

#[test]
fn delegpurge_drops_all_client_delegations() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let deleg = grant.delegation.unwrap();

    assert!(mgr.delegpurge(clientid).is_ok());
    assert_eq!(
        mgr.validate_stateid(&deleg.stateid, OPEN4_SHARE_ACCESS_READ),
        Err(Nfs4Stat::BadStateid)
    );
}

/// Write delegation held by client1 forces client2's open to DELAY with a
/// recall; after DELEGRETURN the retry succeeds.
#[test]
fn delegation_conflict_triggers_delay_then_recovers() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let client1 = setup_client_with_cb(&mgr, 1);
    let client2 = setup_client_no_cb(&mgr, 2);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(client1, &[1], 1, &fh, OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let deleg = grant.delegation.unwrap();
    assert_eq!(deleg.deleg_type, OPEN_DELEGATE_WRITE);

    match mgr.open_file(client2, &[2], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE) {
        Err(OpenError::DelegationConflict(Some(recall))) => {
            assert_eq!(recall.stateid, deleg.stateid);
            assert_eq!(recall.fh, fh);
            assert!(recall.cb.valid);
        }
        other => panic!("expected delegation conflict with recall, got {other:?}"),
    }

    mgr.delegreturn(&deleg.stateid).unwrap();

    mgr.open_file(client2, &[2], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
}

#[test]
fn read_delegation_refuses_write_access() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let deleg = grant.delegation.unwrap();
    assert_eq!(deleg.deleg_type, OPEN_DELEGATE_READ);

    assert!(mgr.validate_stateid(&deleg.stateid, OPEN4_SHARE_ACCESS_READ).is_ok());
    assert_eq!(
        mgr.validate_stateid(&deleg.stateid, OPEN4_SHARE_ACCESS_WRITE),
        Err(Nfs4Stat::Access)
    );
}

#[test]
fn invalidated_callback_disables_delegations() {
    let mgr = StateManager::new();
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    mgr.invalidate_client_callback(clientid);

    let fh = make_fh(1);
    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    assert!(grant.delegation.is_none());
}

// --- grace period ---

#[test]
fn grace_period_starts_active_and_can_be_ended() {
    let mgr = StateManager::new();
    assert!(mgr.in_grace_period());
    mgr.end_grace_period();
    assert!(!mgr.in_grace_period());
}

#[test]
fn stateful_ops_work_during_grace() {
    let mgr = StateManager::new();
    assert!(mgr.in_grace_period());

    // SETCLIENTID/CONFIRM/RENEW are always allowed during grace, and the
    // state-level open proceeds (the claim-type policy lives above).
    let clientid = setup_client_no_cb(&mgr, 1);
    assert!(mgr.renew(clientid).is_ok());

    let fh = make_fh(1);
    mgr.open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE)
        .unwrap();
}

// --- lease expiry ---

/// After the reaper expires a client, nothing referencing it survives.
#[test]
fn expiry_is_atomic() {
    let mgr = StateManager::with_lease_time(Duration::ZERO);
    mgr.end_grace_period();
    let clientid = setup_client_with_cb(&mgr, 1);
    let fh = make_fh(1);

    let grant = mgr
        .open_file(clientid, &[1], 1, &fh, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_DENY_NONE)
        .unwrap();
    let open_sid = mgr.confirm_open(&grant.stateid, 2).unwrap();
    let owner = LockOwner { clientid, owner: vec![10] };
    let lock_sid = mgr
        .lock_new(clientid, &open_sid, 3, &owner, 0, &fh, WRITE_LT, 0, 100)
        .unwrap();

    std::thread::sleep(Duration::from_millis(5));
    mgr.expire_stale_clients();

    assert!(!mgr.client_has_state(clientid));
    assert_eq!(mgr.validate_stateid(&open_sid, OPEN4_SHARE_ACCESS_READ), Err(Nfs4Stat::BadStateid));
    assert_eq!(mgr.validate_stateid(&lock_sid, OPEN4_SHARE_ACCESS_READ), Err(Nfs4Stat::BadStateid));
    assert_eq!(mgr.renew(clientid), Err(Nfs4Stat::StaleClientid));

    // The expired client's byte ranges are gone from the shared table.
    let free = mgr.with_lock_table(|table| table.test(&fh, "probe", true, 0, 100).is_none());
    assert!(free);
}

/// A client that keeps renewing is never expired.
#[test]
fn renewal_keeps_client_alive() {
    let mgr = StateManager::with_lease_time(Duration::from_secs(3600));
    mgr.end_grace_period();
    let clientid = setup_client_no_cb(&mgr, 1);

    mgr.expire_stale_clients();
    assert!(mgr.renew(clientid).is_ok());
}
