//! NFSv4.0 COMPOUND processing (RFC 7530 §16).
//!
//! A COMPOUND is a chain of operations sharing one mutable execution
//! context (current and saved filehandle plus the caller's AUTH_SYS
//! identity). Operations run strictly in order and the chain stops at the
//! first non-OK status, which also becomes the compound status.
//!
//! Operation handlers are synchronous; the two operations that need
//! outbound callback I/O (SETCLIENTID_CONFIRM's CB_NULL probe and the
//! CB_RECALL triggered by a delegation conflict in OPEN) park the
//! coordinates in the compound context and the dispatcher performs the
//! I/O after the handler returns, outside the state-manager mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::protocol::nfs4::attrs::{
    self, change_attr, decode_fattr4_setattr, encode_fattr4, FATTR4_MODE, FATTR4_SIZE,
};
use crate::protocol::nfs4::callback::{cb_null_probe, cb_recall};
use crate::protocol::nfs4::state::{DelegRecall, LockDenied, LockError, LockOwner, OpenError, StateManager};
use crate::protocol::nfs4::*;
use crate::protocol::rpc::{ProcError, RpcCallHeader, RpcProgram};
use crate::protocol::xdr::{
    bitmap_set, decode_bitmap, encode_bitmap, XdrDecoder, XdrEncoder, XdrError,
};
use crate::vfs::{FileHandle, NfsTime, SetAttr, SetTime, Vfs};

/// Per-request execution context shared by the operations of one
/// COMPOUND.
#[derive(Default)]
pub struct CompoundState {
    pub current_fh: Option<FileHandle>,
    pub saved_fh: Option<FileHandle>,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
    /// Client to probe with CB_NULL once the current op has returned.
    pending_probe: Option<u64>,
    /// Delegation recall to dispatch once the current op has returned.
    pending_recall: Option<DelegRecall>,
}

type OpResult = Result<Nfs4Stat, XdrError>;
type OpHandler =
    fn(&Nfs4Server, &mut CompoundState, &mut XdrDecoder<'_>, &mut XdrEncoder) -> OpResult;

pub struct Nfs4Server {
    vfs: Arc<dyn Vfs>,
    state: Arc<StateManager>,
    root_fh: FileHandle,
    write_verifier: u64,
    next_cb_xid: AtomicU32,
    ops: HashMap<u32, OpHandler>,
}

impl Nfs4Server {
    pub fn new(vfs: Arc<dyn Vfs>, state: Arc<StateManager>) -> anyhow::Result<Self> {
        let root_fh = vfs
            .root_fh()
            .map_err(|s| anyhow::anyhow!("cannot obtain export root handle: {s:?}"))?;
        let write_verifier = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut ops: HashMap<u32, OpHandler> = HashMap::new();
        ops.insert(OP_ACCESS, Self::op_access);
        ops.insert(OP_CLOSE, Self::op_close);
        ops.insert(OP_COMMIT, Self::op_commit);
        ops.insert(OP_CREATE, Self::op_create);
        ops.insert(OP_DELEGPURGE, Self::op_delegpurge);
        ops.insert(OP_DELEGRETURN, Self::op_delegreturn);
        ops.insert(OP_GETATTR, Self::op_getattr);
        ops.insert(OP_GETFH, Self::op_getfh);
        ops.insert(OP_LINK, Self::op_link);
        ops.insert(OP_LOCK, Self::op_lock);
        ops.insert(OP_LOCKT, Self::op_lockt);
        ops.insert(OP_LOCKU, Self::op_locku);
        ops.insert(OP_LOOKUP, Self::op_lookup);
        ops.insert(OP_LOOKUPP, Self::op_lookupp);
        ops.insert(OP_NVERIFY, Self::op_nverify);
        ops.insert(OP_OPEN, Self::op_open);
        ops.insert(OP_OPEN_CONFIRM, Self::op_open_confirm);
        ops.insert(OP_OPEN_DOWNGRADE, Self::op_open_downgrade);
        ops.insert(OP_PUTFH, Self::op_putfh);
        ops.insert(OP_PUTROOTFH, Self::op_putrootfh);
        ops.insert(OP_READ, Self::op_read);
        ops.insert(OP_READDIR, Self::op_readdir);
        ops.insert(OP_READLINK, Self::op_readlink);
        ops.insert(OP_REMOVE, Self::op_remove);
        ops.insert(OP_RENAME, Self::op_rename);
        ops.insert(OP_RENEW, Self::op_renew);
        ops.insert(OP_RESTOREFH, Self::op_restorefh);
        ops.insert(OP_SAVEFH, Self::op_savefh);
        ops.insert(OP_SETATTR, Self::op_setattr);
        ops.insert(OP_SETCLIENTID, Self::op_setclientid);
        ops.insert(OP_SETCLIENTID_CONFIRM, Self::op_setclientid_confirm);
        ops.insert(OP_VERIFY, Self::op_verify);
        ops.insert(OP_WRITE, Self::op_write);
        ops.insert(OP_RELEASE_LOCKOWNER, Self::op_release_lockowner);

        Ok(Self {
            vfs,
            state,
            root_fh,
            write_verifier,
            next_cb_xid: AtomicU32::new(1),
            ops,
        })
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    fn next_cb_xid(&self) -> u32 {
        self.next_cb_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// CHANGE attribute of a directory for change_info4; 0 when the
    /// attributes cannot be read.
    fn change_of(&self, fh: &FileHandle) -> u64 {
        self.vfs.getattr(fh).map(|a| change_attr(&a)).unwrap_or(0)
    }

    fn encode_change_info(enc: &mut XdrEncoder, before: u64, after: u64) {
        enc.encode_bool(false); // atomic
        enc.encode_u64(before);
        enc.encode_u64(after);
    }

    /// RFC 7530 §16.2 COMPOUND.
    async fn proc_compound(
        &self,
        call: &RpcCallHeader,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> Result<(), ProcError> {
        let tag = args.decode_opaque()?;
        let minorversion = args.decode_u32()?;
        let num_ops = args.decode_u32()?;

        if minorversion != 0 {
            reply.encode_u32(Nfs4Stat::MinorVersMismatch as u32);
            reply.encode_opaque(&tag);
            reply.encode_u32(0);
            return Ok(());
        }

        let mut cs = CompoundState::default();
        if let Some(auth) = call.auth_sys() {
            cs.uid = auth.uid;
            cs.gid = auth.gid;
            cs.gids = auth.gids;
        }

        let mut results: Vec<(u32, Nfs4Stat, Vec<u8>)> = Vec::new();
        let mut last_status = Nfs4Stat::Ok;

        for _ in 0..num_ops {
            let mut opcode = args.decode_u32()?;
            let mut body = XdrEncoder::new();

            let status = match self.ops.get(&opcode) {
                None => {
                    // Unknown opcode: answer as OP_ILLEGAL and stop.
                    opcode = OP_ILLEGAL;
                    Nfs4Stat::OpIllegal
                }
                Some(handler) => match handler(self, &mut cs, args, &mut body) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("COMPOUND op {opcode} failed to decode: {e}");
                        body = XdrEncoder::new();
                        Nfs4Stat::ServerFault
                    }
                },
            };

            // Deferred callback I/O, run outside the state mutex.
            if let Some(clientid) = cs.pending_probe.take() {
                self.probe_callback(clientid).await;
            }
            if let Some(recall) = cs.pending_recall.take() {
                let xid = self.next_cb_xid();
                if !cb_recall(&recall.cb, xid, &recall.stateid, false, &recall.fh).await {
                    warn!("CB_RECALL failed for delegation on {:?}", recall.fh);
                }
            }

            results.push((opcode, status, body.into_inner()));
            last_status = status;
            if status != Nfs4Stat::Ok {
                break;
            }
        }

        reply.encode_u32(last_status as u32);
        reply.encode_opaque(&tag);
        reply.encode_u32(results.len() as u32);
        for (opcode, status, body) in &results {
            reply.encode_u32(*opcode);
            reply.encode_u32(*status as u32);
            reply.encode_opaque_fixed(body);
        }
        Ok(())
    }

    /// CB_NULL probe after SETCLIENTID_CONFIRM; on failure the client's
    /// callback channel is marked invalid and delegations stay off.
    async fn probe_callback(&self, clientid: u64) {
        let Some(cb) = self.state.get_client_callback(clientid) else {
            return;
        };
        if !cb.valid {
            return;
        }
        let xid = self.next_cb_xid();
        if !cb_null_probe(&cb, xid).await {
            warn!("CB_NULL probe failed for client {clientid} at {} — delegations disabled", cb.addr);
            self.state.invalidate_client_callback(clientid);
        }
    }

    // --- filehandle operations ---

    fn op_putrootfh(
        &self,
        cs: &mut CompoundState,
        _args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        cs.current_fh = Some(self.root_fh);
        Ok(Nfs4Stat::Ok)
    }

    fn op_putfh(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let bytes = args.decode_opaque()?;
        match FileHandle::from_bytes(&bytes) {
            Some(fh) => {
                cs.current_fh = Some(fh);
                Ok(Nfs4Stat::Ok)
            }
            None => Ok(Nfs4Stat::BadHandle),
        }
    }

    fn op_getfh(
        &self,
        cs: &mut CompoundState,
        _args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        enc.encode_opaque(fh.as_bytes());
        Ok(Nfs4Stat::Ok)
    }

    fn op_savefh(
        &self,
        cs: &mut CompoundState,
        _args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        cs.saved_fh = Some(fh);
        Ok(Nfs4Stat::Ok)
    }

    fn op_restorefh(
        &self,
        cs: &mut CompoundState,
        _args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.saved_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        cs.current_fh = Some(fh);
        Ok(Nfs4Stat::Ok)
    }

    fn op_lookup(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(dir) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let name = args.decode_string()?;
        if name.is_empty() {
            return Ok(Nfs4Stat::Inval);
        }
        match self.vfs.lookup(&dir, &name) {
            Ok((fh, _)) => {
                cs.current_fh = Some(fh);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_lookupp(
        &self,
        cs: &mut CompoundState,
        _args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(dir) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        match self.vfs.lookup(&dir, "..") {
            Ok((fh, _)) => {
                cs.current_fh = Some(fh);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    // --- read-only operations ---

    fn op_getattr(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let requested = decode_bitmap(args)?;
        match self.vfs.getattr(&fh) {
            Ok(attr) => {
                encode_fattr4(enc, &requested, &attr, &fh);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_access(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let requested = args.decode_u32()?;
        match self.vfs.access(&fh, requested) {
            Ok(granted) => {
                enc.encode_u32(requested); // supported
                enc.encode_u32(granted);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_readlink(
        &self,
        cs: &mut CompoundState,
        _args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        match self.vfs.readlink(&fh) {
            Ok(target) => {
                enc.encode_string(&target);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_readdir(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(dir) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let cookie = args.decode_u64()?;
        let client_verf = args.decode_u64()?;
        let dircount = args.decode_u32()?;
        args.decode_u32()?; // maxcount
        let attr_request = decode_bitmap(args)?;

        let verf = self.change_of(&dir);
        if cookie != 0 && client_verf != 0 && client_verf != verf {
            return Ok(Nfs4Stat::BadCookie);
        }

        let (entries, eof) = match self.vfs.readdir(&dir, cookie, dircount.min(128)) {
            Ok(r) => r,
            Err(s) => return Ok(stat3_to_stat4(s)),
        };

        enc.encode_u64(verf);
        for e in &entries {
            enc.encode_bool(true);
            enc.encode_u64(e.cookie);
            enc.encode_string(&e.name);
            match self.vfs.lookup(&dir, &e.name) {
                Ok((entry_fh, entry_attr)) => {
                    encode_fattr4(enc, &attr_request, &entry_attr, &entry_fh);
                }
                Err(_) => {
                    // Unreadable entry: empty bitmap, empty attr data.
                    encode_bitmap(enc, &[]);
                    enc.encode_u32(0);
                }
            }
        }
        enc.encode_bool(false);
        enc.encode_bool(eof);
        Ok(Nfs4Stat::Ok)
    }

    // --- client state operations ---

    fn op_setclientid(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let mut verifier = [0u8; 8];
        args.decode_opaque_fixed(&mut verifier)?;
        let client_id = args.decode_opaque()?;

        let mut cb = crate::protocol::nfs4::callback::CallbackInfo {
            cb_program: args.decode_u32()?,
            netid: args.decode_string()?,
            addr: args.decode_string()?,
            ident: args.decode_u32()?,
            valid: false,
        };
        cb.valid = !cb.addr.is_empty() && !cb.netid.is_empty();

        let (clientid, confirm) = self.state.set_clientid(verifier, &client_id, cb);
        enc.encode_u64(clientid);
        enc.encode_opaque_fixed(&confirm);
        Ok(Nfs4Stat::Ok)
    }

    fn op_setclientid_confirm(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let clientid = args.decode_u64()?;
        let mut confirm = [0u8; 8];
        args.decode_opaque_fixed(&mut confirm)?;

        if let Err(s) = self.state.confirm_clientid(clientid, &confirm) {
            return Ok(s);
        }
        // Probe the callback path once the mutex is released.
        cs.pending_probe = Some(clientid);
        Ok(Nfs4Stat::Ok)
    }

    fn op_renew(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let clientid = args.decode_u64()?;
        Ok(match self.state.renew(clientid) {
            Ok(()) => Nfs4Stat::Ok,
            Err(s) => s,
        })
    }

    // --- open / close ---

    #[allow(clippy::too_many_lines)]
    fn op_open(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(dir_fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };

        let seqid = args.decode_u32()?;
        let share_access = args.decode_u32()?;
        let share_deny = args.decode_u32()?;
        let clientid = args.decode_u64()?;
        let owner = args.decode_opaque()?;

        let opentype = args.decode_u32()?;
        let mut create_mode = 0u32;
        let mut file_mode = 0o644;
        let mut create_verf = 0u64;
        if opentype == OPEN4_CREATE {
            create_mode = args.decode_u32()?;
            match create_mode {
                UNCHECKED4 | GUARDED4 => {
                    let (sa, _) = decode_fattr4_setattr(args)?;
                    if let Some(mode) = sa.mode {
                        file_mode = mode;
                    }
                }
                EXCLUSIVE4 => {
                    create_verf = args.decode_u64()?;
                }
                _ => return Ok(Nfs4Stat::Inval),
            }
        }

        let claim_type = args.decode_u32()?;
        let mut reclaim_current = false;
        let name = match claim_type {
            CLAIM_NULL => {
                let name = args.decode_string()?;
                if name.is_empty() {
                    return Ok(Nfs4Stat::Inval);
                }
                name
            }
            CLAIM_PREVIOUS => {
                args.decode_u32()?; // delegate_type
                if !self.state.in_grace_period() {
                    return Ok(Nfs4Stat::NoGrace);
                }
                // Reclaim: the file is the current filehandle itself.
                reclaim_current = true;
                String::new()
            }
            CLAIM_DELEGATE_CUR => {
                let deleg_sid = StateId::decode(args)?;
                let name = args.decode_string()?;
                if name.is_empty() {
                    return Ok(Nfs4Stat::Inval);
                }
                if let Err(s) = self.state.validate_stateid(&deleg_sid, share_access) {
                    return Ok(s);
                }
                name
            }
            CLAIM_DELEGATE_PREV => {
                args.decode_string()?;
                return Ok(Nfs4Stat::NoGrace);
            }
            _ => return Ok(Nfs4Stat::NotSupp),
        };

        let change_before = self.change_of(&dir_fh);

        let file_fh = if reclaim_current {
            dir_fh
        } else {
            let looked_up = self.vfs.lookup(&dir_fh, &name);
            if opentype == OPEN4_CREATE {
                match (&looked_up, create_mode) {
                    (Ok(_), GUARDED4) => return Ok(Nfs4Stat::Exist),
                    (Ok((fh, attr)), EXCLUSIVE4) => {
                        // EXCLUSIVE4 replay detection: the verifier was
                        // stored in the timestamps at creation.
                        let v_hi = (create_verf >> 32) as u32;
                        let v_lo = create_verf as u32;
                        if attr.atime.seconds != v_hi || attr.mtime.seconds != v_lo {
                            return Ok(Nfs4Stat::Exist);
                        }
                        *fh
                    }
                    (Ok((fh, _)), _) => *fh,
                    (Err(_), _) => {
                        let (fh, _) = match self.vfs.create(&dir_fh, &name, file_mode) {
                            Ok(r) => r,
                            Err(s) => return Ok(stat3_to_stat4(s)),
                        };
                        if create_mode == EXCLUSIVE4 {
                            let sa = SetAttr {
                                atime: SetTime::ClientTime(NfsTime {
                                    seconds: (create_verf >> 32) as u32,
                                    nseconds: 0,
                                }),
                                mtime: SetTime::ClientTime(NfsTime {
                                    seconds: create_verf as u32,
                                    nseconds: 0,
                                }),
                                ..SetAttr::default()
                            };
                            let _ = self.vfs.setattr(&fh, &sa);
                        }
                        fh
                    }
                }
            } else {
                match looked_up {
                    Ok((fh, _)) => fh,
                    Err(s) => return Ok(stat3_to_stat4(s)),
                }
            }
        };

        let grant =
            match self.state.open_file(clientid, &owner, seqid, &file_fh, share_access, share_deny)
            {
                Ok(grant) => grant,
                Err(OpenError::DelegationConflict(recall)) => {
                    // The conflicting delegation is being recalled; the
                    // client retries once the holder returns it.
                    cs.pending_recall = recall;
                    return Ok(Nfs4Stat::Delay);
                }
                Err(OpenError::Status(s)) => return Ok(s),
            };

        cs.current_fh = Some(file_fh);
        let change_after = self.change_of(&dir_fh);

        grant.stateid.encode(enc);
        Self::encode_change_info(enc, change_before, change_after);
        let mut rflags = 0;
        if grant.needs_confirm {
            rflags |= OPEN4_RESULT_CONFIRM;
        }
        enc.encode_u32(rflags);
        encode_bitmap(enc, &[]); // attrset

        match grant.delegation {
            None => enc.encode_u32(OPEN_DELEGATE_NONE),
            Some(d) if d.deleg_type == OPEN_DELEGATE_READ => {
                enc.encode_u32(OPEN_DELEGATE_READ);
                d.stateid.encode(enc);
                enc.encode_bool(false); // recall
                // nfsace4: ALLOW, no flags, READ_DATA, everyone
                enc.encode_u32(0);
                enc.encode_u32(0);
                enc.encode_u32(attrs::ACE4_READ_DATA);
                enc.encode_string("");
            }
            Some(d) => {
                enc.encode_u32(OPEN_DELEGATE_WRITE);
                d.stateid.encode(enc);
                enc.encode_bool(false);
                // space_limit: by size, unlimited
                enc.encode_u32(NFS_LIMIT_SIZE);
                enc.encode_u64(u64::MAX);
                enc.encode_u32(0);
                enc.encode_u32(0);
                enc.encode_u32(attrs::ACE4_WRITE_DATA | attrs::ACE4_APPEND_DATA);
                enc.encode_string("");
            }
        }

        Ok(Nfs4Stat::Ok)
    }

    fn op_open_confirm(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let stateid = StateId::decode(args)?;
        let seqid = args.decode_u32()?;
        match self.state.confirm_open(&stateid, seqid) {
            Ok(out) => {
                out.encode(enc);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(s),
        }
    }

    fn op_open_downgrade(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let stateid = StateId::decode(args)?;
        let seqid = args.decode_u32()?;
        let access = args.decode_u32()?;
        let deny = args.decode_u32()?;
        match self.state.open_downgrade(&stateid, seqid, access, deny) {
            Ok(out) => {
                out.encode(enc);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(s),
        }
    }

    fn op_close(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let seqid = args.decode_u32()?;
        let stateid = StateId::decode(args)?;
        match self.state.close_file(&stateid, seqid) {
            Ok(out) => {
                out.encode(enc);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(s),
        }
    }

    // --- byte-range locking ---

    fn encode_lock_denied(enc: &mut XdrEncoder, denied: &LockDenied) {
        enc.encode_u64(denied.offset);
        enc.encode_u64(denied.length);
        enc.encode_u32(denied.locktype);
        enc.encode_u64(denied.owner.clientid);
        enc.encode_opaque(&denied.owner.owner);
    }

    fn op_lock(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };

        let mut locktype = args.decode_u32()?;
        let reclaim = args.decode_bool()?;
        let offset = args.decode_u64()?;
        let length = args.decode_u64()?;
        let new_lock_owner = args.decode_bool()?;

        // The server never blocks; the waiting variants degrade to their
        // immediate forms.
        if locktype == READW_LT {
            locktype = READ_LT;
        }
        if locktype == WRITEW_LT {
            locktype = WRITE_LT;
        }

        if reclaim {
            return Ok(Nfs4Stat::NoGrace);
        }

        let result = if new_lock_owner {
            let open_seqid = args.decode_u32()?;
            let open_stateid = StateId::decode(args)?;
            let lock_seqid = args.decode_u32()?;
            let clientid = args.decode_u64()?;
            let owner = args.decode_opaque()?;

            let lock_owner = LockOwner { clientid, owner };
            self.state.lock_new(
                clientid,
                &open_stateid,
                open_seqid,
                &lock_owner,
                lock_seqid,
                &fh,
                locktype,
                offset,
                length,
            )
        } else {
            let lock_stateid = StateId::decode(args)?;
            let lock_seqid = args.decode_u32()?;
            self.state.lock_existing(&lock_stateid, lock_seqid, locktype, offset, length)
        };

        match result {
            Ok(stateid) => {
                stateid.encode(enc);
                Ok(Nfs4Stat::Ok)
            }
            Err(LockError::Denied(denied)) => {
                Self::encode_lock_denied(enc, &denied);
                Ok(Nfs4Stat::Denied)
            }
            Err(LockError::Status(s)) => Ok(s),
        }
    }

    fn op_lockt(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let mut locktype = args.decode_u32()?;
        let offset = args.decode_u64()?;
        let length = args.decode_u64()?;
        let clientid = args.decode_u64()?;
        let owner = args.decode_opaque()?;

        if locktype == READW_LT {
            locktype = READ_LT;
        }
        if locktype == WRITEW_LT {
            locktype = WRITE_LT;
        }

        let lock_owner = LockOwner { clientid, owner };
        match self.state.lock_test(&fh, locktype, offset, length, &lock_owner) {
            Ok(()) => Ok(Nfs4Stat::Ok),
            Err(LockError::Denied(denied)) => {
                Self::encode_lock_denied(enc, &denied);
                Ok(Nfs4Stat::Denied)
            }
            Err(LockError::Status(s)) => Ok(s),
        }
    }

    fn op_locku(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        args.decode_u32()?; // locktype, unused for unlock
        let seqid = args.decode_u32()?;
        let lock_stateid = StateId::decode(args)?;
        let offset = args.decode_u64()?;
        let length = args.decode_u64()?;

        match self.state.lock_unlock(&lock_stateid, seqid, offset, length) {
            Ok(out) => {
                out.encode(enc);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(s),
        }
    }

    fn op_release_lockowner(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let clientid = args.decode_u64()?;
        let owner = args.decode_opaque()?;
        self.state.release_lock_owner(&LockOwner { clientid, owner });
        Ok(Nfs4Stat::Ok)
    }

    // --- delegations ---

    fn op_delegreturn(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let stateid = StateId::decode(args)?;
        Ok(match self.state.delegreturn(&stateid) {
            Ok(()) => Nfs4Stat::Ok,
            Err(s) => s,
        })
    }

    fn op_delegpurge(
        &self,
        _cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        let clientid = args.decode_u64()?;
        Ok(match self.state.delegpurge(clientid) {
            Ok(()) => Nfs4Stat::Ok,
            Err(s) => s,
        })
    }

    // --- data operations ---

    fn op_read(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let stateid = StateId::decode(args)?;
        let offset = args.decode_u64()?;
        let count = args.decode_u32()?;

        if let Err(s) = self.state.validate_stateid(&stateid, OPEN4_SHARE_ACCESS_READ) {
            return Ok(s);
        }
        match self.vfs.read(&fh, offset, count) {
            Ok((data, eof)) => {
                enc.encode_bool(eof);
                enc.encode_opaque(&data);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_write(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let stateid = StateId::decode(args)?;
        let offset = args.decode_u64()?;
        let stable = args.decode_u32()?;
        let data = args.decode_opaque()?;

        if let Err(s) = self.state.validate_stateid(&stateid, OPEN4_SHARE_ACCESS_WRITE) {
            return Ok(s);
        }
        match self.vfs.write(&fh, offset, &data) {
            Ok(written) => {
                enc.encode_u32(written);
                enc.encode_u32(stable); // echo the committed level
                enc.encode_u64(self.write_verifier);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_commit(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let offset = args.decode_u64()?;
        let count = args.decode_u32()?;
        match self.vfs.commit(&fh, offset, count) {
            Ok(()) => {
                enc.encode_u64(self.write_verifier);
                Ok(Nfs4Stat::Ok)
            }
            Err(s) => Ok(stat3_to_stat4(s)),
        }
    }

    fn op_setattr(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let _stateid = StateId::decode(args)?;
        let (sa, _) = decode_fattr4_setattr(args)?;

        if let Err(s) = self.vfs.setattr(&fh, &sa) {
            return Ok(stat3_to_stat4(s));
        }

        let mut attrsset = Vec::new();
        if sa.mode.is_some() {
            bitmap_set(&mut attrsset, FATTR4_MODE);
        }
        if sa.size.is_some() {
            bitmap_set(&mut attrsset, FATTR4_SIZE);
        }
        encode_bitmap(enc, &attrsset);
        Ok(Nfs4Stat::Ok)
    }

    // --- directory mutations ---

    fn op_create(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(dir_fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };

        let obj_type = args.decode_u32()?;
        let mut linkdata = String::new();
        match obj_type {
            5 => linkdata = args.decode_string()?, // NF4LNK
            3 | 4 => {
                args.decode_u32()?; // specdata major
                args.decode_u32()?; // specdata minor
            }
            _ => {}
        }

        let name = args.decode_string()?;
        if name.is_empty() {
            return Ok(Nfs4Stat::Inval);
        }
        let (sa, _) = decode_fattr4_setattr(args)?;
        let mode = sa.mode.unwrap_or(0o755);

        let change_before = self.change_of(&dir_fh);

        let created = match obj_type {
            2 => self.vfs.mkdir(&dir_fh, &name, mode),      // NF4DIR
            5 => self.vfs.symlink(&dir_fh, &name, &linkdata), // NF4LNK
            _ => return Ok(Nfs4Stat::NotSupp),
        };
        let (fh, _) = match created {
            Ok(r) => r,
            Err(s) => return Ok(stat3_to_stat4(s)),
        };

        cs.current_fh = Some(fh);
        let change_after = self.change_of(&dir_fh);
        Self::encode_change_info(enc, change_before, change_after);
        encode_bitmap(enc, &[]); // attrset
        Ok(Nfs4Stat::Ok)
    }

    fn op_remove(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let Some(dir_fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let name = args.decode_string()?;
        if name.is_empty() {
            return Ok(Nfs4Stat::Inval);
        }

        let change_before = self.change_of(&dir_fh);

        // Try unlink first, fall back to rmdir for directories.
        let mut result = self.vfs.remove(&dir_fh, &name);
        if matches!(result, Err(crate::vfs::NfsStat3::Isdir) | Err(crate::vfs::NfsStat3::Perm)) {
            result = self.vfs.rmdir(&dir_fh, &name);
        }
        if let Err(s) = result {
            return Ok(stat3_to_stat4(s));
        }

        let change_after = self.change_of(&dir_fh);
        Self::encode_change_info(enc, change_before, change_after);
        Ok(Nfs4Stat::Ok)
    }

    fn op_rename(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let (Some(src_dir), Some(dst_dir)) = (cs.saved_fh, cs.current_fh) else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let oldname = args.decode_string()?;
        let newname = args.decode_string()?;
        if oldname.is_empty() || newname.is_empty() {
            return Ok(Nfs4Stat::Inval);
        }

        let src_before = self.change_of(&src_dir);
        let dst_before = self.change_of(&dst_dir);

        if let Err(s) = self.vfs.rename(&src_dir, &oldname, &dst_dir, &newname) {
            return Ok(stat3_to_stat4(s));
        }

        Self::encode_change_info(enc, src_before, self.change_of(&src_dir));
        Self::encode_change_info(enc, dst_before, self.change_of(&dst_dir));
        Ok(Nfs4Stat::Ok)
    }

    fn op_link(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        enc: &mut XdrEncoder,
    ) -> OpResult {
        let (Some(src_file), Some(dst_dir)) = (cs.saved_fh, cs.current_fh) else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let newname = args.decode_string()?;
        if newname.is_empty() {
            return Ok(Nfs4Stat::Inval);
        }

        let change_before = self.change_of(&dst_dir);
        if let Err(s) = self.vfs.link(&src_file, &dst_dir, &newname) {
            return Ok(stat3_to_stat4(s));
        }
        Self::encode_change_info(enc, change_before, self.change_of(&dst_dir));
        Ok(Nfs4Stat::Ok)
    }

    // --- VERIFY / NVERIFY ---

    /// Encode the server's view of the requested attributes and compare
    /// the opaque bodies bytewise against the client's.
    fn verify_common(&self, cs: &mut CompoundState, args: &mut XdrDecoder<'_>) -> OpResult {
        let Some(fh) = cs.current_fh else {
            return Ok(Nfs4Stat::NoFilehandle);
        };
        let client_bm = decode_bitmap(args)?;
        let client_attr_data = args.decode_opaque()?;

        let attr = match self.vfs.getattr(&fh) {
            Ok(attr) => attr,
            Err(s) => return Ok(stat3_to_stat4(s)),
        };

        let mut server_enc = XdrEncoder::new();
        encode_fattr4(&mut server_enc, &client_bm, &attr, &fh);
        let mut server_dec = XdrDecoder::new(server_enc.data());
        decode_bitmap(&mut server_dec)?;
        let server_attr_data = server_dec.decode_opaque()?;

        Ok(if client_attr_data == server_attr_data { Nfs4Stat::Ok } else { Nfs4Stat::NotSame })
    }

    fn op_verify(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        self.verify_common(cs, args)
    }

    fn op_nverify(
        &self,
        cs: &mut CompoundState,
        args: &mut XdrDecoder<'_>,
        _enc: &mut XdrEncoder,
    ) -> OpResult {
        Ok(match self.verify_common(cs, args)? {
            Nfs4Stat::Ok => Nfs4Stat::Same,
            Nfs4Stat::NotSame => Nfs4Stat::Ok,
            other => other,
        })
    }
}

#[async_trait]
impl RpcProgram for Nfs4Server {
    async fn handle(
        &self,
        call: &RpcCallHeader,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> Result<(), ProcError> {
        match call.procedure {
            NFSPROC4_NULL => Ok(()),
            NFSPROC4_COMPOUND => {
                debug!("COMPOUND from xid {}", call.xid);
                self.proc_compound(call, args, reply).await
            }
            _ => Err(ProcError::Unavail),
        }
    }
}
