//! NFS version 3 protocol server (RFC 1813).
//!
//! All 22 procedures are implemented in [`procs`]; this module owns the
//! dispatch table and the XDR helpers every procedure leans on:
//! `fattr3` encoding, `post_op_attr`, weak-cache-consistency (`wcc_data`)
//! and `sattr3` decoding. For mutating procedures the handler snapshots
//! the target's attributes before the mutation and threads that snapshot
//! into the `wcc_data` of the reply.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::protocol::rpc::{ProcError, RpcCallHeader, RpcProgram};
use crate::protocol::xdr::{XdrDecoder, XdrEncoder, XdrError, XdrResult};
use crate::vfs::{Fattr, FileHandle, NfsStat3, NfsTime, SetAttr, SetTime, Vfs};

mod procs;

pub const VERSION: u32 = 3;

pub const NFSPROC3_NULL: u32 = 0;
pub const NFSPROC3_GETATTR: u32 = 1;
pub const NFSPROC3_SETATTR: u32 = 2;
pub const NFSPROC3_LOOKUP: u32 = 3;
pub const NFSPROC3_ACCESS: u32 = 4;
pub const NFSPROC3_READLINK: u32 = 5;
pub const NFSPROC3_READ: u32 = 6;
pub const NFSPROC3_WRITE: u32 = 7;
pub const NFSPROC3_CREATE: u32 = 8;
pub const NFSPROC3_MKDIR: u32 = 9;
pub const NFSPROC3_SYMLINK: u32 = 10;
pub const NFSPROC3_MKNOD: u32 = 11;
pub const NFSPROC3_REMOVE: u32 = 12;
pub const NFSPROC3_RMDIR: u32 = 13;
pub const NFSPROC3_RENAME: u32 = 14;
pub const NFSPROC3_LINK: u32 = 15;
pub const NFSPROC3_READDIR: u32 = 16;
pub const NFSPROC3_READDIRPLUS: u32 = 17;
pub const NFSPROC3_FSSTAT: u32 = 18;
pub const NFSPROC3_FSINFO: u32 = 19;
pub const NFSPROC3_PATHCONF: u32 = 20;
pub const NFSPROC3_COMMIT: u32 = 21;

/// RFC 1813 §3.3.8 createmode3.
pub const CREATE_UNCHECKED: u32 = 0;
pub const CREATE_GUARDED: u32 = 1;
pub const CREATE_EXCLUSIVE: u32 = 2;

/// Cap on entries returned by a single READDIR/READDIRPLUS.
pub const READDIR_MAX_ENTRIES: u32 = 128;

pub struct Nfs3Server {
    vfs: Arc<dyn Vfs>,
    /// Session nonce echoed in WRITE and COMMIT replies; changes on
    /// restart so clients can detect lost unstable writes.
    write_verifier: u64,
}

impl Nfs3Server {
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        let write_verifier = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self { vfs, write_verifier }
    }

    pub(crate) fn vfs(&self) -> &dyn Vfs {
        self.vfs.as_ref()
    }

    pub(crate) fn write_verifier(&self) -> u64 {
        self.write_verifier
    }
}

#[async_trait]
impl RpcProgram for Nfs3Server {
    async fn handle(
        &self,
        call: &RpcCallHeader,
        args: &mut XdrDecoder<'_>,
        reply: &mut XdrEncoder,
    ) -> Result<(), ProcError> {
        match call.procedure {
            NFSPROC3_NULL => Ok(()),
            NFSPROC3_GETATTR => Ok(self.proc_getattr(args, reply)?),
            NFSPROC3_SETATTR => Ok(self.proc_setattr(args, reply)?),
            NFSPROC3_LOOKUP => Ok(self.proc_lookup(args, reply)?),
            NFSPROC3_ACCESS => Ok(self.proc_access(args, reply)?),
            NFSPROC3_READLINK => Ok(self.proc_readlink(args, reply)?),
            NFSPROC3_READ => Ok(self.proc_read(args, reply)?),
            NFSPROC3_WRITE => Ok(self.proc_write(args, reply)?),
            NFSPROC3_CREATE => Ok(self.proc_create(args, reply)?),
            NFSPROC3_MKDIR => Ok(self.proc_mkdir(args, reply)?),
            NFSPROC3_SYMLINK => Ok(self.proc_symlink(args, reply)?),
            NFSPROC3_MKNOD => Ok(self.proc_mknod(args, reply)?),
            NFSPROC3_REMOVE => Ok(self.proc_remove(args, reply)?),
            NFSPROC3_RMDIR => Ok(self.proc_rmdir(args, reply)?),
            NFSPROC3_RENAME => Ok(self.proc_rename(args, reply)?),
            NFSPROC3_LINK => Ok(self.proc_link(args, reply)?),
            NFSPROC3_READDIR => Ok(self.proc_readdir(args, reply)?),
            NFSPROC3_READDIRPLUS => Ok(self.proc_readdirplus(args, reply)?),
            NFSPROC3_FSSTAT => Ok(self.proc_fsstat(args, reply)?),
            NFSPROC3_FSINFO => Ok(self.proc_fsinfo(args, reply)?),
            NFSPROC3_PATHCONF => Ok(self.proc_pathconf(args, reply)?),
            NFSPROC3_COMMIT => Ok(self.proc_commit(args, reply)?),
            _ => Err(ProcError::Unavail),
        }
    }
}

/// Decode an nfs_fh3 (variable-length opaque). Oversized handles are a
/// protocol violation and decode to the BADHANDLE status via `None`.
pub(crate) fn decode_fh(dec: &mut XdrDecoder<'_>) -> XdrResult<Option<FileHandle>> {
    let bytes = dec.decode_opaque()?;
    Ok(FileHandle::from_bytes(&bytes))
}

pub(crate) fn encode_fattr3(enc: &mut XdrEncoder, attr: &Fattr) {
    enc.encode_u32(attr.ftype as u32);
    enc.encode_u32(attr.mode);
    enc.encode_u32(attr.nlink);
    enc.encode_u32(attr.uid);
    enc.encode_u32(attr.gid);
    enc.encode_u64(attr.size);
    enc.encode_u64(attr.used);
    enc.encode_u32(attr.rdev_major);
    enc.encode_u32(attr.rdev_minor);
    enc.encode_u64(attr.fsid);
    enc.encode_u64(attr.fileid);
    encode_nfstime3(enc, attr.atime);
    encode_nfstime3(enc, attr.mtime);
    encode_nfstime3(enc, attr.ctime);
}

pub(crate) fn encode_nfstime3(enc: &mut XdrEncoder, t: NfsTime) {
    enc.encode_u32(t.seconds);
    enc.encode_u32(t.nseconds);
}

/// post_op_attr: `TRUE + fattr3` when attributes are available, `FALSE`
/// otherwise.
pub(crate) fn encode_post_op_attr(enc: &mut XdrEncoder, vfs: &dyn Vfs, fh: &FileHandle) {
    match vfs.getattr(fh) {
        Ok(attr) => {
            enc.encode_bool(true);
            encode_fattr3(enc, &attr);
        }
        Err(_) => enc.encode_bool(false),
    }
}

/// wcc_data: optional pre-op size/mtime/ctime snapshot followed by the
/// post-op attributes.
pub(crate) fn encode_wcc_data(
    enc: &mut XdrEncoder,
    vfs: &dyn Vfs,
    fh: &FileHandle,
    pre: Option<&Fattr>,
) {
    match pre {
        Some(attr) => {
            enc.encode_bool(true);
            enc.encode_u64(attr.size);
            encode_nfstime3(enc, attr.mtime);
            encode_nfstime3(enc, attr.ctime);
        }
        None => enc.encode_bool(false),
    }
    encode_post_op_attr(enc, vfs, fh);
}

/// Decode sattr3 (RFC 1813 §2.5): each field is a discriminated optional,
/// the two times carry a three-way `how`.
pub(crate) fn decode_sattr3(dec: &mut XdrDecoder<'_>) -> XdrResult<SetAttr> {
    let mut sa = SetAttr::default();
    if dec.decode_bool()? {
        sa.mode = Some(dec.decode_u32()?);
    }
    if dec.decode_bool()? {
        sa.uid = Some(dec.decode_u32()?);
    }
    if dec.decode_bool()? {
        sa.gid = Some(dec.decode_u32()?);
    }
    if dec.decode_bool()? {
        sa.size = Some(dec.decode_u64()?);
    }
    sa.atime = decode_time_how(dec)?;
    sa.mtime = decode_time_how(dec)?;
    Ok(sa)
}

fn decode_time_how(dec: &mut XdrDecoder<'_>) -> XdrResult<SetTime> {
    match dec.decode_u32()? {
        0 => Ok(SetTime::DontChange),
        1 => Ok(SetTime::ServerTime),
        2 => Ok(SetTime::ClientTime(NfsTime {
            seconds: dec.decode_u32()?,
            nseconds: dec.decode_u32()?,
        })),
        _ => Err(XdrError::InvalidValue("time_how discriminant")),
    }
}

/// Cookie verifier for READDIR: the directory mtime packed into 64 bits.
/// Changes whenever the directory is modified, which is what invalidates
/// outstanding cookies.
pub(crate) fn directory_cookieverf(vfs: &dyn Vfs, dir: &FileHandle) -> u64 {
    vfs.getattr(dir)
        .map(|a| (u64::from(a.mtime.seconds) << 32) | u64::from(a.mtime.nseconds))
        .unwrap_or(0)
}

pub(crate) fn encode_status(enc: &mut XdrEncoder, status: NfsStat3) {
    enc.encode_u32(status as u32);
}
