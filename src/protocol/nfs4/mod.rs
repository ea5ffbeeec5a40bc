//! NFS version 4.0 protocol (RFC 7530).
//!
//! The protocol has two RPC procedures: NULL and COMPOUND. Everything of
//! substance lives in the COMPOUND operation set ([`server`]), the client
//! and open/lock/delegation state machine ([`state`]), the bitmap-indexed
//! attribute codec ([`attrs`]) and the reverse-direction callback channel
//! ([`callback`]).

use num_derive::{FromPrimitive, ToPrimitive};

use crate::protocol::xdr::{XdrDecoder, XdrEncoder, XdrResult};
use crate::vfs::{FileType, NfsStat3};

pub mod attrs;
pub mod callback;
pub mod server;
pub mod state;

pub const VERSION: u32 = 4;

pub const NFSPROC4_NULL: u32 = 0;
pub const NFSPROC4_COMPOUND: u32 = 1;

/// RFC 7530 §16.2 COMPOUND operation opcodes.
pub const OP_ACCESS: u32 = 3;
pub const OP_CLOSE: u32 = 4;
pub const OP_COMMIT: u32 = 5;
pub const OP_CREATE: u32 = 6;
pub const OP_DELEGPURGE: u32 = 7;
pub const OP_DELEGRETURN: u32 = 8;
pub const OP_GETATTR: u32 = 9;
pub const OP_GETFH: u32 = 10;
pub const OP_LINK: u32 = 11;
pub const OP_LOCK: u32 = 12;
pub const OP_LOCKT: u32 = 13;
pub const OP_LOCKU: u32 = 14;
pub const OP_LOOKUP: u32 = 15;
pub const OP_LOOKUPP: u32 = 16;
pub const OP_NVERIFY: u32 = 17;
pub const OP_OPEN: u32 = 18;
pub const OP_OPEN_CONFIRM: u32 = 20;
pub const OP_OPEN_DOWNGRADE: u32 = 21;
pub const OP_PUTFH: u32 = 22;
pub const OP_PUTROOTFH: u32 = 24;
pub const OP_READ: u32 = 25;
pub const OP_READDIR: u32 = 26;
pub const OP_READLINK: u32 = 27;
pub const OP_REMOVE: u32 = 28;
pub const OP_RENAME: u32 = 29;
pub const OP_RENEW: u32 = 30;
pub const OP_RESTOREFH: u32 = 31;
pub const OP_SAVEFH: u32 = 32;
pub const OP_SECINFO: u32 = 33;
pub const OP_SETATTR: u32 = 34;
pub const OP_SETCLIENTID: u32 = 35;
pub const OP_SETCLIENTID_CONFIRM: u32 = 36;
pub const OP_VERIFY: u32 = 37;
pub const OP_WRITE: u32 = 38;
pub const OP_RELEASE_LOCKOWNER: u32 = 39;
pub const OP_ILLEGAL: u32 = 10044;

/// RFC 7530 §13 status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Nfs4Stat {
    Ok = 0,
    Perm = 1,
    Noent = 2,
    Io = 5,
    Nxio = 6,
    Access = 13,
    Exist = 17,
    Xdev = 18,
    Notdir = 20,
    Isdir = 21,
    Inval = 22,
    Fbig = 27,
    Nospc = 28,
    Rofs = 30,
    Mlink = 31,
    NameTooLong = 63,
    NotEmpty = 66,
    Dquot = 69,
    Stale = 70,
    BadHandle = 10001,
    BadCookie = 10003,
    NotSupp = 10004,
    TooSmall = 10005,
    ServerFault = 10006,
    BadType = 10007,
    Delay = 10008,
    Same = 10009,
    Denied = 10010,
    Expired = 10011,
    StaleClientid = 10012,
    Grace = 10013,
    FhExpired = 10014,
    WrongSec = 10016,
    Resource = 10018,
    NoFilehandle = 10020,
    MinorVersMismatch = 10021,
    StaleStateid = 10023,
    OldStateid = 10024,
    BadStateid = 10025,
    BadSeqid = 10026,
    NotSame = 10027,
    LockRange = 10028,
    NoGrace = 10033,
    LocksHeld = 10037,
    OpIllegal = 10044,
}

/// RFC 7530 §16.16 share access/deny bits.
pub const OPEN4_SHARE_ACCESS_READ: u32 = 1;
pub const OPEN4_SHARE_ACCESS_WRITE: u32 = 2;
pub const OPEN4_SHARE_ACCESS_BOTH: u32 = 3;
pub const OPEN4_SHARE_DENY_NONE: u32 = 0;

/// RFC 7530 §16.16 opentype4.
pub const OPEN4_NOCREATE: u32 = 0;
pub const OPEN4_CREATE: u32 = 1;

/// RFC 7530 §16.16 createmode4.
pub const UNCHECKED4: u32 = 0;
pub const GUARDED4: u32 = 1;
pub const EXCLUSIVE4: u32 = 2;

/// RFC 7530 §16.16 open_claim_type4.
pub const CLAIM_NULL: u32 = 0;
pub const CLAIM_PREVIOUS: u32 = 1;
pub const CLAIM_DELEGATE_CUR: u32 = 2;
pub const CLAIM_DELEGATE_PREV: u32 = 3;

/// RFC 7530 §16.16 result flag: the open must be confirmed.
pub const OPEN4_RESULT_CONFIRM: u32 = 0x0000_0002;

/// RFC 7530 §16.16 open_delegation_type4.
pub const OPEN_DELEGATE_NONE: u32 = 0;
pub const OPEN_DELEGATE_READ: u32 = 1;
pub const OPEN_DELEGATE_WRITE: u32 = 2;

/// RFC 7530 §16.10 nfs_lock_type4.
pub const READ_LT: u32 = 1;
pub const WRITE_LT: u32 = 2;
pub const READW_LT: u32 = 3;
pub const WRITEW_LT: u32 = 4;

/// RFC 7530 §16.16 space-limit discriminant for write delegations.
pub const NFS_LIMIT_SIZE: u32 = 1;

/// Filehandles never expire.
pub const FH4_PERSISTENT: u32 = 0;

/// RFC 7530 §15.3 callback program and opcodes.
pub const NFS4_CALLBACK: u32 = 0x4000_0000;
pub const CB_NULL: u32 = 0;
pub const CB_COMPOUND: u32 = 1;
pub const OP_CB_RECALL: u32 = 4;

/// Client lease window, seconds.
pub const NFS4_LEASE_TIME: u32 = 90;

/// RFC 7530 §3.2 stateid4: a u32 sequence and 12 server-chosen bytes that
/// name exactly one open, lock or delegation record while it exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateId {
    pub seqid: u32,
    pub other: [u8; 12],
}

impl StateId {
    /// Anonymous stateid: all zeros.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// READ bypass stateid: seqid 0, other all ones.
    pub fn bypass() -> Self {
        Self { seqid: 0, other: [0xFF; 12] }
    }

    /// "Current stateid" marker: seqid u32::MAX, other all ones.
    pub fn current() -> Self {
        Self { seqid: u32::MAX, other: [0xFF; 12] }
    }

    /// Special stateids are always valid and never looked up.
    pub fn is_special(&self) -> bool {
        (self.seqid == 0 && self.other == [0u8; 12])
            || (self.seqid == 0 && self.other == [0xFF; 12])
            || (self.seqid == u32::MAX && self.other == [0xFF; 12])
    }

    pub fn encode(&self, enc: &mut XdrEncoder) {
        enc.encode_u32(self.seqid);
        enc.encode_opaque_fixed(&self.other);
    }

    pub fn decode(dec: &mut XdrDecoder<'_>) -> XdrResult<Self> {
        let seqid = dec.decode_u32()?;
        let mut other = [0u8; 12];
        dec.decode_opaque_fixed(&mut other)?;
        Ok(Self { seqid, other })
    }
}

/// Map a VFS status onto the NFSv4 status space. Most codes are
/// numerically identical between v3 and v4.
pub fn stat3_to_stat4(s: NfsStat3) -> Nfs4Stat {
    match s {
        NfsStat3::Ok => Nfs4Stat::Ok,
        NfsStat3::Perm => Nfs4Stat::Perm,
        NfsStat3::Noent => Nfs4Stat::Noent,
        NfsStat3::Io => Nfs4Stat::Io,
        NfsStat3::Nxio => Nfs4Stat::Nxio,
        NfsStat3::Acces => Nfs4Stat::Access,
        NfsStat3::Exist => Nfs4Stat::Exist,
        NfsStat3::Xdev => Nfs4Stat::Xdev,
        NfsStat3::Nodev => Nfs4Stat::Inval,
        NfsStat3::Notdir => Nfs4Stat::Notdir,
        NfsStat3::Isdir => Nfs4Stat::Isdir,
        NfsStat3::Inval => Nfs4Stat::Inval,
        NfsStat3::Fbig => Nfs4Stat::Fbig,
        NfsStat3::Nospc => Nfs4Stat::Nospc,
        NfsStat3::Rofs => Nfs4Stat::Rofs,
        NfsStat3::Mlink => Nfs4Stat::Mlink,
        NfsStat3::NameTooLong => Nfs4Stat::NameTooLong,
        NfsStat3::NotEmpty => Nfs4Stat::NotEmpty,
        NfsStat3::Dquot => Nfs4Stat::Dquot,
        NfsStat3::Stale => Nfs4Stat::Stale,
        NfsStat3::BadHandle => Nfs4Stat::BadHandle,
        NfsStat3::NotSync => Nfs4Stat::Inval,
        NfsStat3::BadCookie => Nfs4Stat::BadCookie,
        NfsStat3::NotSupp => Nfs4Stat::NotSupp,
        NfsStat3::TooSmall => Nfs4Stat::TooSmall,
        NfsStat3::ServerFault => Nfs4Stat::ServerFault,
    }
}

/// nfs_ftype4 values happen to match ftype3 for the types both speak.
pub fn ftype_to_nfs4(t: FileType) -> u32 {
    t as u32
}
