//! Bitmap-indexed fattr4 attribute codec (RFC 7530 §5).
//!
//! A fattr4 on the wire is a bitmap followed by the attribute values as
//! one variable-length opaque, concatenated in strict ascending bit
//! order. GETATTR intersects the request with the server's supported set;
//! SETATTR decodes only the attributes a client may set. The ACL
//! attribute is synthesized from (and folded back into) the POSIX mode.

use std::ffi::CStr;

use crate::protocol::nfs4::{ftype_to_nfs4, FH4_PERSISTENT, NFS4_LEASE_TIME};
use crate::protocol::xdr::{
    bitmap_isset, bitmap_set, decode_bitmap, encode_bitmap, XdrDecoder, XdrEncoder, XdrResult,
};
use crate::vfs::{Fattr, FileHandle, FileType, NfsTime, SetAttr, SetTime};

// RFC 7531 attribute bit positions, word 0.
pub const FATTR4_SUPPORTED_ATTRS: u32 = 0;
pub const FATTR4_TYPE: u32 = 1;
pub const FATTR4_FH_EXPIRE_TYPE: u32 = 2;
pub const FATTR4_CHANGE: u32 = 3;
pub const FATTR4_SIZE: u32 = 4;
pub const FATTR4_LINK_SUPPORT: u32 = 5;
pub const FATTR4_SYMLINK_SUPPORT: u32 = 6;
pub const FATTR4_NAMED_ATTR: u32 = 7;
pub const FATTR4_FSID: u32 = 8;
pub const FATTR4_UNIQUE_HANDLES: u32 = 9;
pub const FATTR4_LEASE_TIME: u32 = 10;
pub const FATTR4_RDATTR_ERROR: u32 = 11;
pub const FATTR4_ACL: u32 = 12;
pub const FATTR4_ACLSUPPORT: u32 = 13;
pub const FATTR4_CANSETTIME: u32 = 15;
pub const FATTR4_CASE_INSENSITIVE: u32 = 16;
pub const FATTR4_CASE_PRESERVING: u32 = 17;
pub const FATTR4_CHOWN_RESTRICTED: u32 = 18;
pub const FATTR4_FILEHANDLE: u32 = 19;
pub const FATTR4_FILEID: u32 = 20;
pub const FATTR4_FILES_AVAIL: u32 = 21;
pub const FATTR4_FILES_FREE: u32 = 22;
pub const FATTR4_FILES_TOTAL: u32 = 23;
pub const FATTR4_HOMOGENEOUS: u32 = 26;
pub const FATTR4_MAXFILESIZE: u32 = 27;
pub const FATTR4_MAXLINK: u32 = 28;
pub const FATTR4_MAXNAME: u32 = 29;
pub const FATTR4_MAXREAD: u32 = 30;
pub const FATTR4_MAXWRITE: u32 = 31;

// Word 1 (bits 32..63).
pub const FATTR4_MODE: u32 = 33;
pub const FATTR4_NO_TRUNC: u32 = 34;
pub const FATTR4_NUMLINKS: u32 = 35;
pub const FATTR4_OWNER: u32 = 36;
pub const FATTR4_OWNER_GROUP: u32 = 37;
pub const FATTR4_RAWDEV: u32 = 41;
pub const FATTR4_SPACE_AVAIL: u32 = 42;
pub const FATTR4_SPACE_FREE: u32 = 43;
pub const FATTR4_SPACE_TOTAL: u32 = 44;
pub const FATTR4_SPACE_USED: u32 = 45;
pub const FATTR4_TIME_ACCESS: u32 = 47;
pub const FATTR4_TIME_ACCESS_SET: u32 = 48;
pub const FATTR4_TIME_DELTA: u32 = 51;
pub const FATTR4_TIME_METADATA: u32 = 52;
pub const FATTR4_TIME_MODIFY: u32 = 53;
pub const FATTR4_TIME_MODIFY_SET: u32 = 54;
pub const FATTR4_MOUNTED_ON_FILEID: u32 = 55;

// RFC 7530 §6.2 ACE types and access mask bits.
pub const ACE4_ACCESS_ALLOWED_ACE_TYPE: u32 = 0;
pub const ACE4_READ_DATA: u32 = 0x0000_0001;
pub const ACE4_LIST_DIRECTORY: u32 = 0x0000_0001;
pub const ACE4_WRITE_DATA: u32 = 0x0000_0002;
pub const ACE4_ADD_FILE: u32 = 0x0000_0002;
pub const ACE4_APPEND_DATA: u32 = 0x0000_0004;
pub const ACE4_ADD_SUBDIRECTORY: u32 = 0x0000_0004;
pub const ACE4_READ_NAMED_ATTRS: u32 = 0x0000_0008;
pub const ACE4_WRITE_NAMED_ATTRS: u32 = 0x0000_0010;
pub const ACE4_EXECUTE: u32 = 0x0000_0020;
pub const ACE4_READ_ATTRIBUTES: u32 = 0x0000_0080;
pub const ACE4_WRITE_ATTRIBUTES: u32 = 0x0000_0100;
pub const ACE4_READ_ACL: u32 = 0x0002_0000;
pub const ACE4_WRITE_ACL: u32 = 0x0004_0000;
pub const ACE4_WRITE_OWNER: u32 = 0x0008_0000;
pub const ACE4_SYNCHRONIZE: u32 = 0x0010_0000;
pub const ACL4_SUPPORT_ALLOW_ACL: u32 = 1;

/// Domain suffix for owner@domain strings (RFC 7530 §5.9).
const NFS4_DOMAIN: &str = "localdomain";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nfsace4 {
    pub ace_type: u32,
    pub flag: u32,
    pub access_mask: u32,
    pub who: String,
}

/// Every attribute bit this server can encode.
pub fn supported_bitmap() -> Vec<u32> {
    let mut bm = vec![0u32; 2];
    for bit in [
        FATTR4_SUPPORTED_ATTRS,
        FATTR4_TYPE,
        FATTR4_FH_EXPIRE_TYPE,
        FATTR4_CHANGE,
        FATTR4_SIZE,
        FATTR4_LINK_SUPPORT,
        FATTR4_SYMLINK_SUPPORT,
        FATTR4_NAMED_ATTR,
        FATTR4_FSID,
        FATTR4_UNIQUE_HANDLES,
        FATTR4_LEASE_TIME,
        FATTR4_RDATTR_ERROR,
        FATTR4_ACL,
        FATTR4_ACLSUPPORT,
        FATTR4_CANSETTIME,
        FATTR4_CASE_INSENSITIVE,
        FATTR4_CASE_PRESERVING,
        FATTR4_CHOWN_RESTRICTED,
        FATTR4_FILEHANDLE,
        FATTR4_FILEID,
        FATTR4_FILES_AVAIL,
        FATTR4_FILES_FREE,
        FATTR4_FILES_TOTAL,
        FATTR4_HOMOGENEOUS,
        FATTR4_MAXFILESIZE,
        FATTR4_MAXLINK,
        FATTR4_MAXNAME,
        FATTR4_MAXREAD,
        FATTR4_MAXWRITE,
        FATTR4_MODE,
        FATTR4_NO_TRUNC,
        FATTR4_NUMLINKS,
        FATTR4_OWNER,
        FATTR4_OWNER_GROUP,
        FATTR4_RAWDEV,
        FATTR4_SPACE_AVAIL,
        FATTR4_SPACE_FREE,
        FATTR4_SPACE_TOTAL,
        FATTR4_SPACE_USED,
        FATTR4_TIME_ACCESS,
        FATTR4_TIME_DELTA,
        FATTR4_TIME_METADATA,
        FATTR4_TIME_MODIFY,
        FATTR4_MOUNTED_ON_FILEID,
    ] {
        bitmap_set(&mut bm, bit);
    }
    bm
}

fn uid_to_owner(uid: u32) -> String {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = [0u8; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    if rc == 0 && !result.is_null() {
        if let Ok(name) = unsafe { CStr::from_ptr(pwd.pw_name) }.to_str() {
            return format!("{name}@{NFS4_DOMAIN}");
        }
    }
    uid.to_string()
}

fn gid_to_group(gid: u32) -> String {
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = [0u8; 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    if rc == 0 && !result.is_null() {
        if let Ok(name) = unsafe { CStr::from_ptr(grp.gr_name) }.to_str() {
            return format!("{name}@{NFS4_DOMAIN}");
        }
    }
    gid.to_string()
}

fn owner_to_uid(owner: &str) -> Option<u32> {
    let name = owner.split('@').next().unwrap_or(owner);
    if let Ok(uid) = name.parse::<u32>() {
        return Some(uid);
    }
    let cname = std::ffi::CString::new(name).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = [0u8; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    (rc == 0 && !result.is_null()).then(|| pwd.pw_uid)
}

fn group_to_gid(group: &str) -> Option<u32> {
    let name = group.split('@').next().unwrap_or(group);
    if let Ok(gid) = name.parse::<u32>() {
        return Some(gid);
    }
    let cname = std::ffi::CString::new(name).ok()?;
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = [0u8; 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();
    let rc = unsafe {
        libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr().cast(), buf.len(), &mut result)
    };
    (rc == 0 && !result.is_null()).then(|| grp.gr_gid)
}

/// Synthesize ALLOW ACEs for OWNER@/GROUP@/EVERYONE@ from a POSIX mode
/// (RFC 7530 §6.4.1). ACEs with an empty mask are omitted.
pub fn mode_to_acl(mode: u32, is_dir: bool) -> Vec<Nfsace4> {
    let read_mask = ACE4_READ_NAMED_ATTRS
        | ACE4_READ_ATTRIBUTES
        | ACE4_READ_ACL
        | if is_dir { ACE4_LIST_DIRECTORY } else { ACE4_READ_DATA };
    let write_mask = ACE4_WRITE_NAMED_ATTRS
        | ACE4_WRITE_ATTRIBUTES
        | if is_dir {
            ACE4_ADD_FILE | ACE4_ADD_SUBDIRECTORY
        } else {
            ACE4_WRITE_DATA | ACE4_APPEND_DATA
        };

    let mut aces = Vec::with_capacity(3);
    let mut push = |who: &str, bits: u32, owner_perms: bool, sync: bool| {
        let mut mask = 0;
        if bits & 0o4 != 0 {
            mask |= read_mask;
        }
        if bits & 0o2 != 0 {
            mask |= write_mask;
        }
        if bits & 0o1 != 0 {
            mask |= ACE4_EXECUTE;
        }
        if owner_perms {
            mask |= ACE4_WRITE_ACL | ACE4_WRITE_OWNER;
        }
        if sync {
            mask |= ACE4_SYNCHRONIZE;
        }
        if mask != 0 {
            aces.push(Nfsace4 {
                ace_type: ACE4_ACCESS_ALLOWED_ACE_TYPE,
                flag: 0,
                access_mask: mask,
                who: who.to_string(),
            });
        }
    };

    push("OWNER@", (mode >> 6) & 0o7, true, false);
    push("GROUP@", (mode >> 3) & 0o7, false, false);
    push("EVERYONE@", mode & 0o7, false, true);
    aces
}

pub fn encode_acl4(enc: &mut XdrEncoder, acl: &[Nfsace4]) {
    enc.encode_u32(acl.len() as u32);
    for ace in acl {
        enc.encode_u32(ace.ace_type);
        enc.encode_u32(ace.flag);
        enc.encode_u32(ace.access_mask);
        enc.encode_string(&ace.who);
    }
}

/// Fold ALLOW ACEs for the three standard principals back into a POSIX
/// mode. DENY ACEs and other principals are ignored.
pub fn decode_acl4_to_mode(dec: &mut XdrDecoder<'_>) -> XdrResult<u32> {
    let count = dec.decode_u32()?;
    let (mut owner_bits, mut group_bits, mut other_bits) = (0u32, 0u32, 0u32);

    for _ in 0..count {
        let ace_type = dec.decode_u32()?;
        dec.decode_u32()?; // flag
        let access_mask = dec.decode_u32()?;
        let who = dec.decode_string()?;

        if ace_type != ACE4_ACCESS_ALLOWED_ACE_TYPE {
            continue;
        }
        let mut bits = 0;
        if access_mask & ACE4_READ_DATA != 0 {
            bits |= 0o4;
        }
        if access_mask & ACE4_WRITE_DATA != 0 {
            bits |= 0o2;
        }
        if access_mask & ACE4_EXECUTE != 0 {
            bits |= 0o1;
        }
        match who.as_str() {
            "OWNER@" => owner_bits = bits,
            "GROUP@" => group_bits = bits,
            "EVERYONE@" => other_bits = bits,
            _ => {}
        }
    }
    Ok((owner_bits << 6) | (group_bits << 3) | other_bits)
}

fn encode_nfstime4(enc: &mut XdrEncoder, t: NfsTime) {
    enc.encode_i64(i64::from(t.seconds));
    enc.encode_u32(t.nseconds);
}

/// CHANGE attribute: the mtime packed into 64 bits.
pub fn change_attr(attr: &Fattr) -> u64 {
    (u64::from(attr.mtime.seconds) << 32) | u64::from(attr.mtime.nseconds)
}

/// Encode a fattr4 for GETATTR and friends: the result bitmap is the
/// intersection of the request with the supported set, and values follow
/// in strict bit-index order.
pub fn encode_fattr4(enc: &mut XdrEncoder, requested: &[u32], attr: &Fattr, fh: &FileHandle) {
    let supported = supported_bitmap();
    let mut result = vec![0u32; requested.len().max(supported.len())];
    for (i, word) in result.iter_mut().enumerate() {
        let r = requested.get(i).copied().unwrap_or(0);
        let s = supported.get(i).copied().unwrap_or(0);
        *word = r & s;
    }

    encode_bitmap(enc, &result);

    let mut data = XdrEncoder::new();

    if bitmap_isset(&result, FATTR4_SUPPORTED_ATTRS) {
        encode_bitmap(&mut data, &supported);
    }
    if bitmap_isset(&result, FATTR4_TYPE) {
        data.encode_u32(ftype_to_nfs4(attr.ftype));
    }
    if bitmap_isset(&result, FATTR4_FH_EXPIRE_TYPE) {
        data.encode_u32(FH4_PERSISTENT);
    }
    if bitmap_isset(&result, FATTR4_CHANGE) {
        data.encode_u64(change_attr(attr));
    }
    if bitmap_isset(&result, FATTR4_SIZE) {
        data.encode_u64(attr.size);
    }
    if bitmap_isset(&result, FATTR4_LINK_SUPPORT) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_SYMLINK_SUPPORT) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_NAMED_ATTR) {
        data.encode_bool(false);
    }
    if bitmap_isset(&result, FATTR4_FSID) {
        data.encode_u64(attr.fsid);
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_UNIQUE_HANDLES) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_LEASE_TIME) {
        data.encode_u32(NFS4_LEASE_TIME);
    }
    if bitmap_isset(&result, FATTR4_RDATTR_ERROR) {
        data.encode_u32(0);
    }
    if bitmap_isset(&result, FATTR4_ACL) {
        let acl = mode_to_acl(attr.mode & 0o7777, attr.ftype == FileType::Directory);
        encode_acl4(&mut data, &acl);
    }
    if bitmap_isset(&result, FATTR4_ACLSUPPORT) {
        data.encode_u32(ACL4_SUPPORT_ALLOW_ACL);
    }
    if bitmap_isset(&result, FATTR4_CANSETTIME) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_CASE_INSENSITIVE) {
        data.encode_bool(false);
    }
    if bitmap_isset(&result, FATTR4_CASE_PRESERVING) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_CHOWN_RESTRICTED) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_FILEHANDLE) {
        data.encode_opaque(fh.as_bytes());
    }
    if bitmap_isset(&result, FATTR4_FILEID) {
        data.encode_u64(attr.fileid);
    }
    if bitmap_isset(&result, FATTR4_FILES_AVAIL) {
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_FILES_FREE) {
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_FILES_TOTAL) {
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_HOMOGENEOUS) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_MAXFILESIZE) {
        data.encode_u64(0x7FFF_FFFF_FFFF_FFFF);
    }
    if bitmap_isset(&result, FATTR4_MAXLINK) {
        data.encode_u32(32000);
    }
    if bitmap_isset(&result, FATTR4_MAXNAME) {
        data.encode_u32(255);
    }
    if bitmap_isset(&result, FATTR4_MAXREAD) {
        data.encode_u64(1024 * 1024);
    }
    if bitmap_isset(&result, FATTR4_MAXWRITE) {
        data.encode_u64(1024 * 1024);
    }
    if bitmap_isset(&result, FATTR4_MODE) {
        data.encode_u32(attr.mode & 0o7777);
    }
    if bitmap_isset(&result, FATTR4_NO_TRUNC) {
        data.encode_bool(true);
    }
    if bitmap_isset(&result, FATTR4_NUMLINKS) {
        data.encode_u32(attr.nlink);
    }
    if bitmap_isset(&result, FATTR4_OWNER) {
        data.encode_string(&uid_to_owner(attr.uid));
    }
    if bitmap_isset(&result, FATTR4_OWNER_GROUP) {
        data.encode_string(&gid_to_group(attr.gid));
    }
    if bitmap_isset(&result, FATTR4_RAWDEV) {
        data.encode_u32(attr.rdev_major);
        data.encode_u32(attr.rdev_minor);
    }
    if bitmap_isset(&result, FATTR4_SPACE_AVAIL) {
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_SPACE_FREE) {
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_SPACE_TOTAL) {
        data.encode_u64(0);
    }
    if bitmap_isset(&result, FATTR4_SPACE_USED) {
        data.encode_u64(attr.used);
    }
    if bitmap_isset(&result, FATTR4_TIME_ACCESS) {
        encode_nfstime4(&mut data, attr.atime);
    }
    if bitmap_isset(&result, FATTR4_TIME_DELTA) {
        // 1 ns granularity advertised.
        data.encode_i64(0);
        data.encode_u32(1);
    }
    if bitmap_isset(&result, FATTR4_TIME_METADATA) {
        encode_nfstime4(&mut data, attr.ctime);
    }
    if bitmap_isset(&result, FATTR4_TIME_MODIFY) {
        encode_nfstime4(&mut data, attr.mtime);
    }
    if bitmap_isset(&result, FATTR4_MOUNTED_ON_FILEID) {
        data.encode_u64(attr.fileid);
    }

    enc.encode_opaque(data.data());
}

/// Which attributes a SETATTR-style fattr4 carried, beyond the SetAttr
/// fields themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodedSetAttrBits {
    pub has_acl: bool,
}

/// Decode a client-supplied fattr4 into a [`SetAttr`]. Only settable
/// attributes are interpreted; an ACL is folded into the mode.
pub fn decode_fattr4_setattr(dec: &mut XdrDecoder<'_>) -> XdrResult<(SetAttr, DecodedSetAttrBits)> {
    let bm = decode_bitmap(dec)?;
    let attr_bytes = dec.decode_opaque()?;
    let mut attr_dec = XdrDecoder::new(&attr_bytes);

    let mut sa = SetAttr::default();
    let mut bits = DecodedSetAttrBits::default();

    if bitmap_isset(&bm, FATTR4_SIZE) {
        sa.size = Some(attr_dec.decode_u64()?);
    }
    if bitmap_isset(&bm, FATTR4_ACL) {
        sa.mode = Some(decode_acl4_to_mode(&mut attr_dec)?);
        bits.has_acl = true;
    }
    if bitmap_isset(&bm, FATTR4_MODE) {
        sa.mode = Some(attr_dec.decode_u32()?);
    }
    if bitmap_isset(&bm, FATTR4_OWNER) {
        let owner = attr_dec.decode_string()?;
        sa.uid = owner_to_uid(&owner);
    }
    if bitmap_isset(&bm, FATTR4_OWNER_GROUP) {
        let group = attr_dec.decode_string()?;
        sa.gid = group_to_gid(&group);
    }
    if bitmap_isset(&bm, FATTR4_TIME_ACCESS_SET) {
        sa.atime = decode_settime4(&mut attr_dec)?;
    }
    if bitmap_isset(&bm, FATTR4_TIME_MODIFY_SET) {
        sa.mtime = decode_settime4(&mut attr_dec)?;
    }

    Ok((sa, bits))
}

/// settime4: 0 = server time, 1 = client-supplied nfstime4.
fn decode_settime4(dec: &mut XdrDecoder<'_>) -> XdrResult<SetTime> {
    if dec.decode_u32()? == 1 {
        let seconds = dec.decode_i64()? as u32;
        let nseconds = dec.decode_u32()?;
        Ok(SetTime::ClientTime(NfsTime { seconds, nseconds }))
    } else {
        Ok(SetTime::ServerTime)
    }
}
