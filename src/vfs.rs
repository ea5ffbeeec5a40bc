//! The virtual file system boundary the protocol servers are written
//! against.
//!
//! Handles are opaque to the protocol core: at most [`FHSIZE`] bytes,
//! equality-comparable and totally ordered. Everything the NFSv3, NFSv4,
//! MOUNT and NLM servers need from a backing store is expressed through the
//! [`Vfs`] trait; [`crate::localfs::LocalFs`] is the shipped passthrough
//! implementation.

use std::fmt;

use num_derive::{FromPrimitive, ToPrimitive};

/// Maximum file handle size (NFSv3 limit; v4 handles are the same bytes).
pub const FHSIZE: usize = 64;

/// Opaque file handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle {
    data: [u8; FHSIZE],
    len: u8,
}

impl FileHandle {
    /// Build a handle from raw bytes. Returns `None` when the input exceeds
    /// the 64-byte protocol limit.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > FHSIZE {
            return None;
        }
        let mut data = [0u8; FHSIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self { data, len: bytes.len() as u8 })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for FileHandle {
    fn default() -> Self {
        Self { data: [0; FHSIZE], len: 0 }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle(")?;
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// NFSv3 status codes (RFC 1813 §2.6). The VFS reports failures in these
/// terms; the NFSv4 server maps them onto its own status space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum NfsStat3 {
    Ok = 0,
    Perm = 1,
    Noent = 2,
    Io = 5,
    Nxio = 6,
    Acces = 13,
    Exist = 17,
    Xdev = 18,
    Nodev = 19,
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
    NotSync = 10002,
    BadCookie = 10003,
    NotSupp = 10004,
    TooSmall = 10005,
    ServerFault = 10006,
}

/// File types (RFC 1813 §2.5 ftype3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    BlockDevice = 3,
    CharDevice = 4,
    Symlink = 5,
    Socket = 6,
    Fifo = 7,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NfsTime {
    pub seconds: u32,
    pub nseconds: u32,
}

/// File attributes, one-to-one with fattr3.
#[derive(Clone, Copy, Debug)]
pub struct Fattr {
    pub ftype: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub fsid: u64,
    pub fileid: u64,
    pub atime: NfsTime,
    pub mtime: NfsTime,
    pub ctime: NfsTime,
}

impl Default for Fattr {
    fn default() -> Self {
        Self {
            ftype: FileType::Regular,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            used: 0,
            rdev_major: 0,
            rdev_minor: 0,
            fsid: 0,
            fileid: 0,
            atime: NfsTime::default(),
            mtime: NfsTime::default(),
            ctime: NfsTime::default(),
        }
    }
}

/// How a timestamp should be updated by `setattr` (RFC 1813 time_how).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetTime {
    #[default]
    DontChange,
    ServerTime,
    ClientTime(NfsTime),
}

/// Attributes a client asked to change.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub fileid: u64,
    pub name: String,
    pub cookie: u64,
}

/// FSSTAT results.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsStat {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

/// FSINFO results.
#[derive(Clone, Copy, Debug)]
pub struct FsInfo {
    pub rtmax: u32,
    pub rtpref: u32,
    pub wtmax: u32,
    pub wtpref: u32,
    pub dtpref: u32,
    pub maxfilesize: u64,
}

/// PATHCONF results.
#[derive(Clone, Copy, Debug)]
pub struct PathConf {
    pub linkmax: u32,
    pub name_max: u32,
}

pub type VfsResult<T> = Result<T, NfsStat3>;

/// Backing-store contract for the protocol servers.
///
/// Calls are synchronous; the transport runs them inside the per-connection
/// task. Implementations must be safe to call from multiple connections
/// concurrently.
pub trait Vfs: Send + Sync {
    /// Handle of the export root.
    fn root_fh(&self) -> VfsResult<FileHandle>;

    fn getattr(&self, fh: &FileHandle) -> VfsResult<Fattr>;
    fn setattr(&self, fh: &FileHandle, attr: &SetAttr) -> VfsResult<()>;
    fn lookup(&self, dir: &FileHandle, name: &str) -> VfsResult<(FileHandle, Fattr)>;
    fn access(&self, fh: &FileHandle, requested: u32) -> VfsResult<u32>;
    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> VfsResult<(Vec<u8>, bool)>;
    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> VfsResult<u32>;
    fn create(&self, dir: &FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Fattr)>;
    fn mkdir(&self, dir: &FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Fattr)>;
    fn remove(&self, dir: &FileHandle, name: &str) -> VfsResult<()>;
    fn rmdir(&self, dir: &FileHandle, name: &str) -> VfsResult<()>;
    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
    ) -> VfsResult<()>;
    fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        count: u32,
    ) -> VfsResult<(Vec<DirEntry>, bool)>;
    fn readlink(&self, fh: &FileHandle) -> VfsResult<String>;
    fn symlink(
        &self,
        dir: &FileHandle,
        name: &str,
        target: &str,
    ) -> VfsResult<(FileHandle, Fattr)>;
    fn link(&self, fh: &FileHandle, dir: &FileHandle, name: &str) -> VfsResult<()>;
    fn fsstat(&self, fh: &FileHandle) -> VfsResult<FsStat>;
    fn fsinfo(&self, fh: &FileHandle) -> VfsResult<FsInfo>;
    fn pathconf(&self, fh: &FileHandle) -> VfsResult<PathConf>;
    fn commit(&self, fh: &FileHandle, offset: u64, count: u32) -> VfsResult<()>;

    /// Create a special file. The shipped backends do not support device
    /// nodes and report `NotSupp`, which the NFSv3 MKNOD handler forwards.
    fn mknod(&self, _dir: &FileHandle, _name: &str) -> VfsResult<()> {
        Err(NfsStat3::NotSupp)
    }
}
