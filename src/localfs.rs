//! Local filesystem passthrough VFS.
//!
//! File handles encode `(inode, device)`; a mutex-protected handle→path
//! map resolves them back to paths. Handles that were never seen (for
//! example after a restart) resolve to NFS3ERR_STALE, which is exactly
//! what the protocol expects from a server that lost its handle cache.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::vfs::{
    DirEntry, Fattr, FileHandle, FileType, FsInfo, FsStat, NfsStat3, NfsTime, PathConf, SetAttr,
    SetTime, Vfs, VfsResult,
};

pub struct LocalFs {
    export_root: PathBuf,
    handle_to_path: Mutex<HashMap<FileHandle, PathBuf>>,
}

impl LocalFs {
    pub fn new(export_root: impl Into<PathBuf>) -> Self {
        Self { export_root: export_root.into(), handle_to_path: Mutex::new(HashMap::new()) }
    }

    fn make_handle(ino: u64, dev: u64) -> FileHandle {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&ino.to_le_bytes());
        bytes[8..].copy_from_slice(&dev.to_le_bytes());
        FileHandle::from_bytes(&bytes).expect("16-byte handle fits")
    }

    fn cache_path(&self, fh: FileHandle, path: PathBuf) {
        self.handle_to_path.lock().unwrap().insert(fh, path);
    }

    fn resolve_path(&self, fh: &FileHandle) -> VfsResult<PathBuf> {
        self.handle_to_path.lock().unwrap().get(fh).cloned().ok_or(NfsStat3::Stale)
    }

    fn io_err(e: &io::Error) -> NfsStat3 {
        match e.raw_os_error() {
            Some(libc::EPERM) => NfsStat3::Perm,
            Some(libc::ENOENT) => NfsStat3::Noent,
            Some(libc::EIO) => NfsStat3::Io,
            Some(libc::ENXIO) => NfsStat3::Nxio,
            Some(libc::EACCES) => NfsStat3::Acces,
            Some(libc::EEXIST) => NfsStat3::Exist,
            Some(libc::EXDEV) => NfsStat3::Xdev,
            Some(libc::ENODEV) => NfsStat3::Nodev,
            Some(libc::ENOTDIR) => NfsStat3::Notdir,
            Some(libc::EISDIR) => NfsStat3::Isdir,
            Some(libc::EINVAL) => NfsStat3::Inval,
            Some(libc::EFBIG) => NfsStat3::Fbig,
            Some(libc::ENOSPC) => NfsStat3::Nospc,
            Some(libc::EROFS) => NfsStat3::Rofs,
            Some(libc::EMLINK) => NfsStat3::Mlink,
            Some(libc::ENAMETOOLONG) => NfsStat3::NameTooLong,
            Some(libc::ENOTEMPTY) => NfsStat3::NotEmpty,
            Some(libc::EDQUOT) => NfsStat3::Dquot,
            _ => NfsStat3::Io,
        }
    }

    fn meta_to_fattr(meta: &std::fs::Metadata) -> Fattr {
        let ftype = if meta.file_type().is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.file_type().is_file() {
            FileType::Regular
        } else {
            let mode = meta.mode();
            match mode & libc::S_IFMT {
                libc::S_IFBLK => FileType::BlockDevice,
                libc::S_IFCHR => FileType::CharDevice,
                libc::S_IFSOCK => FileType::Socket,
                libc::S_IFIFO => FileType::Fifo,
                _ => FileType::Regular,
            }
        };

        Fattr {
            ftype,
            mode: meta.mode() & 0o7777,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            used: meta.blocks() * 512,
            rdev_major: ((meta.rdev() >> 8) & 0xFFF) as u32,
            rdev_minor: (meta.rdev() & 0xFF) as u32,
            fsid: meta.dev(),
            fileid: meta.ino(),
            atime: NfsTime { seconds: meta.atime() as u32, nseconds: meta.atime_nsec() as u32 },
            mtime: NfsTime { seconds: meta.mtime() as u32, nseconds: meta.mtime_nsec() as u32 },
            ctime: NfsTime { seconds: meta.ctime() as u32, nseconds: meta.ctime_nsec() as u32 },
        }
    }

    fn stat_path(&self, path: &Path) -> VfsResult<(FileHandle, Fattr)> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| Self::io_err(&e))?;
        let fh = Self::make_handle(meta.ino(), meta.dev());
        Ok((fh, Self::meta_to_fattr(&meta)))
    }

    fn set_times(path: &Path, atime: SetTime, mtime: SetTime) -> VfsResult<()> {
        fn to_timespec(t: SetTime) -> libc::timespec {
            match t {
                SetTime::DontChange => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
                SetTime::ServerTime => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_NOW },
                SetTime::ClientTime(t) => libc::timespec {
                    tv_sec: t.seconds as libc::time_t,
                    tv_nsec: t.nseconds as _,
                },
            }
        }

        if matches!(atime, SetTime::DontChange) && matches!(mtime, SetTime::DontChange) {
            return Ok(());
        }
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| NfsStat3::Inval)?;
        let times = [to_timespec(atime), to_timespec(mtime)];
        let rc = unsafe {
            libc::utimensat(libc::AT_FDCWD, cpath.as_ptr(), times.as_ptr(), 0)
        };
        if rc != 0 {
            return Err(Self::io_err(&io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Vfs for LocalFs {
    fn root_fh(&self) -> VfsResult<FileHandle> {
        let (fh, _) = self.stat_path(&self.export_root)?;
        self.cache_path(fh, self.export_root.clone());
        Ok(fh)
    }

    fn getattr(&self, fh: &FileHandle) -> VfsResult<Fattr> {
        let path = self.resolve_path(fh)?;
        let meta = std::fs::symlink_metadata(&path).map_err(|e| Self::io_err(&e))?;
        Ok(Self::meta_to_fattr(&meta))
    }

    fn setattr(&self, fh: &FileHandle, attr: &SetAttr) -> VfsResult<()> {
        let path = self.resolve_path(fh)?;

        if let Some(mode) = attr.mode {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
                .map_err(|e| Self::io_err(&e))?;
        }
        if attr.uid.is_some() || attr.gid.is_some() {
            std::os::unix::fs::chown(&path, attr.uid, attr.gid).map_err(|e| Self::io_err(&e))?;
        }
        if let Some(size) = attr.size {
            let file = OpenOptions::new().write(true).open(&path).map_err(|e| Self::io_err(&e))?;
            file.set_len(size).map_err(|e| Self::io_err(&e))?;
        }
        Self::set_times(&path, attr.atime, attr.mtime)
    }

    fn lookup(&self, dir: &FileHandle, name: &str) -> VfsResult<(FileHandle, Fattr)> {
        let dir_path = self.resolve_path(dir)?;
        let full = dir_path.join(name);
        let (fh, attr) = self.stat_path(&full)?;
        self.cache_path(fh, full);
        Ok((fh, attr))
    }

    fn access(&self, fh: &FileHandle, requested: u32) -> VfsResult<u32> {
        self.resolve_path(fh)?;
        // The transport trusts AUTH_SYS; access control is left to the
        // backing filesystem at operation time.
        Ok(requested)
    }

    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> VfsResult<(Vec<u8>, bool)> {
        let path = self.resolve_path(fh)?;
        let file = File::open(&path).map_err(|e| Self::io_err(&e))?;
        let mut data = vec![0u8; count as usize];
        let n = file.read_at(&mut data, offset).map_err(|e| Self::io_err(&e))?;
        data.truncate(n);
        Ok((data, n < count as usize))
    }

    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let path = self.resolve_path(fh)?;
        let file = OpenOptions::new().write(true).open(&path).map_err(|e| Self::io_err(&e))?;
        let n = file.write_at(data, offset).map_err(|e| Self::io_err(&e))?;
        Ok(n as u32)
    }

    fn create(&self, dir: &FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Fattr)> {
        let dir_path = self.resolve_path(dir)?;
        let full = dir_path.join(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| Self::io_err(&e))?;
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| Self::io_err(&e))?;
        drop(file);
        let (fh, attr) = self.stat_path(&full)?;
        self.cache_path(fh, full);
        Ok((fh, attr))
    }

    fn mkdir(&self, dir: &FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Fattr)> {
        let dir_path = self.resolve_path(dir)?;
        let full = dir_path.join(name);
        std::fs::create_dir(&full).map_err(|e| Self::io_err(&e))?;
        std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
            .map_err(|e| Self::io_err(&e))?;
        let (fh, attr) = self.stat_path(&full)?;
        self.cache_path(fh, full);
        Ok((fh, attr))
    }

    fn remove(&self, dir: &FileHandle, name: &str) -> VfsResult<()> {
        let dir_path = self.resolve_path(dir)?;
        std::fs::remove_file(dir_path.join(name)).map_err(|e| Self::io_err(&e))
    }

    fn rmdir(&self, dir: &FileHandle, name: &str) -> VfsResult<()> {
        let dir_path = self.resolve_path(dir)?;
        std::fs::remove_dir(dir_path.join(name)).map_err(|e| Self::io_err(&e))
    }

    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
    ) -> VfsResult<()> {
        let from = self.resolve_path(from_dir)?.join(from_name);
        let to = self.resolve_path(to_dir)?.join(to_name);
        std::fs::rename(&from, &to).map_err(|e| Self::io_err(&e))?;
        // The moved object keeps its handle; remember its new home.
        if let Ok((fh, _)) = self.stat_path(&to) {
            self.cache_path(fh, to);
        }
        Ok(())
    }

    fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        count: u32,
    ) -> VfsResult<(Vec<DirEntry>, bool)> {
        let dir_path = self.resolve_path(dir)?;
        let reader = std::fs::read_dir(&dir_path).map_err(|e| Self::io_err(&e))?;

        let mut entries = Vec::new();
        let mut idx = 0u64;
        let mut eof = true;
        for entry in reader.flatten() {
            idx += 1;
            if idx <= cookie {
                continue;
            }
            if entries.len() >= count as usize {
                eof = false;
                break;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let fileid = entry.metadata().map(|m| m.ino()).unwrap_or(0);
            entries.push(DirEntry { fileid, name: name.clone(), cookie: idx });

            // Keep the handle cache warm for the follow-up per-entry
            // LOOKUPs.
            let full = dir_path.join(&name);
            if let Ok((fh, _)) = self.stat_path(&full) {
                self.cache_path(fh, full);
            }
        }
        Ok((entries, eof))
    }

    fn readlink(&self, fh: &FileHandle) -> VfsResult<String> {
        let path = self.resolve_path(fh)?;
        let target = std::fs::read_link(&path).map_err(|e| Self::io_err(&e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn symlink(&self, dir: &FileHandle, name: &str, target: &str) -> VfsResult<(FileHandle, Fattr)> {
        let dir_path = self.resolve_path(dir)?;
        let full = dir_path.join(name);
        std::os::unix::fs::symlink(target, &full).map_err(|e| Self::io_err(&e))?;
        let (fh, attr) = self.stat_path(&full)?;
        self.cache_path(fh, full);
        Ok((fh, attr))
    }

    fn link(&self, fh: &FileHandle, dir: &FileHandle, name: &str) -> VfsResult<()> {
        let src = self.resolve_path(fh)?;
        let dst = self.resolve_path(dir)?.join(name);
        std::fs::hard_link(&src, &dst).map_err(|e| Self::io_err(&e))
    }

    fn fsstat(&self, fh: &FileHandle) -> VfsResult<FsStat> {
        let path = self.resolve_path(fh)?;
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| NfsStat3::Inval)?;
        let mut sv: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut sv) };
        if rc != 0 {
            return Err(Self::io_err(&io::Error::last_os_error()));
        }
        Ok(FsStat {
            total_bytes: sv.f_blocks as u64 * sv.f_frsize as u64,
            free_bytes: sv.f_bfree as u64 * sv.f_frsize as u64,
            avail_bytes: sv.f_bavail as u64 * sv.f_frsize as u64,
            total_files: sv.f_files as u64,
            free_files: sv.f_ffree as u64,
            avail_files: sv.f_favail as u64,
        })
    }

    fn fsinfo(&self, _fh: &FileHandle) -> VfsResult<FsInfo> {
        Ok(FsInfo {
            rtmax: 1024 * 1024,
            rtpref: 64 * 1024,
            wtmax: 1024 * 1024,
            wtpref: 64 * 1024,
            dtpref: 8192,
            maxfilesize: u64::MAX,
        })
    }

    fn pathconf(&self, _fh: &FileHandle) -> VfsResult<PathConf> {
        Ok(PathConf { linkmax: 32000, name_max: 255 })
    }

    fn commit(&self, fh: &FileHandle, _offset: u64, _count: u32) -> VfsResult<()> {
        let path = self.resolve_path(fh)?;
        let file = File::open(&path).map_err(|e| Self::io_err(&e))?;
        file.sync_all().map_err(|e| Self::io_err(&e))
    }
}
