//! Shared test backends.
//!
//! [`StubFs`] only knows its root handle and a single attribute record —
//! enough to boot the servers and exercise the transport. [`MemFs`] is a
//! small in-memory tree with a logical clock for timestamps, used to
//! drive the NFSv3 procedures and NFSv4 COMPOUND flows for real.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use nfs_aurochs::vfs::{
    DirEntry, Fattr, FileHandle, FileType, FsInfo, FsStat, NfsStat3, NfsTime, PathConf, SetAttr,
    SetTime, Vfs, VfsResult,
};

pub struct StubFs;

impl StubFs {
    pub fn root_handle() -> FileHandle {
        FileHandle::from_bytes(&[0xAA; 16]).unwrap()
    }
}

impl Vfs for StubFs {
    fn root_fh(&self) -> VfsResult<FileHandle> {
        Ok(Self::root_handle())
    }

    fn getattr(&self, fh: &FileHandle) -> VfsResult<Fattr> {
        if *fh != Self::root_handle() {
            return Err(NfsStat3::Stale);
        }
        Ok(Fattr {
            ftype: FileType::Directory,
            mode: 0o755,
            nlink: 2,
            size: 4096,
            fileid: 1,
            fsid: 1,
            ..Fattr::default()
        })
    }

    fn setattr(&self, _fh: &FileHandle, _attr: &SetAttr) -> VfsResult<()> {
        Err(NfsStat3::NotSupp)
    }

    fn lookup(&self, _dir: &FileHandle, _name: &str) -> VfsResult<(FileHandle, Fattr)> {
        Err(NfsStat3::Noent)
    }

    fn access(&self, _fh: &FileHandle, requested: u32) -> VfsResult<u32> {
        Ok(requested)
    }

    fn read(&self, _fh: &FileHandle, _offset: u64, _count: u32) -> VfsResult<(Vec<u8>, bool)> {
        Err(NfsStat3::NotSupp)
    }

    fn write(&self, _fh: &FileHandle, _offset: u64, _data: &[u8]) -> VfsResult<u32> {
        Err(NfsStat3::NotSupp)
    }

    fn create(&self, _dir: &FileHandle, _name: &str, _mode: u32) -> VfsResult<(FileHandle, Fattr)> {
        Err(NfsStat3::NotSupp)
    }

    fn mkdir(&self, _dir: &FileHandle, _name: &str, _mode: u32) -> VfsResult<(FileHandle, Fattr)> {
        Err(NfsStat3::NotSupp)
    }

    fn remove(&self, _dir: &FileHandle, _name: &str) -> VfsResult<()> {
        Err(NfsStat3::NotSupp)
    }

    fn rmdir(&self, _dir: &FileHandle, _name: &str) -> VfsResult<()> {
        Err(NfsStat3::NotSupp)
    }

    fn rename(
        &self,
        _from_dir: &FileHandle,
        _from_name: &str,
        _to_dir: &FileHandle,
        _to_name: &str,
    ) -> VfsResult<()> {
        Err(NfsStat3::NotSupp)
    }

    fn readdir(
        &self,
        _dir: &FileHandle,
        _cookie: u64,
        _count: u32,
    ) -> VfsResult<(Vec<DirEntry>, bool)> {
        Ok((Vec::new(), true))
    }

    fn readlink(&self, _fh: &FileHandle) -> VfsResult<String> {
        Err(NfsStat3::NotSupp)
    }

    fn symlink(
        &self,
        _dir: &FileHandle,
        _name: &str,
        _target: &str,
    ) -> VfsResult<(FileHandle, Fattr)> {
        Err(NfsStat3::NotSupp)
    }

    fn link(&self, _fh: &FileHandle, _dir: &FileHandle, _name: &str) -> VfsResult<()> {
        Err(NfsStat3::NotSupp)
    }

    fn fsstat(&self, _fh: &FileHandle) -> VfsResult<FsStat> {
        Ok(FsStat::default())
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

    fn commit(&self, _fh: &FileHandle, _offset: u64, _count: u32) -> VfsResult<()> {
        Ok(())
    }
}

// --- in-memory filesystem ---

enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
    Symlink(String),
}

struct Node {
    kind: NodeKind,
    parent: u64,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    atime: NfsTime,
    mtime: NfsTime,
    ctime: NfsTime,
}

struct MemInner {
    nodes: HashMap<u64, Node>,
    next_id: u64,
    /// Logical clock driving the timestamps, so cookie verifiers and the
    /// SETATTR guard behave deterministically.
    clock: u32,
}

pub struct MemFs {
    inner: Mutex<MemInner>,
}

const ROOT_ID: u64 = 1;

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let now = NfsTime { seconds: 1000, nseconds: 0 };
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                kind: NodeKind::Dir(BTreeMap::new()),
                parent: ROOT_ID,
                mode: 0o755,
                uid: 0,
                gid: 0,
                nlink: 2,
                atime: now,
                mtime: now,
                ctime: now,
            },
        );
        Self { inner: Mutex::new(MemInner { nodes, next_id: 2, clock: 1000 }) }
    }

    pub fn handle_of(id: u64) -> FileHandle {
        FileHandle::from_bytes(&id.to_le_bytes()).unwrap()
    }

    fn id_of(fh: &FileHandle) -> VfsResult<u64> {
        let bytes: [u8; 8] =
            fh.as_bytes().try_into().map_err(|_| NfsStat3::BadHandle)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn tick(inner: &mut MemInner) -> NfsTime {
        inner.clock += 1;
        NfsTime { seconds: inner.clock, nseconds: 0 }
    }

    fn node_attr(id: u64, node: &Node) -> Fattr {
        let (ftype, size) = match &node.kind {
            NodeKind::File(data) => (FileType::Regular, data.len() as u64),
            NodeKind::Dir(_) => (FileType::Directory, 4096),
            NodeKind::Symlink(t) => (FileType::Symlink, t.len() as u64),
        };
        Fattr {
            ftype,
            mode: node.mode,
            nlink: node.nlink,
            uid: node.uid,
            gid: node.gid,
            size,
            used: size,
            fsid: 1,
            fileid: id,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
            ..Fattr::default()
        }
    }

    fn insert_node(inner: &mut MemInner, dir_id: u64, name: &str, kind: NodeKind, mode: u32) -> VfsResult<u64> {
        let now = Self::tick(inner);
        let id = inner.next_id;

        let dir = inner.nodes.get_mut(&dir_id).ok_or(NfsStat3::Stale)?;
        let NodeKind::Dir(children) = &mut dir.kind else {
            return Err(NfsStat3::Notdir);
        };
        if children.contains_key(name) {
            return Err(NfsStat3::Exist);
        }
        children.insert(name.to_string(), id);
        dir.mtime = now;
        dir.ctime = now;

        let nlink = if matches!(kind, NodeKind::Dir(_)) { 2 } else { 1 };
        inner.next_id += 1;
        inner.nodes.insert(
            id,
            Node {
                kind,
                parent: dir_id,
                mode,
                uid: 0,
                gid: 0,
                nlink,
                atime: now,
                mtime: now,
                ctime: now,
            },
        );
        Ok(id)
    }

    fn child_id(inner: &MemInner, dir_id: u64, name: &str) -> VfsResult<u64> {
        let dir = inner.nodes.get(&dir_id).ok_or(NfsStat3::Stale)?;
        if name == ".." {
            return Ok(dir.parent);
        }
        let NodeKind::Dir(children) = &dir.kind else {
            return Err(NfsStat3::Notdir);
        };
        children.get(name).copied().ok_or(NfsStat3::Noent)
    }
}

impl Vfs for MemFs {
    fn root_fh(&self) -> VfsResult<FileHandle> {
        Ok(Self::handle_of(ROOT_ID))
    }

    fn getattr(&self, fh: &FileHandle) -> VfsResult<Fattr> {
        let id = Self::id_of(fh)?;
        let inner = self.inner.lock().unwrap();
        let node = inner.nodes.get(&id).ok_or(NfsStat3::Stale)?;
        Ok(Self::node_attr(id, node))
    }

    fn setattr(&self, fh: &FileHandle, attr: &SetAttr) -> VfsResult<()> {
        let id = Self::id_of(fh)?;
        let mut inner = self.inner.lock().unwrap();
        let now = Self::tick(&mut inner);
        let node = inner.nodes.get_mut(&id).ok_or(NfsStat3::Stale)?;

        if let Some(mode) = attr.mode {
            node.mode = mode & 0o7777;
        }
        if let Some(uid) = attr.uid {
            node.uid = uid;
        }
        if let Some(gid) = attr.gid {
            node.gid = gid;
        }
        if let Some(size) = attr.size {
            if let NodeKind::File(data) = &mut node.kind {
                data.resize(size as usize, 0);
            }
        }
        match attr.atime {
            SetTime::DontChange => {}
            SetTime::ServerTime => node.atime = now,
            SetTime::ClientTime(t) => node.atime = t,
        }
        match attr.mtime {
            SetTime::DontChange => {}
            SetTime::ServerTime => node.mtime = now,
            SetTime::ClientTime(t) => node.mtime = t,
        }
        node.ctime = now;
        Ok(())
    }

    fn lookup(&self, dir: &FileHandle, name: &str) -> VfsResult<(FileHandle, Fattr)> {
        let dir_id = Self::id_of(dir)?;
        let inner = self.inner.lock().unwrap();
        let id = Self::child_id(&inner, dir_id, name)?;
        let node = inner.nodes.get(&id).ok_or(NfsStat3::Stale)?;
        Ok((Self::handle_of(id), Self::node_attr(id, node)))
    }

    fn access(&self, _fh: &FileHandle, requested: u32) -> VfsResult<u32> {
        Ok(requested)
    }

    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> VfsResult<(Vec<u8>, bool)> {
        let id = Self::id_of(fh)?;
        let inner = self.inner.lock().unwrap();
        let node = inner.nodes.get(&id).ok_or(NfsStat3::Stale)?;
        let NodeKind::File(data) = &node.kind else {
            return Err(NfsStat3::Isdir);
        };
        let start = (offset as usize).min(data.len());
        let end = (start + count as usize).min(data.len());
        Ok((data[start..end].to_vec(), end == data.len()))
    }

    fn write(&self, fh: &FileHandle, offset: u64, buf: &[u8]) -> VfsResult<u32> {
        let id = Self::id_of(fh)?;
        let mut inner = self.inner.lock().unwrap();
        let now = Self::tick(&mut inner);
        let node = inner.nodes.get_mut(&id).ok_or(NfsStat3::Stale)?;
        let NodeKind::File(data) = &mut node.kind else {
            return Err(NfsStat3::Isdir);
        };
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        node.mtime = now;
        node.ctime = now;
        Ok(buf.len() as u32)
    }

    fn create(&self, dir: &FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Fattr)> {
        let dir_id = Self::id_of(dir)?;
        let mut inner = self.inner.lock().unwrap();
        let id = match Self::child_id(&inner, dir_id, name) {
            Ok(existing) => existing, // UNCHECKED create reuses
            Err(NfsStat3::Noent) => {
                Self::insert_node(&mut inner, dir_id, name, NodeKind::File(Vec::new()), mode)?
            }
            Err(e) => return Err(e),
        };
        let node = inner.nodes.get(&id).ok_or(NfsStat3::Stale)?;
        Ok((Self::handle_of(id), Self::node_attr(id, node)))
    }

    fn mkdir(&self, dir: &FileHandle, name: &str, mode: u32) -> VfsResult<(FileHandle, Fattr)> {
        let dir_id = Self::id_of(dir)?;
        let mut inner = self.inner.lock().unwrap();
        let id =
            Self::insert_node(&mut inner, dir_id, name, NodeKind::Dir(BTreeMap::new()), mode)?;
        let node = inner.nodes.get(&id).ok_or(NfsStat3::Stale)?;
        Ok((Self::handle_of(id), Self::node_attr(id, node)))
    }

    fn remove(&self, dir: &FileHandle, name: &str) -> VfsResult<()> {
        let dir_id = Self::id_of(dir)?;
        let mut inner = self.inner.lock().unwrap();
        let id = Self::child_id(&inner, dir_id, name)?;
        if matches!(inner.nodes[&id].kind, NodeKind::Dir(_)) {
            return Err(NfsStat3::Isdir);
        }
        let now = Self::tick(&mut inner);
        let dir = inner.nodes.get_mut(&dir_id).unwrap();
        if let NodeKind::Dir(children) = &mut dir.kind {
            children.remove(name);
        }
        dir.mtime = now;
        let node = inner.nodes.get_mut(&id).unwrap();
        node.nlink -= 1;
        if node.nlink == 0 {
            inner.nodes.remove(&id);
        }
        Ok(())
    }

    fn rmdir(&self, dir: &FileHandle, name: &str) -> VfsResult<()> {
        let dir_id = Self::id_of(dir)?;
        let mut inner = self.inner.lock().unwrap();
        let id = Self::child_id(&inner, dir_id, name)?;
        match &inner.nodes[&id].kind {
            NodeKind::Dir(children) if !children.is_empty() => return Err(NfsStat3::NotEmpty),
            NodeKind::Dir(_) => {}
            _ => return Err(NfsStat3::Notdir),
        }
        let now = Self::tick(&mut inner);
        let dir = inner.nodes.get_mut(&dir_id).unwrap();
        if let NodeKind::Dir(children) = &mut dir.kind {
            children.remove(name);
        }
        dir.mtime = now;
        inner.nodes.remove(&id);
        Ok(())
    }

    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
    ) -> VfsResult<()> {
        let from_id = Self::id_of(from_dir)?;
        let to_id = Self::id_of(to_dir)?;
        let mut inner = self.inner.lock().unwrap();
        let moved = Self::child_id(&inner, from_id, from_name)?;
        let now = Self::tick(&mut inner);

        let from = inner.nodes.get_mut(&from_id).ok_or(NfsStat3::Stale)?;
        let NodeKind::Dir(children) = &mut from.kind else {
            return Err(NfsStat3::Notdir);
        };
        children.remove(from_name);
        from.mtime = now;

        let to = inner.nodes.get_mut(&to_id).ok_or(NfsStat3::Stale)?;
        let NodeKind::Dir(children) = &mut to.kind else {
            return Err(NfsStat3::Notdir);
        };
        children.insert(to_name.to_string(), moved);
        to.mtime = now;

        inner.nodes.get_mut(&moved).unwrap().parent = to_id;
        Ok(())
    }

    fn readdir(
        &self,
        dir: &FileHandle,
        cookie: u64,
        count: u32,
    ) -> VfsResult<(Vec<DirEntry>, bool)> {
        let dir_id = Self::id_of(dir)?;
        let inner = self.inner.lock().unwrap();
        let node = inner.nodes.get(&dir_id).ok_or(NfsStat3::Stale)?;
        let NodeKind::Dir(children) = &node.kind else {
            return Err(NfsStat3::Notdir);
        };

        let mut entries = Vec::new();
        let mut eof = true;
        for (idx, (name, id)) in children.iter().enumerate() {
            let pos = idx as u64 + 1;
            if pos <= cookie {
                continue;
            }
            if entries.len() >= count as usize {
                eof = false;
                break;
            }
            entries.push(DirEntry { fileid: *id, name: name.clone(), cookie: pos });
        }
        Ok((entries, eof))
    }

    fn readlink(&self, fh: &FileHandle) -> VfsResult<String> {
        let id = Self::id_of(fh)?;
        let inner = self.inner.lock().unwrap();
        match &inner.nodes.get(&id).ok_or(NfsStat3::Stale)?.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(NfsStat3::Inval),
        }
    }

    fn symlink(
        &self,
        dir: &FileHandle,
        name: &str,
        target: &str,
    ) -> VfsResult<(FileHandle, Fattr)> {
        let dir_id = Self::id_of(dir)?;
        let mut inner = self.inner.lock().unwrap();
        let id = Self::insert_node(
            &mut inner,
            dir_id,
            name,
            NodeKind::Symlink(target.to_string()),
            0o777,
        )?;
        let node = inner.nodes.get(&id).ok_or(NfsStat3::Stale)?;
        Ok((Self::handle_of(id), Self::node_attr(id, node)))
    }

    fn link(&self, fh: &FileHandle, dir: &FileHandle, name: &str) -> VfsResult<()> {
        let id = Self::id_of(fh)?;
        let dir_id = Self::id_of(dir)?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(&id) {
            return Err(NfsStat3::Stale);
        }
        let now = Self::tick(&mut inner);
        let dir = inner.nodes.get_mut(&dir_id).ok_or(NfsStat3::Stale)?;
        let NodeKind::Dir(children) = &mut dir.kind else {
            return Err(NfsStat3::Notdir);
        };
        if children.contains_key(name) {
            return Err(NfsStat3::Exist);
        }
        children.insert(name.to_string(), id);
        dir.mtime = now;
        inner.nodes.get_mut(&id).unwrap().nlink += 1;
        Ok(())
    }

    fn fsstat(&self, _fh: &FileHandle) -> VfsResult<FsStat> {
        Ok(FsStat {
            total_bytes: 1 << 30,
            free_bytes: 1 << 29,
            avail_bytes: 1 << 29,
            total_files: 1 << 20,
            free_files: 1 << 19,
            avail_files: 1 << 19,
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

    fn commit(&self, _fh: &FileHandle, _offset: u64, _count: u32) -> VfsResult<()> {
        Ok(())
    }
}
