//! Protocol-agnostic byte-range lock table.
//!
//! Both the NFSv4 state manager and the NLM server store their locks here,
//! keyed by an opaque owner string with a protocol prefix (`nfs4:…`,
//! `nlm:host:svid`) so the two protocols exclude each other without
//! colliding. A length of `u64::MAX` means "to end of file" throughout.
//!
//! The table has no internal synchronization; the caller supplies the
//! mutex (the NFSv4 state manager's lock, which the NLM server shares).

use crate::vfs::FileHandle;

pub type LockOwnerKey = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRange {
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
}

/// Who is in the way, reported by [`ByteRangeLockTable::test`] and a failed
/// [`ByteRangeLockTable::acquire`].
#[derive(Clone, Debug)]
pub struct LockConflict {
    pub offset: u64,
    pub length: u64,
    pub exclusive: bool,
    pub owner: LockOwnerKey,
}

#[derive(Clone, Debug)]
struct LockEntry {
    owner: LockOwnerKey,
    fh: FileHandle,
    ranges: Vec<LockRange>,
}

#[derive(Debug, Default)]
pub struct ByteRangeLockTable {
    entries: Vec<LockEntry>,
}

impl ByteRangeLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges_overlap(o1: u64, l1: u64, o2: u64, l2: u64) -> bool {
        let end1 = if l1 == u64::MAX { u64::MAX } else { o1.saturating_add(l1) };
        let end2 = if l2 == u64::MAX { u64::MAX } else { o2.saturating_add(l2) };
        o1 < end2 && o2 < end1
    }

    fn find_entry(&mut self, fh: &FileHandle, owner: &str) -> Option<&mut LockEntry> {
        self.entries.iter_mut().find(|e| e.fh == *fh && e.owner == owner)
    }

    fn remove_range(entry: &mut LockEntry, offset: u64, length: u64) {
        let window_end = if length == u64::MAX { u64::MAX } else { offset.saturating_add(length) };
        let mut kept = Vec::with_capacity(entry.ranges.len());

        for r in &entry.ranges {
            let r_end = if r.length == u64::MAX { u64::MAX } else { r.offset.saturating_add(r.length) };

            if !Self::ranges_overlap(offset, length, r.offset, r.length) {
                kept.push(*r);
                continue;
            }

            // Left remnant below the removal window.
            if r.offset < offset {
                kept.push(LockRange {
                    offset: r.offset,
                    length: offset - r.offset,
                    exclusive: r.exclusive,
                });
            }

            // Right remnant above it.
            if r_end > window_end && window_end != u64::MAX {
                kept.push(LockRange {
                    offset: window_end,
                    length: if r.length == u64::MAX { u64::MAX } else { r_end - window_end },
                    exclusive: r.exclusive,
                });
            }
        }

        entry.ranges = kept;
    }

    fn cleanup_empty(&mut self) {
        self.entries.retain(|e| !e.ranges.is_empty());
    }

    /// Look for a conflicting lock without changing state.
    pub fn test(
        &self,
        fh: &FileHandle,
        requester: &str,
        exclusive: bool,
        offset: u64,
        length: u64,
    ) -> Option<LockConflict> {
        for entry in &self.entries {
            if entry.fh != *fh || entry.owner == requester {
                continue;
            }
            for r in &entry.ranges {
                if !exclusive && !r.exclusive {
                    continue; // read locks never conflict with each other
                }
                if Self::ranges_overlap(offset, length, r.offset, r.length) {
                    return Some(LockConflict {
                        offset: r.offset,
                        length: r.length,
                        exclusive: r.exclusive,
                        owner: entry.owner.clone(),
                    });
                }
            }
        }
        None
    }

    /// Acquire a lock. Same-owner locks never conflict with themselves and
    /// accumulate additively.
    pub fn acquire(
        &mut self,
        fh: &FileHandle,
        owner: &str,
        exclusive: bool,
        offset: u64,
        length: u64,
    ) -> Result<(), LockConflict> {
        if let Some(conflict) = self.test(fh, owner, exclusive, offset, length) {
            return Err(conflict);
        }
        match self.find_entry(fh, owner) {
            Some(entry) => entry.ranges.push(LockRange { offset, length, exclusive }),
            None => self.entries.push(LockEntry {
                owner: owner.to_string(),
                fh: *fh,
                ranges: vec![LockRange { offset, length, exclusive }],
            }),
        }
        Ok(())
    }

    /// Release a window, splitting any ranges that straddle it.
    pub fn release(&mut self, fh: &FileHandle, owner: &str, offset: u64, length: u64) {
        if let Some(entry) = self.find_entry(fh, owner) {
            Self::remove_range(entry, offset, length);
        }
        self.cleanup_empty();
    }

    /// Drop every lock held by an owner.
    pub fn release_all(&mut self, owner: &str) {
        self.entries.retain(|e| e.owner != owner);
    }

    /// Drop every lock whose owner key starts with `prefix` (NLM uses this
    /// to evict all locks of a rebooted host via `"nlm:host:"`).
    pub fn release_all_matching(&mut self, prefix: &str) {
        self.entries.retain(|e| !e.owner.starts_with(prefix));
    }

    /// Drop every lock an owner holds on one file.
    pub fn release_all_for_file(&mut self, fh: &FileHandle, owner: &str) {
        self.entries.retain(|e| !(e.fh == *fh && e.owner == owner));
    }

    /// Does the owner hold any lock on this file?
    pub fn has_locks(&self, fh: &FileHandle, owner: &str) -> bool {
        self.entries.iter().any(|e| e.fh == *fh && e.owner == owner && !e.ranges.is_empty())
    }

    /// The owner's current ranges on a file.
    pub fn ranges(&self, fh: &FileHandle, owner: &str) -> Vec<LockRange> {
        self.entries
            .iter()
            .find(|e| e.fh == *fh && e.owner == owner)
            .map(|e| e.ranges.clone())
            .unwrap_or_default()
    }
}
