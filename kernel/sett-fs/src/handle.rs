//! Shared node and opener handle tables.
//!
//! Shared nodes are unique per `(mount, inode)`: the first open creates the
//! entry, further opens increment its refcount, the last close removes it.
//! Opener handles carry the per-`open()` cursor and flags and a global
//! handle number that is never reused.

use alloc::collections::BTreeMap;

use sett_core::{Cause, Error, Location, Result};

use crate::vfs::MountId;
use crate::{Inode, NodeKind, OpenFlags};

/// Global handle number handed to consumers (process fd tables).
pub type HandleNo = i32;

/// State shared by every opener of one node.
#[derive(Debug)]
pub struct SharedNode {
    /// Number of open handles referring to this node.
    pub refcount: usize,
    /// Cached size; updated on writes through any handle.
    pub size: u64,
    /// Node kind at open time.
    pub kind: NodeKind,
}

/// Per-opener state.
#[derive(Debug)]
pub struct OpenHandle {
    /// The shared node this handle refers to.
    pub key: (MountId, Inode),
    /// Cursor: byte offset for files, entry index for directories.
    pub offset: u64,
    /// Access flags from `open()`.
    pub flags: OpenFlags,
}

/// Both tables plus the handle number dispenser.
pub struct HandleTable {
    shared: BTreeMap<(MountId, Inode), SharedNode>,
    handles: BTreeMap<HandleNo, OpenHandle>,
    next_no: HandleNo,
}

impl HandleTable {
    /// Creates empty tables.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shared: BTreeMap::new(),
            handles: BTreeMap::new(),
            next_no: 0,
        }
    }

    /// Opens a handle onto `(mount, inode)`, creating or ref-bumping the
    /// shared node.
    pub fn open(
        &mut self,
        mount: MountId,
        inode: Inode,
        kind: NodeKind,
        size: u64,
        flags: OpenFlags,
    ) -> HandleNo {
        let key = (mount, inode);
        let shared = self.shared.entry(key).or_insert(SharedNode {
            refcount: 0,
            size,
            kind,
        });
        shared.refcount += 1;

        let no = self.next_no;
        self.next_no += 1;
        self.handles.insert(
            no,
            OpenHandle {
                key,
                offset: 0,
                flags,
            },
        );
        no
    }

    /// Closes a handle. Returns the node key and whether this was the last
    /// handle on it (the shared entry is gone in that case).
    pub fn close(&mut self, no: HandleNo) -> Result<((MountId, Inode), bool)> {
        let handle = self
            .handles
            .remove(&no)
            .ok_or(Error::new(Location::Fs, Cause::NotFound))?;
        let shared = self
            .shared
            .get_mut(&handle.key)
            .expect("open handle without shared node");
        shared.refcount -= 1;
        let last = shared.refcount == 0;
        if last {
            self.shared.remove(&handle.key);
        }
        Ok((handle.key, last))
    }

    /// Looks up a handle.
    pub fn get(&self, no: HandleNo) -> Result<&OpenHandle> {
        self.handles
            .get(&no)
            .ok_or(Error::new(Location::Fs, Cause::NotFound))
    }

    /// Looks up a handle mutably.
    pub fn get_mut(&mut self, no: HandleNo) -> Result<&mut OpenHandle> {
        self.handles
            .get_mut(&no)
            .ok_or(Error::new(Location::Fs, Cause::NotFound))
    }

    /// The shared node a handle refers to.
    pub fn shared_of(&self, no: HandleNo) -> Result<&SharedNode> {
        let handle = self.get(no)?;
        Ok(&self.shared[&handle.key])
    }

    /// The shared node a handle refers to, mutably.
    pub fn shared_of_mut(&mut self, no: HandleNo) -> Result<&mut SharedNode> {
        let key = self.get(no)?.key;
        Ok(self.shared.get_mut(&key).expect("shared node exists"))
    }

    /// Number of open handles on nodes of `mount`.
    #[must_use]
    pub fn open_count(&self, mount: MountId) -> usize {
        self.handles.values().filter(|h| h.key.0 == mount).count()
    }

    /// Total number of open handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no handles are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_nodes_refcount_across_openers() {
        let mut table = HandleTable::new();
        let a = table.open(0, 7, NodeKind::File, 100, OpenFlags::READONLY);
        let b = table.open(0, 7, NodeKind::File, 100, OpenFlags::READWRITE);
        assert_ne!(a, b);
        assert_eq!(table.shared_of(a).unwrap().refcount, 2);

        let (_, last) = table.close(a).unwrap();
        assert!(!last);
        assert_eq!(table.shared_of(b).unwrap().refcount, 1);
        let (_, last) = table.close(b).unwrap();
        assert!(last);
        assert!(table.is_empty());
    }

    #[test]
    fn distinct_nodes_get_distinct_shared_entries() {
        let mut table = HandleTable::new();
        let a = table.open(0, 1, NodeKind::File, 0, OpenFlags::READONLY);
        let b = table.open(1, 1, NodeKind::File, 0, OpenFlags::READONLY);
        assert_eq!(table.shared_of(a).unwrap().refcount, 1);
        assert_eq!(table.shared_of(b).unwrap().refcount, 1);
        assert_eq!(table.open_count(0), 1);
        assert_eq!(table.open_count(1), 1);
    }

    #[test]
    fn handle_numbers_never_reused() {
        let mut table = HandleTable::new();
        let a = table.open(0, 1, NodeKind::File, 0, OpenFlags::READONLY);
        table.close(a).unwrap();
        let b = table.open(0, 1, NodeKind::File, 0, OpenFlags::READONLY);
        assert!(b > a);
    }

    #[test]
    fn close_of_unknown_handle_fails() {
        let mut table = HandleTable::new();
        assert_eq!(table.close(99).unwrap_err().cause, Cause::NotFound);
    }

    #[test]
    fn offsets_are_per_handle() {
        let mut table = HandleTable::new();
        let a = table.open(0, 7, NodeKind::File, 100, OpenFlags::READONLY);
        let b = table.open(0, 7, NodeKind::File, 100, OpenFlags::READONLY);
        table.get_mut(a).unwrap().offset = 50;
        assert_eq!(table.get(b).unwrap().offset, 0);
        table.close(a).unwrap();
        table.close(b).unwrap();
    }
}
