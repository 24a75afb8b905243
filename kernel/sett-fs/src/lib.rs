//! Virtual filesystem core.
//!
//! The VFS splits open files two ways: a *shared node* per `(mount, inode)`
//! holding the refcount and cached size, and an *opener handle* per `open()`
//! holding the cursor and access flags. The mount table resolves absolute
//! paths to `(mount, inode)` pairs by longest-prefix match and component
//! walk; concrete filesystems implement [`Filesystem`] and are mounted as
//! trait objects.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod dirent;
pub mod handle;
pub mod path;
pub mod ramfs;
pub mod vfs;

use sett_core::Result;

pub use dirent::DirEntry;
pub use handle::{HandleNo, HandleTable};
pub use vfs::{MountId, Vfs};

/// Filesystem-assigned node number, unique within one mounted filesystem.
pub type Inode = u64;

bitflags::bitflags! {
    /// Open flags. The numeric values are syscall ABI.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READONLY = 0x01;
        /// Open for writing.
        const WRITEONLY = 0x02;
        /// Open for reading and writing.
        const READWRITE = 0x03;
        /// All writes go to the end of the file.
        const APPEND = 0x04;
        /// Truncate to zero length on open.
        const TRUNCATE = 0x08;
        /// Create the file if it does not exist.
        const CREATE = 0x10;
        /// With CREATE: fail if the file already exists.
        const EXCLUSIVE = 0x20;
        /// Close the descriptor on exec.
        const CLOEXEC = 0x40;
        /// The path must name a directory.
        const DIRECTORY = 0x80;
    }
}

impl OpenFlags {
    /// Whether reads are permitted.
    #[must_use]
    pub fn readable(self) -> bool {
        self.contains(Self::READONLY)
    }

    /// Whether writes are permitted.
    #[must_use]
    pub fn writable(self) -> bool {
        self.contains(Self::WRITEONLY)
    }
}

/// Kind of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Node metadata as reported by a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// File, directory, or symlink.
    pub kind: NodeKind,
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// Permission bits in the on-wire dirent format.
    pub perms: u16,
}

/// Contract a concrete filesystem presents to the VFS.
///
/// Node identity is by [`Inode`]; the VFS never sees backend structures.
/// Implementations do not lock: the VFS serializes access per mount.
pub trait Filesystem: Send + core::fmt::Debug {
    /// Short backend name for logs ("ramfs", "fat", …).
    fn name(&self) -> &'static str;

    /// Root directory inode.
    fn root(&self) -> Inode;

    /// Looks `name` up in directory `dir`.
    fn lookup(&self, dir: Inode, name: &str) -> Result<Inode>;

    /// Node metadata.
    fn stat(&self, inode: Inode) -> Result<NodeStat>;

    /// Creates a node named `name` in directory `dir`.
    fn create(&mut self, dir: Inode, name: &str, kind: NodeKind) -> Result<Inode>;

    /// Removes the node named `name` from directory `dir`.
    fn unlink(&mut self, dir: Inode, name: &str) -> Result<()>;

    /// Reads from a file at `offset`; returns bytes read (0 at EOF).
    fn read(&self, inode: Inode, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes to a file at `offset`, extending it as needed; returns bytes
    /// written.
    fn write(&mut self, inode: Inode, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Sets a file's size, zero-filling when growing.
    fn truncate(&mut self, inode: Inode, size: u64) -> Result<()>;

    /// Returns directory entry number `index` of directory `inode`, or
    /// `None` past the end.
    fn dir_entry(&self, inode: Inode, index: usize) -> Result<Option<DirEntry>>;
}
