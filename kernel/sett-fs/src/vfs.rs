//! Mount table and the VFS facade.
//!
//! [`Vfs`] owns the mounted filesystems and the handle tables and exposes
//! the path-level operations the syscall layer is built on. It does no
//! locking of its own; the kernel front-end serializes access per the
//! mount/handle locking policy.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use sett_core::{Cause, Error, Location, Result, kinfo};

use crate::handle::{HandleNo, HandleTable};
use crate::{Filesystem, Inode, NodeKind, OpenFlags, path};

/// Maximum number of simultaneous mounts.
pub const MAX_MOUNTS: usize = 8;

/// Index into the mount table.
pub type MountId = usize;

fn fs_err(cause: Cause) -> Error {
    Error::new(Location::Fs, cause)
}

struct Mount {
    path: String,
    fs: Box<dyn Filesystem>,
}

/// The virtual filesystem: mount table plus handle tables.
pub struct Vfs {
    mounts: Vec<Option<Mount>>,
    handles: HandleTable,
}

impl Vfs {
    /// Creates a VFS with nothing mounted.
    #[must_use]
    pub fn new() -> Self {
        let mut mounts = Vec::new();
        mounts.resize_with(MAX_MOUNTS, || None);
        Self {
            mounts,
            handles: HandleTable::new(),
        }
    }

    /// Mounts `fs` at `path`.
    ///
    /// The path must be absolute; mounting over an existing mount point
    /// fails with `State`.
    pub fn mount(&mut self, mount_path: &str, fs: Box<dyn Filesystem>) -> Result<MountId> {
        if !path::is_absolute(mount_path) {
            return Err(fs_err(Cause::Param));
        }
        if self.mount_id(mount_path).is_some() {
            return Err(fs_err(Cause::State));
        }
        let slot = self
            .mounts
            .iter()
            .position(Option::is_none)
            .ok_or(fs_err(Cause::NoMem))?;
        kinfo!("vfs: mounted {} at {}", fs.name(), mount_path);
        self.mounts[slot] = Some(Mount {
            path: mount_path.to_string(),
            fs,
        });
        Ok(slot)
    }

    /// Unmounts the filesystem at `path`, returning it.
    ///
    /// Refused with `State` while any handle on it is open.
    pub fn unmount(&mut self, mount_path: &str) -> Result<Box<dyn Filesystem>> {
        let id = self.mount_id(mount_path).ok_or(fs_err(Cause::NotFound))?;
        if self.handles.open_count(id) > 0 {
            return Err(fs_err(Cause::State));
        }
        let mount = self.mounts[id].take().expect("mount exists");
        kinfo!("vfs: unmounted {}", mount.path);
        Ok(mount.fs)
    }

    fn mount_id(&self, mount_path: &str) -> Option<MountId> {
        self.mounts
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.path == mount_path))
    }

    fn fs(&self, id: MountId) -> &dyn Filesystem {
        self.mounts[id].as_ref().expect("mount exists").fs.as_ref()
    }

    fn fs_mut(&mut self, id: MountId) -> &mut (dyn Filesystem + 'static) {
        self.mounts[id].as_mut().expect("mount exists").fs.as_mut()
    }

    /// Resolves an absolute path to `(mount, inode)`.
    pub fn resolve(&self, abs_path: &str) -> Result<(MountId, Inode)> {
        if !path::is_absolute(abs_path) {
            return Err(fs_err(Cause::Param));
        }
        let mount_paths = self
            .mounts
            .iter()
            .flatten()
            .map(|m| m.path.as_str());
        let best = path::longest_prefix_match(abs_path, mount_paths)
            .ok_or(fs_err(Cause::NotFound))?;
        let id = self.mount_id(best).expect("matched mount exists");

        let fs = self.fs(id);
        let mut inode = fs.root();
        for component in path::components(path::strip_mount_prefix(abs_path, best)) {
            inode = fs.lookup(inode, component)?;
        }
        Ok((id, inode))
    }

    /// Opens `abs_path` per `flags`, returning a handle number.
    pub fn open(&mut self, abs_path: &str, flags: OpenFlags) -> Result<HandleNo> {
        let (id, inode) = match self.resolve(abs_path) {
            Ok(found) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(fs_err(Cause::State));
                }
                found
            }
            Err(e) if e.cause == Cause::NotFound && flags.contains(OpenFlags::CREATE) => {
                let (parent, name) = path::split_parent(abs_path).ok_or(fs_err(Cause::Param))?;
                let (id, dir) = self.resolve(parent)?;
                let inode = self.fs_mut(id).create(dir, name, NodeKind::File)?;
                (id, inode)
            }
            Err(e) => return Err(e),
        };

        let stat = self.fs(id).stat(inode)?;
        match stat.kind {
            NodeKind::Directory => {
                if !flags.contains(OpenFlags::DIRECTORY) {
                    return Err(fs_err(Cause::Illegal));
                }
                if flags.writable() {
                    return Err(fs_err(Cause::Illegal));
                }
            }
            NodeKind::File | NodeKind::Symlink => {
                if flags.contains(OpenFlags::DIRECTORY) {
                    return Err(fs_err(Cause::Illegal));
                }
            }
        }

        let mut size = stat.size;
        if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
            self.fs_mut(id).truncate(inode, 0)?;
            size = 0;
        }

        Ok(self.handles.open(id, inode, stat.kind, size, flags))
    }

    /// Closes a handle.
    pub fn close(&mut self, no: HandleNo) -> Result<()> {
        self.handles.close(no).map(|_| ())
    }

    /// Reads from a file handle at its cursor. `Ok(0)` is end-of-file.
    pub fn read(&mut self, no: HandleNo, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handles.get(no)?;
        if !handle.flags.readable() {
            return Err(fs_err(Cause::Illegal));
        }
        if self.handles.shared_of(no)?.kind == NodeKind::Directory {
            return Err(fs_err(Cause::Illegal));
        }
        let ((id, inode), offset) = (handle.key, handle.offset);

        let n = self.fs(id).read(inode, offset, buf)?;
        self.handles.get_mut(no)?.offset = offset + n as u64;
        Ok(n)
    }

    /// Writes to a file handle at its cursor (or the end, for APPEND).
    pub fn write(&mut self, no: HandleNo, buf: &[u8]) -> Result<usize> {
        let handle = self.handles.get(no)?;
        if !handle.flags.writable() {
            return Err(fs_err(Cause::ReadOnly));
        }
        let (id, inode) = handle.key;
        let offset = if handle.flags.contains(OpenFlags::APPEND) {
            self.handles.shared_of(no)?.size
        } else {
            handle.offset
        };

        let n = self.fs_mut(id).write(inode, offset, buf)?;
        let end = offset + n as u64;
        self.handles.get_mut(no)?.offset = end;
        let shared = self.handles.shared_of_mut(no)?;
        shared.size = shared.size.max(end);
        Ok(n)
    }

    /// Reads packed directory entries into `buf`, returning bytes written.
    ///
    /// Only whole entries are returned; the handle cursor advances by
    /// entries consumed. `Ok(0)` means end of directory (or a too-small
    /// buffer).
    pub fn getdents(&mut self, no: HandleNo, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handles.get(no)?;
        if self.handles.shared_of(no)?.kind != NodeKind::Directory {
            return Err(fs_err(Cause::Illegal));
        }
        let (id, inode) = handle.key;
        let mut index = usize::try_from(handle.offset).map_err(|_| fs_err(Cause::Range))?;
        let mut written = 0;

        while let Some(entry) = self.fs(id).dir_entry(inode, index)? {
            let Some(n) = entry.encode(&mut buf[written..]) else {
                break;
            };
            written += n;
            index += 1;
        }
        self.handles.get_mut(no)?.offset = index as u64;
        Ok(written)
    }

    /// Cached size of the node behind a handle.
    pub fn size_of(&self, no: HandleNo) -> Result<u64> {
        Ok(self.handles.shared_of(no)?.size)
    }

    /// Number of open handles. Diagnostic.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Runs `f` against the filesystem mounted at `id`. Bring-up paths use
    /// this to seed the root filesystem.
    pub fn with_fs_mut<R>(&mut self, id: MountId, f: impl FnOnce(&mut dyn Filesystem) -> R) -> R {
        f(self.fs_mut(id))
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;

    fn vfs_with_root() -> Vfs {
        let mut root = RamFs::new();
        root.populate("/etc/motd", b"hello sett\n").unwrap();
        root.populate("/sbin/init", b"\x7fELF-ish").unwrap();
        let mut vfs = Vfs::new();
        vfs.mount("/", Box::new(root)).unwrap();
        vfs
    }

    #[test]
    fn resolve_walks_components() {
        let vfs = vfs_with_root();
        let (id, inode) = vfs.resolve("/etc/motd").unwrap();
        assert_eq!(id, 0);
        assert!(inode > 1);
        assert_eq!(vfs.resolve("/nope").unwrap_err().cause, Cause::NotFound);
        assert_eq!(vfs.resolve("relative").unwrap_err().cause, Cause::Param);
    }

    #[test]
    fn open_read_close() {
        let mut vfs = vfs_with_root();
        let h = vfs.open("/etc/motd", OpenFlags::READONLY).unwrap();
        let mut buf = [0u8; 128];
        let n = vfs.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello sett\n");
        // Cursor advanced to EOF.
        assert_eq!(vfs.read(h, &mut buf).unwrap(), 0);
        vfs.close(h).unwrap();
        assert_eq!(vfs.read(h, &mut buf).unwrap_err().cause, Cause::NotFound);
    }

    #[test]
    fn two_openers_have_independent_cursors_shared_size() {
        let mut vfs = vfs_with_root();
        let a = vfs.open("/etc/motd", OpenFlags::READWRITE).unwrap();
        let b = vfs.open("/etc/motd", OpenFlags::READONLY).unwrap();

        let mut buf = [0u8; 5];
        vfs.read(a, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Writing through `a` is visible to `b` from its own cursor.
        let c = vfs
            .open("/etc/motd", OpenFlags::WRITEONLY | OpenFlags::APPEND)
            .unwrap();
        vfs.write(c, b"more").unwrap();
        assert_eq!(vfs.size_of(b).unwrap(), 15);

        vfs.close(a).unwrap();
        vfs.close(b).unwrap();
        vfs.close(c).unwrap();
        assert_eq!(vfs.open_handles(), 0);
    }

    #[test]
    fn create_truncate_exclusive() {
        let mut vfs = vfs_with_root();
        // CREATE makes a missing file.
        let h = vfs
            .open("/etc/new", OpenFlags::WRITEONLY | OpenFlags::CREATE)
            .unwrap();
        vfs.write(h, b"data").unwrap();
        vfs.close(h).unwrap();

        // EXCLUSIVE refuses an existing file.
        assert_eq!(
            vfs.open(
                "/etc/new",
                OpenFlags::WRITEONLY | OpenFlags::CREATE | OpenFlags::EXCLUSIVE
            )
            .unwrap_err()
            .cause,
            Cause::State
        );

        // TRUNCATE discards content.
        let h = vfs
            .open("/etc/new", OpenFlags::READWRITE | OpenFlags::TRUNCATE)
            .unwrap();
        assert_eq!(vfs.size_of(h).unwrap(), 0);
        vfs.close(h).unwrap();
    }

    #[test]
    fn directories_need_the_directory_flag() {
        let mut vfs = vfs_with_root();
        assert_eq!(
            vfs.open("/etc", OpenFlags::READONLY).unwrap_err().cause,
            Cause::Illegal
        );
        assert_eq!(
            vfs.open(
                "/etc/motd",
                OpenFlags::READONLY | OpenFlags::DIRECTORY
            )
            .unwrap_err()
            .cause,
            Cause::Illegal
        );
        let h = vfs
            .open("/etc", OpenFlags::READONLY | OpenFlags::DIRECTORY)
            .unwrap();
        vfs.close(h).unwrap();
    }

    #[test]
    fn getdents_packs_and_paginates() {
        let mut vfs = vfs_with_root();
        let h = vfs
            .open("/", OpenFlags::READONLY | OpenFlags::DIRECTORY)
            .unwrap();

        // Tiny buffer: one entry per call ("etc" then "sbin").
        let mut buf = [0u8; 20];
        let n = vfs.getdents(h, &mut buf).unwrap();
        let (entry, len) = crate::dirent::DirEntry::decode(&buf[..n]).unwrap();
        assert_eq!(len, n);
        assert_eq!(entry.name, "etc");
        assert_eq!(entry.kind, NodeKind::Directory);

        let n = vfs.getdents(h, &mut buf).unwrap();
        let (entry, _) = crate::dirent::DirEntry::decode(&buf[..n]).unwrap();
        assert_eq!(entry.name, "sbin");

        assert_eq!(vfs.getdents(h, &mut buf).unwrap(), 0);
        vfs.close(h).unwrap();
    }

    #[test]
    fn unmount_refused_while_open() {
        let mut vfs = vfs_with_root();
        let h = vfs.open("/etc/motd", OpenFlags::READONLY).unwrap();
        assert_eq!(vfs.unmount("/").unwrap_err().cause, Cause::State);
        vfs.close(h).unwrap();
        vfs.unmount("/").unwrap();
        assert_eq!(vfs.resolve("/etc").unwrap_err().cause, Cause::NotFound);
    }

    #[test]
    fn nested_mounts_resolve_to_deepest() {
        let mut vfs = vfs_with_root();
        let mut dev = RamFs::new();
        dev.populate("/null", b"").unwrap();
        vfs.mount("/dev", Box::new(dev)).unwrap();

        let (id, _) = vfs.resolve("/dev/null").unwrap();
        assert_eq!(id, 1);
        let (id, _) = vfs.resolve("/etc/motd").unwrap();
        assert_eq!(id, 0);
    }
}
