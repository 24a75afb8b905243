//! Kernel front-end to the VFS.
//!
//! Owns the global [`Vfs`] instance and applies the locking policy: the
//! *mount* mutex is taken shared by every file operation and exclusively by
//! mount/unmount; the *handle* mutex is taken exclusively by open/close and
//! shared by I/O. The short spin lock underneath only covers the actual
//! table access.

use alloc::boxed::Box;
use alloc::vec::Vec;

use sett_core::clock::TIMESTAMP_MAX;
use sett_core::sync::{Mutex, SpinLock};
use sett_core::{Cause, Error, Location, Result};
use sett_fs::{Filesystem, HandleNo, OpenFlags, Vfs};

static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);
static MOUNT_MTX: Mutex = Mutex::new_shared();
static HANDLE_MTX: Mutex = Mutex::new_shared();

fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> Result<R>) -> Result<R> {
    let mut vfs = VFS.lock();
    let vfs = vfs
        .as_mut()
        .ok_or(Error::new(Location::Fs, Cause::NotConfigured))?;
    f(vfs)
}

/// Initializes the VFS and mounts `root` at `/`.
pub fn init(root: Box<dyn Filesystem>) -> Result<()> {
    {
        let mut vfs = VFS.lock();
        if vfs.is_some() {
            return Err(Error::new(Location::Fs, Cause::State));
        }
        *vfs = Some(Vfs::new());
    }
    mount("/", root)
}

/// Mounts a filesystem.
pub fn mount(path: &str, fs: Box<dyn Filesystem>) -> Result<()> {
    MOUNT_MTX.acquire(TIMESTAMP_MAX)?;
    let res = with_vfs(|vfs| vfs.mount(path, fs).map(|_| ()));
    MOUNT_MTX.release()?;
    res
}

/// Unmounts the filesystem at `path`.
pub fn unmount(path: &str) -> Result<()> {
    MOUNT_MTX.acquire(TIMESTAMP_MAX)?;
    let res = with_vfs(|vfs| vfs.unmount(path).map(|_| ()));
    MOUNT_MTX.release()?;
    res
}

/// Opens a path, returning a global handle number.
pub fn open(path: &str, flags: OpenFlags) -> Result<HandleNo> {
    MOUNT_MTX.acquire_shared(TIMESTAMP_MAX)?;
    HANDLE_MTX.acquire(TIMESTAMP_MAX)?;
    let res = with_vfs(|vfs| vfs.open(path, flags));
    HANDLE_MTX.release()?;
    MOUNT_MTX.release_shared()?;
    res
}

/// Closes a handle.
pub fn close(handle: HandleNo) -> Result<()> {
    MOUNT_MTX.acquire_shared(TIMESTAMP_MAX)?;
    HANDLE_MTX.acquire(TIMESTAMP_MAX)?;
    let res = with_vfs(|vfs| vfs.close(handle));
    HANDLE_MTX.release()?;
    MOUNT_MTX.release_shared()?;
    res
}

fn io<R>(f: impl FnOnce(&mut Vfs) -> Result<R>) -> Result<R> {
    MOUNT_MTX.acquire_shared(TIMESTAMP_MAX)?;
    HANDLE_MTX.acquire_shared(TIMESTAMP_MAX)?;
    let res = with_vfs(f);
    HANDLE_MTX.release_shared()?;
    MOUNT_MTX.release_shared()?;
    res
}

/// Reads from a handle at its cursor; `Ok(0)` is end-of-file.
pub fn read(handle: HandleNo, buf: &mut [u8]) -> Result<usize> {
    io(|vfs| vfs.read(handle, buf))
}

/// Writes to a handle at its cursor.
pub fn write(handle: HandleNo, buf: &[u8]) -> Result<usize> {
    io(|vfs| vfs.write(handle, buf))
}

/// Reads packed directory entries.
pub fn getdents(handle: HandleNo, buf: &mut [u8]) -> Result<usize> {
    io(|vfs| vfs.getdents(handle, buf))
}

/// Size of the node behind a handle.
pub fn size_of(handle: HandleNo) -> Result<u64> {
    io(|vfs| vfs.size_of(handle))
}

/// Reads a whole file into memory. Boot and program loading use this.
pub fn read_file(path: &str) -> Result<Vec<u8>> {
    let handle = open(path, OpenFlags::READONLY)?;
    let mut data = Vec::new();
    let mut chunk = [0u8; 512];
    let res = loop {
        match read(handle, &mut chunk) {
            Ok(0) => break Ok(data),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) => break Err(e),
        }
    };
    let _ = close(handle);
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use sett_fs::ramfs::RamFs;

    // One global VFS per process: a single test exercises the front-end
    // end to end.
    #[test]
    fn front_end_roundtrip() {
        let mut root = RamFs::new();
        root.populate("/etc/motd", b"hello from the sett\n").unwrap();
        root.populate("/sbin/init", &[0x13, 0x00, 0x00, 0x00]).unwrap();
        init(Box::new(root)).unwrap();
        assert_eq!(
            init(Box::new(RamFs::new())).unwrap_err().cause,
            Cause::State
        );

        // read_file sees the whole content.
        assert_eq!(read_file("/etc/motd").unwrap(), b"hello from the sett\n");

        // Handle-level I/O.
        let h = open(
            "/etc/notes",
            OpenFlags::READWRITE | OpenFlags::CREATE,
        )
        .unwrap();
        write(h, b"persistent").unwrap();
        close(h).unwrap();
        assert_eq!(read_file("/etc/notes").unwrap(), b"persistent");

        // Directory listing through the front-end.
        let d = open("/", OpenFlags::READONLY | OpenFlags::DIRECTORY).unwrap();
        let mut buf = [0u8; 256];
        let n = getdents(d, &mut buf).unwrap();
        assert!(n > 0);
        close(d).unwrap();

        // Secondary mounts resolve.
        let mut dev = RamFs::new();
        dev.populate("/zero", b"").unwrap();
        mount("/dev", Box::new(dev)).unwrap();
        let h = open("/dev/zero", OpenFlags::READONLY).unwrap();
        close(h).unwrap();
        unmount("/dev").unwrap();
        assert_eq!(
            open("/dev/zero", OpenFlags::READONLY).unwrap_err().cause,
            Cause::NotFound
        );
    }
}
