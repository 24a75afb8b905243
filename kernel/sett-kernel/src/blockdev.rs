//! Block device registry.
//!
//! Filesystems and the partition layer find their backing stores here.
//! Every registered device sits behind the write-back cache; a repeating
//! housekeeping task ages dirty entries out per the cache's write timeout.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use sett_blockdev::cache::CachedDevice;
use sett_blockdev::{BlockDevice, ram::RamDisk};
use sett_core::sync::SpinLock;
use sett_core::{Cause, Error, Location, Result, kwarn};

/// Object-safe face of a cached device, so the registry can hold mixed
/// backends.
pub trait ManagedBlockDev: Send {
    /// Device block size in bytes.
    fn block_size(&self) -> usize;
    /// Reads one block through the cache.
    fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes one block through the cache.
    fn write(&mut self, block: u64, buf: &[u8]) -> Result<()>;
    /// Reads part of a block through the cache.
    fn read_partial(&mut self, block: u64, offset: usize, buf: &mut [u8]) -> Result<()>;
    /// Writes part of a block through the cache.
    fn write_partial(&mut self, block: u64, offset: usize, buf: &[u8]) -> Result<()>;
    /// Flushes all dirty cache entries.
    fn flush(&mut self) -> Result<()>;
    /// Ages out dirty entries past the write timeout.
    fn housekeeping(&mut self) -> Result<()>;
}

impl<D: BlockDevice + Send> ManagedBlockDev for CachedDevice<D> {
    fn block_size(&self) -> usize {
        CachedDevice::block_size(self)
    }

    fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        CachedDevice::read(self, block, buf)
    }

    fn write(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        CachedDevice::write(self, block, buf)
    }

    fn read_partial(&mut self, block: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        CachedDevice::read_partial(self, block, offset, buf)
    }

    fn write_partial(&mut self, block: u64, offset: usize, buf: &[u8]) -> Result<()> {
        CachedDevice::write_partial(self, block, offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        CachedDevice::flush(self)
    }

    fn housekeeping(&mut self) -> Result<()> {
        CachedDevice::housekeeping(self)
    }
}

struct RegisteredDev {
    name: String,
    dev: Box<dyn ManagedBlockDev>,
}

static DEVICES: SpinLock<Vec<RegisteredDev>> = SpinLock::new(Vec::new());

fn blk_err(cause: Cause) -> Error {
    Error::new(Location::BlkDev, cause)
}

/// Registers a cached device under `name` ("ram0", "sd0", …).
pub fn register(name: &str, dev: Box<dyn ManagedBlockDev>) -> Result<()> {
    let mut devices = DEVICES.lock();
    if devices.iter().any(|d| d.name == name) {
        return Err(blk_err(Cause::State));
    }
    devices.push(RegisteredDev {
        name: name.to_string(),
        dev,
    });
    Ok(())
}

/// Creates, caches, and registers a RAM disk. Returns its name.
pub fn register_ramdisk(
    name: &str,
    block_size: usize,
    block_count: usize,
    cache_depth: usize,
) -> Result<()> {
    let cached = CachedDevice::open(RamDisk::new(block_size, block_count), cache_depth, true)?;
    register(name, Box::new(cached))
}

/// Runs `f` against the device registered as `name`.
pub fn with_device<R>(
    name: &str,
    f: impl FnOnce(&mut dyn ManagedBlockDev) -> R,
) -> Result<R> {
    let mut devices = DEVICES.lock();
    let entry = devices
        .iter_mut()
        .find(|d| d.name == name)
        .ok_or(blk_err(Cause::NotFound))?;
    Ok(f(entry.dev.as_mut()))
}

/// Housekeeping task: age out dirty cache entries on every device.
/// Registered as a repeating task by the boot path.
pub fn housekeeping_task(_taskno: i64, _cookie: usize) {
    let mut devices = DEVICES.lock();
    for entry in devices.iter_mut() {
        if let Err(e) = entry.dev.housekeeping() {
            kwarn!("blockdev {}: housekeeping failed: {e}", entry.name);
        }
    }
}

/// Flushes every registered device. Shutdown path.
pub fn flush_all() -> Result<()> {
    let mut devices = DEVICES.lock();
    for entry in devices.iter_mut() {
        entry.dev.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_roundtrip() {
        register_ramdisk("ram-test", 512, 8, 4).unwrap();
        assert_eq!(
            register_ramdisk("ram-test", 512, 8, 4).unwrap_err().cause,
            Cause::State
        );

        with_device("ram-test", |dev| {
            assert_eq!(dev.block_size(), 512);
            dev.write(3, &[0x42; 512]).unwrap();
            let mut buf = [0u8; 512];
            dev.read(3, &mut buf).unwrap();
            assert_eq!(buf, [0x42; 512]);

            dev.write_partial(3, 10, b"patch").unwrap();
            let mut out = [0u8; 5];
            dev.read_partial(3, 10, &mut out).unwrap();
            assert_eq!(&out, b"patch");
        })
        .unwrap();

        flush_all().unwrap();
        assert_eq!(
            with_device("missing", |_| ()).unwrap_err().cause,
            Cause::NotFound
        );
    }
}
