//! RAM-backed block device.
//!
//! The reference backend: a flat byte buffer with per-block erase state and
//! a raw-write counter so tests can observe when the cache actually touches
//! "hardware".

use alloc::vec;
use alloc::vec::Vec;

use sett_core::{Cause, Error, Location, Result};

use crate::BlockDevice;

/// Byte value of erased storage.
pub const ERASED_BYTE: u8 = 0xff;

/// A block device over a memory buffer.
pub struct RamDisk {
    data: Vec<u8>,
    erased: Vec<bool>,
    block_size: usize,
    readonly: bool,
    writes: u64,
    erases: u64,
}

impl RamDisk {
    /// Creates a disk of `block_count` blocks of `block_size` bytes, fully
    /// erased.
    #[must_use]
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            data: vec![ERASED_BYTE; block_size * block_count],
            erased: vec![true; block_count],
            block_size,
            readonly: false,
            writes: 0,
            erases: 0,
        }
    }

    /// Marks the disk read-only.
    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Number of raw block writes the device has performed.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Number of raw erases the device has performed.
    #[must_use]
    pub fn erase_count(&self) -> u64 {
        self.erases
    }

    fn range_of(&self, block: u64, offset: usize, len: usize) -> Result<core::ops::Range<usize>> {
        let block = usize::try_from(block)
            .map_err(|_| Error::new(Location::BlkDev, Cause::Range))?;
        if block >= self.erased.len() || offset + len > self.block_size {
            return Err(Error::new(Location::BlkDev, Cause::Range));
        }
        let start = block * self.block_size + offset;
        Ok(start..start + len)
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.erased.len() as u64
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn supports_partial(&self) -> bool {
        true
    }

    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range_of(block, 0, self.block_size)?;
        buf[..self.block_size].copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::new(Location::BlkDev, Cause::ReadOnly));
        }
        let range = self.range_of(block, 0, self.block_size)?;
        self.data[range].copy_from_slice(&buf[..self.block_size]);
        self.erased[block as usize] = false;
        self.writes += 1;
        Ok(())
    }

    fn erase_block(&mut self, block: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::new(Location::BlkDev, Cause::ReadOnly));
        }
        let range = self.range_of(block, 0, self.block_size)?;
        self.data[range].fill(ERASED_BYTE);
        self.erased[block as usize] = true;
        self.erases += 1;
        Ok(())
    }

    fn is_erased(&mut self, block: u64) -> Result<bool> {
        let block = usize::try_from(block)
            .map_err(|_| Error::new(Location::BlkDev, Cause::Range))?;
        self.erased
            .get(block)
            .copied()
            .ok_or(Error::new(Location::BlkDev, Cause::Range))
    }

    fn read_partial(&mut self, block: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = self.range_of(block, offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_partial(&mut self, block: u64, offset: usize, buf: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::new(Location::BlkDev, Cause::ReadOnly));
        }
        let range = self.range_of(block, offset, buf.len())?;
        self.data[range].copy_from_slice(buf);
        self.erased[block as usize] = false;
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_disk_reads_erased() {
        let mut disk = RamDisk::new(512, 4);
        let mut buf = [0u8; 512];
        disk.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == ERASED_BYTE));
        assert!(disk.is_erased(2).unwrap());
    }

    #[test]
    fn write_clears_erased_and_counts() {
        let mut disk = RamDisk::new(512, 4);
        disk.write_block(1, &[7u8; 512]).unwrap();
        assert!(!disk.is_erased(1).unwrap());
        assert_eq!(disk.write_count(), 1);
        let mut buf = [0u8; 512];
        disk.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
    }

    #[test]
    fn partial_io_roundtrip() {
        let mut disk = RamDisk::new(512, 4);
        disk.write_partial(0, 100, b"hello").unwrap();
        let mut out = [0u8; 5];
        disk.read_partial(0, 100, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn readonly_refuses_mutation() {
        let mut disk = RamDisk::new(512, 4).readonly();
        assert_eq!(
            disk.write_block(0, &[0u8; 512]).unwrap_err().cause,
            Cause::ReadOnly
        );
        assert_eq!(disk.erase_block(0).unwrap_err().cause, Cause::ReadOnly);
    }

    #[test]
    fn out_of_range_is_reported() {
        let mut disk = RamDisk::new(512, 4);
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_block(4, &mut buf).unwrap_err().cause, Cause::Range);
    }
}
