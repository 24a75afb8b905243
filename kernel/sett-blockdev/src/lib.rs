//! Block devices and the generic caching layer.
//!
//! A backend implements [`BlockDevice`] — raw whole-block read/write/erase
//! plus geometry — and [`cache::CachedDevice`] wraps it with the read-through
//! write-back cache every consumer goes through. [`ram::RamDisk`] is the
//! in-tree reference backend.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cache;
pub mod ram;

use sett_core::Result;

/// Raw block device operations.
///
/// Implementations are dumb: no caching, no read-modify-write. Partial
/// transfers are optional; devices that cannot do them report
/// `supports_partial() == false` and the caching layer synthesizes them.
pub trait BlockDevice {
    /// Block size in bytes. Constant for the device's lifetime.
    fn block_size(&self) -> usize;

    /// Number of blocks.
    fn block_count(&self) -> u64;

    /// Whether writes and erases are refused.
    fn is_readonly(&self) -> bool {
        false
    }

    /// Whether [`read_partial`](Self::read_partial) and
    /// [`write_partial`](Self::write_partial) work.
    fn supports_partial(&self) -> bool {
        false
    }

    /// Prepares the device for I/O.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases the device. The caching layer flushes before calling this.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reads one block into `buf` (`buf.len() == block_size`).
    fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes one block from `buf` (`buf.len() == block_size`).
    fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<()>;

    /// Erases a block. Devices without erase semantics succeed silently.
    fn erase_block(&mut self, _block: u64) -> Result<()> {
        Ok(())
    }

    /// Whether a block is in the erased state. Devices without erase
    /// semantics report `true`.
    fn is_erased(&mut self, _block: u64) -> Result<bool> {
        Ok(true)
    }

    /// Reads part of a block. Only called when
    /// [`supports_partial`](Self::supports_partial) is true.
    fn read_partial(&mut self, _block: u64, _offset: usize, _buf: &mut [u8]) -> Result<()> {
        Err(sett_core::Error::new(
            sett_core::Location::BlkDev,
            sett_core::Cause::Unsupported,
        ))
    }

    /// Writes part of a block. Only called when
    /// [`supports_partial`](Self::supports_partial) is true.
    fn write_partial(&mut self, _block: u64, _offset: usize, _buf: &[u8]) -> Result<()> {
        Err(sett_core::Error::new(
            sett_core::Location::BlkDev,
            sett_core::Cause::Unsupported,
        ))
    }
}
