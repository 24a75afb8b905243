//! Read-through, write-back block cache.
//!
//! A fixed array of entries guards one block buffer each. Entry flags
//! maintain three invariants: `erase` implies `present`, `dirty` implies
//! `present`, and `dirty` and `erase` are never both set. Reads of a present
//! entry bypass hardware (an erased entry reads back all-ones); writes and
//! erases land in the cache and reach the device on flush, eviction, or
//! when [`CachedDevice::housekeeping`] finds them older than the write
//! timeout.

use alloc::vec;
use alloc::vec::Vec;

use sett_core::clock::{self, Timestamp};
use sett_core::{Cause, Error, Location, Result};

use crate::BlockDevice;
use crate::ram::ERASED_BYTE;

/// Age after which a clean read cache entry may be evicted.
pub const READ_CACHE_TIMEOUT_US: Timestamp = 1_000_000;

/// Age after which housekeeping flushes a dirty entry.
pub const WRITE_CACHE_TIMEOUT_US: Timestamp = 5_000_000;

bitflags::bitflags! {
    /// Cache entry state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct EntryFlags: u8 {
        /// The buffer holds valid data for `index`.
        const PRESENT = 1 << 0;
        /// The buffer is newer than the device.
        const DIRTY = 1 << 1;
        /// The block is logically erased; the buffer content is ignored.
        const ERASE = 1 << 2;
    }
}

#[derive(Default, Clone, Copy)]
struct Entry {
    index: u64,
    stamp: Timestamp,
    flags: EntryFlags,
}

impl Entry {
    fn present(&self) -> bool {
        self.flags.contains(EntryFlags::PRESENT)
    }

    /// Whether the entry holds state the device has not seen yet.
    fn needs_writeback(&self) -> bool {
        self.present()
            && self
                .flags
                .intersects(EntryFlags::DIRTY | EntryFlags::ERASE)
    }
}

/// Where a cache lookup landed.
enum Slot {
    /// Entry `i` already holds the block.
    Hit(usize),
    /// Entry `i` is free (or evictable-clean) and may be claimed.
    Vacant(usize),
    /// No entry available; fall back to uncached I/O.
    Uncached,
}

/// A [`BlockDevice`] wrapped with the write-back cache.
pub struct CachedDevice<D: BlockDevice> {
    dev: D,
    entries: Vec<Entry>,
    buffers: Vec<u8>,
    block_size: usize,
    /// Whether read misses populate the cache.
    cache_read: bool,
}

impl<D: BlockDevice> CachedDevice<D> {
    /// Opens `dev` and attaches a cache of `depth` entries.
    pub fn open(mut dev: D, depth: usize, cache_read: bool) -> Result<Self> {
        if depth == 0 {
            return Err(Error::new(Location::BlkDev, Cause::Param));
        }
        dev.open()?;
        let block_size = dev.block_size();
        Ok(Self {
            dev,
            entries: vec![Entry::default(); depth],
            buffers: vec![0; block_size * depth],
            block_size,
            cache_read,
        })
    }

    /// Flushes everything and closes the device.
    pub fn close(mut self) -> Result<D> {
        self.flush()?;
        self.dev.close()?;
        Ok(self.dev)
    }

    /// The wrapped device. Tests use this to observe raw traffic.
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Device block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn buffer(&mut self, i: usize) -> &mut [u8] {
        let start = i * self.block_size;
        &mut self.buffers[start..start + self.block_size]
    }

    fn check_block(&self, block: u64) -> Result<()> {
        if block < self.dev.block_count() {
            Ok(())
        } else {
            Err(Error::new(Location::BlkDev, Cause::Range))
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.dev.is_readonly() {
            Err(Error::new(Location::BlkDev, Cause::ReadOnly))
        } else {
            Ok(())
        }
    }

    /// Finds the entry holding `block`, if any.
    fn find(&self, block: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.present() && e.index == block)
    }

    /// Finds a slot for `block`: the entry already holding it, a vacant
    /// entry, or the oldest sufficiently stale clean entry.
    fn lookup(&self, block: u64) -> Slot {
        let mut vacant = None;
        let mut oldest_clean: Option<(usize, Timestamp)> = None;
        let stale_before = clock::now_us() - READ_CACHE_TIMEOUT_US;

        for (i, e) in self.entries.iter().enumerate() {
            if !e.present() {
                vacant.get_or_insert(i);
                continue;
            }
            // The hit must win over any vacant slot seen earlier, or the
            // block would end up cached twice.
            if e.index == block {
                return Slot::Hit(i);
            }
            if !e.needs_writeback()
                && e.stamp < stale_before
                && oldest_clean.is_none_or(|(_, s)| e.stamp < s)
            {
                oldest_clean = Some((i, e.stamp));
            }
        }
        vacant
            .or(oldest_clean.map(|(i, _)| i))
            .map_or(Slot::Uncached, Slot::Vacant)
    }

    /// Writes entry `i` back to the device, clearing its dirty state.
    ///
    /// Dirty flags are cleared before the device call so a failed transfer
    /// is not retried with stale flags.
    fn flush_entry(&mut self, i: usize) -> Result<()> {
        let entry = self.entries[i];
        let dirty = entry.flags.contains(EntryFlags::DIRTY);
        let erase = entry.flags.contains(EntryFlags::ERASE);
        self.entries[i]
            .flags
            .remove(EntryFlags::DIRTY | EntryFlags::ERASE);

        if dirty {
            // Keep the data as a read entry only when read caching is on.
            if self.cache_read {
                self.entries[i].stamp = clock::now_us();
            } else {
                self.entries[i].flags.remove(EntryFlags::PRESENT);
            }
            let start = i * self.block_size;
            let mut scratch = vec![0u8; self.block_size];
            scratch.copy_from_slice(&self.buffers[start..start + self.block_size]);
            self.dev.write_block(entry.index, &scratch)?;
        } else if erase {
            self.entries[i].flags.remove(EntryFlags::PRESENT);
            self.dev.erase_block(entry.index)?;
        }
        Ok(())
    }

    /// Reads a whole block, serving from cache when possible.
    pub fn read(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        self.check_block(block)?;
        match self.lookup(block) {
            Slot::Hit(i) => {
                if self.entries[i].flags.contains(EntryFlags::ERASE) {
                    buf[..self.block_size].fill(ERASED_BYTE);
                } else {
                    if !self.entries[i].flags.contains(EntryFlags::DIRTY) {
                        self.entries[i].stamp = clock::now_us();
                    }
                    let start = i * self.block_size;
                    buf[..self.block_size]
                        .copy_from_slice(&self.buffers[start..start + self.block_size]);
                }
                Ok(())
            }
            Slot::Vacant(i) if self.cache_read => {
                let mut scratch = vec![0u8; self.block_size];
                self.dev.read_block(block, &mut scratch)?;
                self.buffer(i).copy_from_slice(&scratch);
                self.entries[i] = Entry {
                    index: block,
                    stamp: clock::now_us(),
                    flags: EntryFlags::PRESENT,
                };
                buf[..self.block_size].copy_from_slice(&scratch);
                Ok(())
            }
            _ => self.dev.read_block(block, buf),
        }
    }

    /// Writes a whole block into the cache (write-back).
    pub fn write(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        self.check_block(block)?;
        self.check_writable()?;
        match self.lookup(block) {
            Slot::Hit(i) | Slot::Vacant(i) => {
                let block_size = self.block_size;
                self.buffer(i).copy_from_slice(&buf[..block_size]);
                self.entries[i] = Entry {
                    index: block,
                    stamp: clock::now_us(),
                    flags: EntryFlags::PRESENT | EntryFlags::DIRTY,
                };
                Ok(())
            }
            Slot::Uncached => self.dev.write_block(block, buf),
        }
    }

    /// Marks a block erased, deferring the device erase.
    pub fn erase(&mut self, block: u64) -> Result<()> {
        self.check_block(block)?;
        self.check_writable()?;
        match self.lookup(block) {
            Slot::Hit(i) | Slot::Vacant(i) => {
                self.entries[i] = Entry {
                    index: block,
                    stamp: clock::now_us(),
                    flags: EntryFlags::PRESENT | EntryFlags::ERASE,
                };
                Ok(())
            }
            Slot::Uncached => self.dev.erase_block(block),
        }
    }

    /// Whether a block is erased, consulting the cache first.
    pub fn is_erased(&mut self, block: u64) -> Result<bool> {
        self.check_block(block)?;
        if let Some(i) = self.find(block) {
            return Ok(self.entries[i].flags.contains(EntryFlags::ERASE));
        }
        self.dev.is_erased(block)
    }

    /// Reads part of a block, integrating with the cache.
    pub fn read_partial(&mut self, block: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_block(block)?;
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        match self.lookup(block) {
            Slot::Hit(i) => {
                if self.entries[i].flags.contains(EntryFlags::ERASE) {
                    buf.fill(ERASED_BYTE);
                } else {
                    if !self.entries[i].flags.contains(EntryFlags::DIRTY) {
                        self.entries[i].stamp = clock::now_us();
                    }
                    let start = i * self.block_size + offset;
                    buf.copy_from_slice(&self.buffers[start..start + buf.len()]);
                }
                Ok(())
            }
            Slot::Vacant(i) => {
                // Populate the entry with the whole block regardless of the
                // read-cache setting; we had to fetch it anyway.
                let mut scratch = vec![0u8; self.block_size];
                self.dev.read_block(block, &mut scratch)?;
                self.buffer(i).copy_from_slice(&scratch);
                self.entries[i] = Entry {
                    index: block,
                    stamp: clock::now_us(),
                    flags: EntryFlags::PRESENT,
                };
                buf.copy_from_slice(&scratch[offset..offset + buf.len()]);
                Ok(())
            }
            Slot::Uncached => {
                if self.dev.supports_partial() {
                    self.dev.read_partial(block, offset, buf)
                } else {
                    let mut scratch = vec![0u8; self.block_size];
                    self.dev.read_block(block, &mut scratch)?;
                    buf.copy_from_slice(&scratch[offset..offset + buf.len()]);
                    Ok(())
                }
            }
        }
    }

    /// Writes part of a block; read-modify-write when the block is not
    /// already cached.
    pub fn write_partial(&mut self, block: u64, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_block(block)?;
        self.check_writable()?;
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        match self.lookup(block) {
            Slot::Hit(i) => {
                if self.entries[i].flags.contains(EntryFlags::ERASE) {
                    // Materialize the erase pattern before patching it.
                    self.buffer(i).fill(ERASED_BYTE);
                }
                let start = i * self.block_size + offset;
                self.buffers[start..start + buf.len()].copy_from_slice(buf);
                self.entries[i] = Entry {
                    index: block,
                    stamp: clock::now_us(),
                    flags: EntryFlags::PRESENT | EntryFlags::DIRTY,
                };
                Ok(())
            }
            Slot::Vacant(i) => {
                let mut scratch = vec![0u8; self.block_size];
                self.dev.read_block(block, &mut scratch)?;
                scratch[offset..offset + buf.len()].copy_from_slice(buf);
                self.buffer(i).copy_from_slice(&scratch);
                self.entries[i] = Entry {
                    index: block,
                    stamp: clock::now_us(),
                    flags: EntryFlags::PRESENT | EntryFlags::DIRTY,
                };
                Ok(())
            }
            Slot::Uncached => {
                if self.dev.supports_partial() {
                    self.dev.write_partial(block, offset, buf)
                } else {
                    let mut scratch = vec![0u8; self.block_size];
                    self.dev.read_block(block, &mut scratch)?;
                    scratch[offset..offset + buf.len()].copy_from_slice(buf);
                    self.dev.write_block(block, &scratch)
                }
            }
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset >= self.block_size || len > self.block_size || offset + len > self.block_size {
            return Err(Error::new(Location::BlkDev, Cause::Range));
        }
        Ok(())
    }

    /// Writes every dirty or erase entry back to the device.
    pub fn flush(&mut self) -> Result<()> {
        for i in 0..self.entries.len() {
            if self.entries[i].needs_writeback() {
                self.flush_entry(i)?;
            }
        }
        Ok(())
    }

    /// Periodic maintenance: flushes dirty entries older than
    /// [`WRITE_CACHE_TIMEOUT_US`].
    pub fn housekeeping(&mut self) -> Result<()> {
        let flush_before = clock::now_us() - WRITE_CACHE_TIMEOUT_US;
        for i in 0..self.entries.len() {
            if self.entries[i].needs_writeback() && self.entries[i].stamp < flush_before {
                self.flush_entry(i)?;
            }
        }
        Ok(())
    }

    /// Number of present entries. Diagnostic.
    #[must_use]
    pub fn cached_blocks(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::RamDisk;
    use sett_core::clock::set_clock;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    // The clock hook is process-global, so time-manipulating tests
    // serialize on this lock.
    static TIME_LOCK: Mutex<()> = Mutex::new(());
    static MOCK_NOW: AtomicI64 = AtomicI64::new(0);

    fn mock_clock() -> Timestamp {
        MOCK_NOW.load(Ordering::SeqCst)
    }

    fn at(us: Timestamp) {
        MOCK_NOW.store(us, Ordering::SeqCst);
    }

    fn advance(us: Timestamp) {
        MOCK_NOW.fetch_add(us, Ordering::SeqCst);
    }

    fn cached_ram(blocks: usize, depth: usize) -> CachedDevice<RamDisk> {
        set_clock(mock_clock);
        CachedDevice::open(RamDisk::new(512, blocks), depth, true).unwrap()
    }

    #[test]
    fn write_back_defers_and_coalesces() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(10_000_000);
        let mut dev = cached_ram(16, 8);

        // Write pattern A, then B before the write timeout expires.
        dev.write(7, &[0xaa; 512]).unwrap();
        advance(1_000);
        dev.write(7, &[0xbb; 512]).unwrap();

        // Read returns B, raw device untouched.
        let mut buf = [0u8; 512];
        dev.read(7, &mut buf).unwrap();
        assert_eq!(buf, [0xbb; 512]);
        assert_eq!(dev.device().write_count(), 0);

        // After the timeout one raw write lands and reflects B.
        advance(WRITE_CACHE_TIMEOUT_US + 1);
        dev.housekeeping().unwrap();
        assert_eq!(dev.device().write_count(), 1);
        let mut raw = CachedDevice::open(dev.close().unwrap(), 1, false).unwrap();
        let mut buf = [0u8; 512];
        raw.read(7, &mut buf).unwrap();
        assert_eq!(buf, [0xbb; 512]);
    }

    #[test]
    fn read_miss_populates_cache() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(20_000_000);
        let mut disk = RamDisk::new(512, 8);
        disk.write_block(3, &[0x11; 512]).unwrap();
        let mut dev = CachedDevice::open(disk, 4, true).unwrap();

        let mut buf = [0u8; 512];
        dev.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0x11; 512]);
        assert_eq!(dev.cached_blocks(), 1);

        // Poison the raw device; the cached copy must win.
        dev.write(3, &[0x22; 512]).unwrap();
        dev.read(3, &mut buf).unwrap();
        assert_eq!(buf, [0x22; 512]);
    }

    #[test]
    fn erased_entries_read_all_ones() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(30_000_000);
        let mut dev = cached_ram(8, 4);
        dev.write(2, &[0x33; 512]).unwrap();
        dev.erase(2).unwrap();
        assert!(dev.is_erased(2).unwrap());

        let mut buf = [0u8; 512];
        dev.read(2, &mut buf).unwrap();
        assert_eq!(buf, [ERASED_BYTE; 512]);
        // Erase is still pending, not on the device.
        assert_eq!(dev.device().erase_count(), 0);

        dev.flush().unwrap();
        assert_eq!(dev.device().erase_count(), 1);
    }

    #[test]
    fn flush_then_entry_serves_reads_when_read_cached() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(40_000_000);
        let mut dev = cached_ram(8, 4);
        dev.write(1, &[0x44; 512]).unwrap();
        dev.flush().unwrap();
        assert_eq!(dev.device().write_count(), 1);

        // Still present as a clean read entry; no second device read.
        let mut buf = [0u8; 512];
        dev.read(1, &mut buf).unwrap();
        assert_eq!(buf, [0x44; 512]);
        assert_eq!(dev.cached_blocks(), 1);
    }

    #[test]
    fn eviction_prefers_vacant_then_stale_clean() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(50_000_000);
        let mut dev = cached_ram(16, 2);

        let mut buf = [0u8; 512];
        dev.read(0, &mut buf).unwrap();
        dev.read(1, &mut buf).unwrap();
        assert_eq!(dev.cached_blocks(), 2);

        // Both entries fresh: a third read must not evict either.
        dev.read(2, &mut buf).unwrap();
        assert!(dev.find(2).is_none());

        // Age them past the read timeout; now block 2 may take a slot.
        advance(READ_CACHE_TIMEOUT_US + 1);
        dev.read(2, &mut buf).unwrap();
        assert!(dev.find(2).is_some());
    }

    #[test]
    fn dirty_entries_are_never_evicted_by_reads() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(60_000_000);
        let mut dev = cached_ram(16, 1);
        dev.write(5, &[0x55; 512]).unwrap();

        advance(READ_CACHE_TIMEOUT_US * 3);
        let mut buf = [0u8; 512];
        dev.read(9, &mut buf).unwrap();

        // The dirty block survived and still reads back from cache.
        dev.read(5, &mut buf).unwrap();
        assert_eq!(buf, [0x55; 512]);
        assert_eq!(dev.device().write_count(), 0);
    }

    #[test]
    fn partial_write_read_roundtrip_through_cache() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(70_000_000);
        let mut dev = cached_ram(8, 4);
        dev.write(4, &[0x00; 512]).unwrap();
        dev.write_partial(4, 10, b"badger").unwrap();

        let mut out = [0u8; 6];
        dev.read_partial(4, 10, &mut out).unwrap();
        assert_eq!(&out, b"badger");

        // Whole-block read sees the patch too.
        let mut buf = [0u8; 512];
        dev.read(4, &mut buf).unwrap();
        assert_eq!(&buf[10..16], b"badger");
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn partial_write_on_erased_entry_patches_erase_pattern() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(80_000_000);
        let mut dev = cached_ram(8, 4);
        dev.erase(3).unwrap();
        dev.write_partial(3, 0, b"xy").unwrap();

        let mut buf = [0u8; 512];
        dev.read(3, &mut buf).unwrap();
        assert_eq!(&buf[..2], b"xy");
        assert!(buf[2..].iter().all(|&b| b == ERASED_BYTE));
        assert!(!dev.is_erased(3).unwrap());
    }

    #[test]
    fn partial_range_checks() {
        let _guard = TIME_LOCK.lock().unwrap();
        at(90_000_000);
        let mut dev = cached_ram(8, 4);
        let mut buf = [0u8; 16];
        assert_eq!(
            dev.read_partial(0, 510, &mut buf).unwrap_err().cause,
            Cause::Range
        );
        assert_eq!(
            dev.write_partial(0, 512, &[1]).unwrap_err().cause,
            Cause::Range
        );
    }
}
