//! Program loading.
//!
//! The real ELF loader is an external collaborator; the kernel only
//! depends on this trait. [`FlatLoader`] handles raw position-independent
//! images and is what the boot path and the test harness use.

use alloc::sync::Arc;

use sett_core::{Cause, Error, Location, Result};
use sett_mm::memmap::Access;

use super::Process;

/// Turns a binary image into a mapped, runnable process image.
pub trait ProgramLoader: Send + Sync {
    /// Maps `image` into `process` and returns the entry address.
    fn load(&self, process: &Arc<Process>, image: &[u8]) -> Result<usize>;
}

/// Loads a flat binary: one RWX region, entry at its base.
pub struct FlatLoader;

impl ProgramLoader for FlatLoader {
    fn load(&self, process: &Arc<Process>, image: &[u8]) -> Result<usize> {
        if image.is_empty() {
            return Err(Error::new(Location::Process, Cause::Format));
        }
        let base = process.map(0, image.len(), sett_mm::PAGE_SIZE, Access::RWX)?;
        // SAFETY: the region was just allocated for this process and nothing
        // else references it yet.
        unsafe {
            core::ptr::copy_nonoverlapping(image.as_ptr(), base as *mut u8, image.len());
        }
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests::{PROC_TEST_LOCK, init_test_heap};
    use crate::proc::{create, delete, find};

    #[test]
    fn flat_loader_maps_and_copies() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/flat", &[]).unwrap();
        let process = find(pid).unwrap();

        let image = [0x13u8, 0x00, 0x00, 0x00, 0x73, 0x00, 0x00, 0x00];
        let entry = FlatLoader.load(&process, &image).unwrap();
        // SAFETY: identity-backed test memory owned by the process.
        let copied = unsafe { core::slice::from_raw_parts(entry as *const u8, image.len()) };
        assert_eq!(copied, image);
        assert!(
            process
                .map_contains(entry, image.len())
                .contains(Access::X | Access::FOUND)
        );

        process.unmap(entry).unwrap();
        delete(pid);
    }

    #[test]
    fn empty_image_is_rejected() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/empty", &[]).unwrap();
        let process = find(pid).unwrap();
        assert_eq!(
            FlatLoader.load(&process, &[]).unwrap_err().cause,
            Cause::Format
        );
        delete(pid);
    }
}
