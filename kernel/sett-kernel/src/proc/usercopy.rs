//! Validated copies between kernel and user memory.
//!
//! Every transfer first checks the process memory map for coverage with
//! the required permissions; only then is the copy performed, with
//! interrupts disabled and the supervisor-user access window open. A failed
//! check copies nothing — the caller typically raises SIGSEGV.

use sett_mm::PAGE_SIZE;
use sett_mm::memmap::Access;

use super::Process;

/// Copies `dst.len()` bytes from user address `src` into `dst`.
///
/// Returns false (copying nothing) unless the whole source range is mapped
/// readable.
#[must_use]
pub fn copy_from_user(process: &Process, dst: &mut [u8], src: usize) -> bool {
    if dst.is_empty() {
        return true;
    }
    if !process
        .map_contains(src, dst.len())
        .contains(Access::R | Access::FOUND)
    {
        return false;
    }
    let ie = crate::arch::irq_disable();
    crate::arch::with_user_memory_access(|| {
        // SAFETY: the range was validated against the memory map, which only
        // contains live identity-backed user blocks.
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        }
    });
    crate::arch::irq_restore(ie);
    true
}

/// Copies `src` to user address `dst`.
///
/// Returns false (copying nothing) unless the whole destination range is
/// mapped writable.
#[must_use]
pub fn copy_to_user(process: &Process, dst: usize, src: &[u8]) -> bool {
    if src.is_empty() {
        return true;
    }
    if !process
        .map_contains(dst, src.len())
        .contains(Access::W | Access::FOUND)
    {
        return false;
    }
    let ie = crate::arch::irq_disable();
    crate::arch::with_user_memory_access(|| {
        // SAFETY: as in `copy_from_user`, for the destination.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        }
    });
    crate::arch::irq_restore(ie);
    true
}

/// Measures a NUL-terminated user string.
///
/// Walks page by page so access is validated before every chunk touched.
/// Returns `None` when unmapped memory is reached before a NUL; the length
/// saturates at `max`.
#[must_use]
pub fn strlen_from_user(process: &Process, src: usize, max: usize) -> Option<usize> {
    let mut len = 0;
    while len < max {
        let addr = src + len;
        let page_remaining = PAGE_SIZE - (addr % PAGE_SIZE);
        let chunk = page_remaining.min(max - len);
        if !process
            .map_contains(addr, chunk)
            .contains(Access::R | Access::FOUND)
        {
            return None;
        }
        for i in 0..chunk {
            // SAFETY: validated above; identity-backed user memory.
            let byte = crate::arch::with_user_memory_access(|| unsafe {
                core::ptr::read_volatile((addr + i) as *const u8)
            });
            if byte == 0 {
                return Some(len + i);
            }
        }
        len += chunk;
    }
    Some(max)
}

/// Reads a UTF-8 string of at most `max` bytes from user memory.
pub fn str_from_user(
    process: &Process,
    src: usize,
    max: usize,
) -> Option<alloc::string::String> {
    let len = strlen_from_user(process, src, max)?;
    let mut buf = alloc::vec![0u8; len];
    if !copy_from_user(process, &mut buf, src) {
        return None;
    }
    alloc::string::String::from_utf8(buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests::{PROC_TEST_LOCK, init_test_heap};
    use crate::proc::{create, delete, find};

    #[test]
    fn copies_respect_the_memory_map() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/copy", &[]).unwrap();
        let p = find(pid).unwrap();
        let base = p.map(0, PAGE_SIZE, PAGE_SIZE, Access::RW).unwrap();

        assert!(copy_to_user(&p, base + 16, b"over the wall"));
        let mut back = [0u8; 13];
        assert!(copy_from_user(&p, &mut back, base + 16));
        assert_eq!(&back, b"over the wall");

        // Out of the mapped range: refused, buffer untouched.
        let mut untouched = [0xaau8; 8];
        assert!(!copy_from_user(&p, &mut untouched, base + PAGE_SIZE * 8));
        assert_eq!(untouched, [0xaau8; 8]);
        assert!(!copy_to_user(&p, base + PAGE_SIZE * 8, b"x"));

        p.unmap(base).unwrap();
        delete(pid);
    }

    #[test]
    fn write_denied_without_w_permission() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/ro", &[]).unwrap();
        let p = find(pid).unwrap();
        let base = p.map(0, PAGE_SIZE, PAGE_SIZE, Access::R).unwrap();

        assert!(!copy_to_user(&p, base, b"nope"));
        let mut buf = [0u8; 4];
        assert!(copy_from_user(&p, &mut buf, base));

        p.unmap(base).unwrap();
        delete(pid);
    }

    #[test]
    fn strlen_walks_and_saturates() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/str", &[]).unwrap();
        let p = find(pid).unwrap();
        let base = p.map(0, PAGE_SIZE, PAGE_SIZE, Access::RW).unwrap();

        assert!(copy_to_user(&p, base, b"badger\0"));
        assert_eq!(strlen_from_user(&p, base, 64), Some(6));
        assert_eq!(str_from_user(&p, base, 64).unwrap(), "badger");

        // No NUL within max: saturates.
        assert!(copy_to_user(&p, base + 100, &[b'x'; 16]));
        assert_eq!(strlen_from_user(&p, base + 100, 8), Some(8));

        // Unmapped: None.
        assert_eq!(strlen_from_user(&p, base + PAGE_SIZE * 9, 8), None);

        p.unmap(base).unwrap();
        delete(pid);
    }
}
