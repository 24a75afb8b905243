//! Process management.
//!
//! A process is a container of threads sharing one memory map and
//! protection context. The global table holds `Arc<Process>` records sorted
//! by PID under a shared mutex; each process carries its own shared mutex
//! for structural state (argv, fd table, thread list, memory map, signal
//! queue) plus an atomic flag word for the lifecycle bits the scheduler
//! polls on every switch.
//!
//! Termination is two-phase: any thread may set `EXITING` (phase 1, the
//! scheduler then refuses user-mode re-entry for the whole process), and
//! the housekeeper later reclaims threads, memory, and descriptors
//! (phase 2), leaving either nothing (parent ignores `SIGCHLD`) or a zombie
//! record for `waitpid`.

pub mod loader;
pub mod signal;
pub mod usercopy;

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use sett_core::clock::TIMESTAMP_MAX;
use sett_core::id::{Fd, IdAlloc, Pid, Tid};
use sett_core::sync::{MutexCell, SpinLock, WaitMode};
use sett_core::{Cause, Error, Location, Result, kinfo, kwarn};
use sett_fs::HandleNo;
use sett_mm::kalloc;
use sett_mm::memmap::{Access, MemMap, Region};

use crate::abi::{SIG_COUNT, sig};
use crate::memprotect::MemProtectCtx;
use crate::sched;

bitflags::bitflags! {
    /// Process lifecycle flags, mutated atomically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcFlags: u32 {
        /// Created but not yet started.
        const PRESTART = 1 << 0;
        /// Has running threads.
        const RUNNING = 1 << 1;
        /// Phase-1 exit: the scheduler parks its threads.
        const EXITING = 1 << 2;
        /// Phase-2 done: only the zombie record remains.
        const EXITED = 1 << 3;
        /// At least one signal is queued.
        const SIGPEND = 1 << 4;
        /// Exit status not yet collected by the parent.
        const STATECHG = 1 << 5;
    }
}

/// Disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigDisposition {
    /// Default action (terminate or discard, by signal).
    #[default]
    Default,
    /// Discard.
    Ignore,
    /// Jump to a user handler at this address.
    Handler(usize),
}

/// One entry in the virtual fd table.
#[derive(Debug, Clone, Copy)]
pub struct FdEntry {
    /// Process-visible descriptor number.
    pub virt: Fd,
    /// Backing VFS handle.
    pub real: HandleNo,
    /// Close across exec.
    pub cloexec: bool,
}

/// Packed argv storage: all argument strings in one kernel buffer.
#[derive(Debug, Default)]
pub struct ArgvBuffer {
    bytes: Vec<u8>,
    /// (offset, len) of each argument in `bytes`.
    index: Vec<(usize, usize)>,
}

impl ArgvBuffer {
    /// Packs `args` into one buffer.
    #[must_use]
    pub fn new(args: &[&str]) -> Self {
        let mut bytes = Vec::with_capacity(args.iter().map(|a| a.len() + 1).sum());
        let mut index = Vec::with_capacity(args.len());
        for arg in args {
            index.push((bytes.len(), arg.len()));
            bytes.extend_from_slice(arg.as_bytes());
            bytes.push(0);
        }
        Self { bytes, index }
    }

    /// Number of arguments.
    #[must_use]
    pub fn argc(&self) -> usize {
        self.index.len()
    }

    /// Argument `i`, without the NUL.
    #[must_use]
    pub fn arg(&self, i: usize) -> Option<&str> {
        let &(off, len) = self.index.get(i)?;
        core::str::from_utf8(&self.bytes[off..off + len]).ok()
    }

    /// Total packed size in bytes.
    #[must_use]
    pub fn packed_size(&self) -> usize {
        self.bytes.len()
    }
}

/// Mutable process state, guarded by the per-process mutex.
pub struct ProcInner {
    /// Packed argument strings.
    pub argv: ArgvBuffer,
    /// Virtual fd table.
    pub fds: Vec<FdEntry>,
    /// Threads belonging to this process.
    pub threads: Vec<Tid>,
    /// Mapped memory regions.
    pub memmap: MemMap,
    /// Live children.
    pub children: Vec<Pid>,
    /// FIFO of pending signal numbers.
    pub sigpending: VecDeque<u8>,
    /// Per-signal dispositions. Slot 0 is repurposed as the userland
    /// trampoline address (`Handler(addr)`).
    pub sighandlers: [SigDisposition; SIG_COUNT],
}

/// A process record.
pub struct Process {
    /// Process id.
    pub pid: Pid,
    /// Executable path.
    pub binary: String,
    flags: AtomicU32,
    state_code: AtomicI32,
    parent: SpinLock<Option<Pid>>,
    /// Protection context; boxed so its address is stable for ISR contexts.
    mem_ctx: alloc::boxed::Box<MemProtectCtx>,
    inner: MutexCell<ProcInner>,
}

static PID_ALLOC: IdAlloc = IdAlloc::starting_at(1);

/// Global process table, sorted by PID. Readers share; creation and
/// deletion exclude.
static PROC_TABLE: MutexCell<Vec<Arc<Process>>> = MutexCell::new_shared(Vec::new());

fn proc_err(cause: Cause) -> Error {
    Error::new(Location::Process, cause)
}

impl Process {
    /// Flag snapshot.
    pub fn flags(&self) -> ProcFlags {
        ProcFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Sets flags, returning the previous snapshot.
    pub fn set_flags(&self, flags: ProcFlags) -> ProcFlags {
        ProcFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clears flags, returning the previous snapshot.
    pub fn clear_flags(&self, flags: ProcFlags) -> ProcFlags {
        ProcFlags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Exit status (wait-status encoded).
    pub fn state_code(&self) -> i32 {
        self.state_code.load(Ordering::Acquire)
    }

    /// Records the exit status.
    pub fn set_state_code(&self, code: i32) {
        self.state_code.store(code, Ordering::Release);
    }

    /// Current parent PID, if any.
    pub fn parent(&self) -> Option<Pid> {
        *self.parent.lock()
    }

    /// Address of the protection context, for ISR contexts.
    pub fn mem_ctx_addr(&self) -> usize {
        core::ptr::from_ref(self.mem_ctx.as_ref()) as usize
    }

    /// The protection context.
    pub fn mem_ctx(&self) -> &MemProtectCtx {
        &self.mem_ctx
    }

    /// Runs `f` with exclusive access to the mutable state.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut ProcInner) -> R) -> Result<R> {
        self.inner.with(TIMESTAMP_MAX, WaitMode::Thread, f)
    }

    /// Runs `f` with shared access to the mutable state.
    pub fn with_inner_shared<R>(&self, f: impl FnOnce(&ProcInner) -> R) -> Result<R> {
        self.inner.with_shared(TIMESTAMP_MAX, WaitMode::Thread, f)
    }

    // ── fd table ────────────────────────────────────────────────────

    /// Maps a VFS handle into the process, returning the new virtual fd.
    pub fn add_fd(&self, real: HandleNo, cloexec: bool) -> Result<Fd> {
        self.with_inner(|inner| {
            let virt = Fd::new(
                inner
                    .fds
                    .iter()
                    .map(|e| e.virt.as_u32() + 1)
                    .max()
                    .unwrap_or(0),
            );
            inner.fds.push(FdEntry {
                virt,
                real,
                cloexec,
            });
            virt
        })
    }

    /// Resolves a virtual fd to its VFS handle.
    pub fn find_fd(&self, virt: Fd) -> Result<HandleNo> {
        self.with_inner_shared(|inner| {
            inner
                .fds
                .iter()
                .find(|e| e.virt == virt)
                .map(|e| e.real)
                .ok_or(proc_err(Cause::NotFound))
        })?
    }

    /// Removes a virtual fd, returning its VFS handle.
    pub fn remove_fd(&self, virt: Fd) -> Result<HandleNo> {
        self.with_inner(|inner| {
            let pos = inner
                .fds
                .iter()
                .position(|e| e.virt == virt)
                .ok_or(proc_err(Cause::NotFound))?;
            Ok(inner.fds.swap_remove(pos).real)
        })?
    }

    // ── Memory map ──────────────────────────────────────────────────

    /// Maps at least `min_size` bytes of user memory with the given access,
    /// returning the base address.
    ///
    /// The physical backing decides the placement; `vaddr_req` and
    /// `min_align` beyond page alignment are best-effort and currently
    /// ignored, like the reference behavior.
    pub fn map(&self, _vaddr_req: usize, min_size: usize, _min_align: usize, access: Access) -> Result<usize> {
        self.with_inner(|inner| {
            let ptr = kalloc::with_heap(|heap| {
                heap.allocate_pages(min_size, sett_mm::buddy::BlockType::User)
            })?;
            let base = ptr.as_ptr() as usize;
            let size = kalloc::with_heap(|heap| heap.block_size_of(ptr))?;

            let region = Region {
                base,
                size,
                access: access & Access::RWX,
            };
            if let Err(e) = inner.memmap.insert(region) {
                let _ = kalloc::with_heap(|heap| heap.free(ptr));
                return Err(e);
            }
            if let Err(e) = self.mem_ctx.set_region(base, size, region.access) {
                let _ = inner.memmap.remove(base);
                let _ = kalloc::with_heap(|heap| heap.free(ptr));
                return Err(e);
            }
            self.mem_ctx.commit();
            kinfo!("mapped {size} bytes at {base:#x} to process {}", self.pid);
            Ok(base)
        })?
    }

    /// Unmaps the region based at `base`, returning its pages.
    pub fn unmap(&self, base: usize) -> Result<()> {
        self.with_inner(|inner| self.unmap_locked(inner, base))?
    }

    fn unmap_locked(&self, inner: &mut ProcInner, base: usize) -> Result<()> {
        let region = inner.memmap.remove(base)?;
        let _ = self.mem_ctx.set_region(base, 0, Access::empty());
        self.mem_ctx.commit();
        // SAFETY: mapped regions are live buddy blocks.
        let ptr = unsafe { core::ptr::NonNull::new_unchecked(base as *mut u8) };
        kalloc::with_heap(|heap| heap.free(ptr))?;
        kinfo!(
            "unmapped {} bytes at {base:#x} from process {}",
            region.size,
            self.pid
        );
        Ok(())
    }

    /// Access query over the process's memory map (see
    /// [`MemMap::access`]).
    pub fn map_contains(&self, base: usize, size: usize) -> Access {
        self.with_inner_shared(|inner| inner.memmap.access(base, size))
            .unwrap_or(Access::empty())
    }
}

// ── Table operations ────────────────────────────────────────────────

fn table_insert(process: Arc<Process>) -> Result<()> {
    PROC_TABLE.with(TIMESTAMP_MAX, WaitMode::Thread, |table| {
        let pos = table.partition_point(|p| p.pid < process.pid);
        table.insert(pos, process);
    })
}

fn table_remove(pid: Pid) -> Option<Arc<Process>> {
    PROC_TABLE
        .with(TIMESTAMP_MAX, WaitMode::Thread, |table| {
            let i = table.binary_search_by_key(&pid, |p| p.pid).ok()?;
            Some(table.remove(i))
        })
        .ok()
        .flatten()
}

/// Looks a process up by PID.
#[must_use]
pub fn find(pid: Pid) -> Option<Arc<Process>> {
    PROC_TABLE
        .with_shared(TIMESTAMP_MAX, WaitMode::Thread, |table| {
            table
                .binary_search_by_key(&pid, |p| p.pid)
                .ok()
                .map(|i| table[i].clone())
        })
        .ok()
        .flatten()
}

/// Flag snapshot of a process, if it exists.
#[must_use]
pub fn flags_of(pid: Pid) -> Option<ProcFlags> {
    find(pid).map(|p| p.flags())
}

/// [`flags_of`] for ISR context: spins instead of yielding if the table is
/// briefly held exclusively by another CPU.
#[must_use]
pub fn flags_of_from_isr(pid: Pid) -> Option<ProcFlags> {
    PROC_TABLE
        .with_shared(TIMESTAMP_MAX, WaitMode::Isr, |table| {
            table
                .binary_search_by_key(&pid, |p| p.pid)
                .ok()
                .map(|i| table[i].flags())
        })
        .ok()
        .flatten()
}

/// Whether the process has queued signals. ISR-safe scheduler fast path.
#[must_use]
pub fn signals_pending(pid: Pid) -> bool {
    flags_of_from_isr(pid).is_some_and(|f| f.contains(ProcFlags::SIGPEND))
}

/// Number of live process records.
#[must_use]
pub fn count() -> usize {
    PROC_TABLE
        .with_shared(TIMESTAMP_MAX, WaitMode::Thread, Vec::len)
        .unwrap_or(0)
}

/// The process the current thread belongs to.
#[must_use]
pub fn current() -> Option<Arc<Process>> {
    sched::current_thread()?.process.and_then(find)
}

/// Whether `parent` is the parent of `child`.
#[must_use]
pub fn is_parent(parent: Pid, child: Pid) -> bool {
    find(child).is_some_and(|c| c.parent() == Some(parent))
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Creates a process in the PRESTART state.
///
/// `parent` must exist except for the first process (PID 1).
pub fn create(parent: Option<Pid>, binary: &str, args: &[&str]) -> Result<Pid> {
    let parent_proc = match parent {
        Some(pid) => Some(find(pid).ok_or(proc_err(Cause::NotFound))?),
        None => None,
    };

    let process = Arc::new(Process {
        pid: Pid::new(PID_ALLOC.next()),
        binary: binary.to_string(),
        flags: AtomicU32::new(ProcFlags::PRESTART.bits()),
        state_code: AtomicI32::new(0),
        parent: SpinLock::new(parent),
        mem_ctx: alloc::boxed::Box::new(MemProtectCtx::new()),
        inner: MutexCell::new_shared(ProcInner {
            argv: ArgvBuffer::new(args),
            fds: Vec::new(),
            threads: Vec::new(),
            memmap: MemMap::new(),
            children: Vec::new(),
            sigpending: VecDeque::new(),
            sighandlers: [SigDisposition::Default; SIG_COUNT],
        }),
    });
    let pid = process.pid;

    table_insert(process)?;
    if let Some(parent_proc) = parent_proc {
        parent_proc.with_inner(|inner| inner.children.push(pid))?;
    }
    Ok(pid)
}

/// Loads the process's binary and starts its main thread.
pub fn start(pid: Pid, loader: &dyn loader::ProgramLoader) -> Result<()> {
    let process = find(pid).ok_or(proc_err(Cause::NotFound))?;

    // Claim the one-shot start.
    if !process
        .clear_flags(ProcFlags::PRESTART)
        .contains(ProcFlags::PRESTART)
    {
        return Err(proc_err(Cause::State));
    }

    let image = crate::fs::read_file(&process.binary).inspect_err(|_| {
        kwarn!("failed to open {}", process.binary);
    })?;
    let entry = loader.load(&process, &image)?;

    let tid = sched::create_user_thread(
        None,
        pid,
        process.mem_ctx_addr(),
        entry,
        0,
        sched::policy::DEFAULT_PRIORITY,
    )?;
    process.with_inner(|inner| inner.threads.push(tid))?;

    crate::arch::fence_i();
    process.set_flags(ProcFlags::RUNNING);
    sched::resume_thread(tid)?;
    kinfo!("process {pid} started");
    Ok(())
}

/// Phase-1 exit for the current process: records the encoded status and
/// schedules phase 2. The caller must still park the current thread
/// (returning to user mode will do).
pub fn exit_self(status: i32) {
    let Some(process) = current() else {
        kwarn!("exit_self without a current process");
        return;
    };
    exit_process(&process, status);
}

/// Phase-1 exit for an arbitrary process.
pub fn exit_process(process: &Arc<Process>, status: i32) {
    process.set_state_code(status);
    if process.set_flags(ProcFlags::EXITING).contains(ProcFlags::EXITING) {
        // Already on its way down.
        return;
    }
    housekeeping_cleanup_later(process.pid);
}

fn housekeeping_cleanup_later(pid: Pid) {
    crate::housekeeping::add_once(0, cleanup_task, pid.as_u32() as usize);
}

/// Housekeeping callback driving phase-2 termination.
fn cleanup_task(_taskno: i64, cookie: usize) {
    let pid = Pid::new(cookie as u32);
    if let Err(e) = terminate_runtime(pid) {
        kwarn!("cleanup of process {pid} failed: {e}");
    }
}

/// Phase 2: reclaims every runtime resource of an EXITING process, then
/// reaps or signals the parent.
///
/// Must not run on one of the process's own threads.
pub fn terminate_runtime(pid: Pid) -> Result<()> {
    let process = find(pid).ok_or(proc_err(Cause::NotFound))?;
    if process.flags().contains(ProcFlags::EXITED) {
        return Ok(());
    }
    if pid == Pid::INIT && crate::boot::shutdown_mode() == 0 {
        panic!("process 1 exited unexpectedly");
    }

    // Wake every thread so the scheduler can observe EXITING and park it.
    let threads = process.with_inner_shared(|inner| inner.threads.clone())?;
    resume_all(&process)?;
    loop {
        let any_running = threads
            .iter()
            .any(|&tid| sched::thread_is_running(tid).unwrap_or(false));
        if !any_running {
            break;
        }
        sched::yield_now();
    }

    // Reparent surviving children to init.
    let children = process.with_inner(|inner| core::mem::take(&mut inner.children))?;
    if pid != Pid::INIT && !children.is_empty() {
        let init = find(Pid::INIT).ok_or(proc_err(Cause::NotFound))?;
        for &child in &children {
            if let Some(child_proc) = find(child) {
                *child_proc.parent.lock() = Some(Pid::INIT);
            }
        }
        init.with_inner(|inner| inner.children.extend_from_slice(&children))?;
    }

    // Tear down threads, memory, and descriptors.
    process.with_inner(|inner| -> Result<()> {
        for tid in inner.threads.drain(..) {
            sched::thread::remove(tid);
        }
        while let Some(base) = inner.memmap.first_base() {
            // Unmap failures here would leak, not corrupt; keep going.
            let _ = process.unmap_locked(inner, base);
        }
        for entry in inner.fds.drain(..) {
            let _ = crate::fs::close(entry.real);
        }
        inner.sigpending.clear();
        Ok(())
    })??;

    process.clear_flags(ProcFlags::EXITING | ProcFlags::RUNNING | ProcFlags::SIGPEND);
    process.set_flags(ProcFlags::EXITED | ProcFlags::STATECHG);
    kinfo!("process {pid} stopped with status {:#x}", process.state_code());

    // Parent notification or immediate reaping.
    let Some(parent_pid) = process.parent() else {
        delete(pid);
        return Ok(());
    };
    let Some(parent) = find(parent_pid) else {
        delete(pid);
        return Ok(());
    };
    let ignores_sigchld = parent.with_inner_shared(|inner| {
        inner.sighandlers[sig::SIGCHLD as usize] == SigDisposition::Ignore
    })?;
    if ignores_sigchld {
        delete(pid);
    } else {
        signal::raise(&parent, sig::SIGCHLD)?;
    }
    Ok(())
}

/// Deletes a process record outright, removing it from its parent's child
/// list. The runtime must already be gone (or never started).
pub fn delete(pid: Pid) {
    let Some(process) = table_remove(pid) else {
        return;
    };
    if let Some(parent) = process.parent().and_then(find) {
        let _ = parent.with_inner(|inner| inner.children.retain(|&c| c != pid));
    }
}

/// Deletes a process only if it has not been started.
pub fn delete_prestart(pid: Pid) -> bool {
    let Some(process) = find(pid) else {
        return false;
    };
    if !process.flags().contains(ProcFlags::PRESTART) {
        return false;
    }
    delete(pid);
    true
}

/// `waitpid`: collects the status of an exited child.
///
/// `which` is a specific child PID or -1 for any. Non-blocking unless the
/// caller loops. Returns the child PID and its encoded status, reaping the
/// zombie.
pub fn waitpid(parent: Pid, which: i32) -> Result<(Pid, i32)> {
    let parent_proc = find(parent).ok_or(proc_err(Cause::NotFound))?;
    let children = parent_proc.with_inner_shared(|inner| inner.children.clone())?;
    if children.is_empty() {
        return Err(proc_err(Cause::NotFound));
    }

    for &child in &children {
        if which >= 0 && child.as_u32() != which as u32 {
            continue;
        }
        let Some(child_proc) = find(child) else {
            continue;
        };
        let flags = child_proc.flags();
        if flags.contains(ProcFlags::EXITED) && flags.contains(ProcFlags::STATECHG) {
            child_proc.clear_flags(ProcFlags::STATECHG);
            let status = child_proc.state_code();
            delete(child);
            return Ok((child, status));
        }
    }
    Err(proc_err(Cause::State))
}

/// Suspends every thread of `process` except `current`.
pub fn suspend_all(process: &Arc<Process>, current: Option<Tid>) -> Result<()> {
    let threads = process.with_inner_shared(|inner| inner.threads.clone())?;
    for tid in threads {
        if Some(tid) != current {
            let _ = sched::suspend_thread(tid);
        }
    }
    Ok(())
}

/// Resumes every thread of `process`.
pub fn resume_all(process: &Arc<Process>) -> Result<()> {
    let threads = process.with_inner_shared(|inner| inner.threads.clone())?;
    for tid in threads {
        let _ = sched::resume_thread(tid);
    }
    Ok(())
}

/// Creates an additional thread in `process` at the user entry `entry`.
pub fn create_thread(process: &Arc<Process>, entry: usize, arg: usize, priority: i32) -> Result<Tid> {
    let tid = sched::create_user_thread(
        None,
        process.pid,
        process.mem_ctx_addr(),
        entry,
        arg,
        priority,
    )?;
    process.with_inner(|inner| inner.threads.push(tid))?;
    Ok(tid)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::abi;
    use sett_mm::PAGE_SIZE as PG;

    /// Process tests allocate user pages from the global heap; give it one
    /// arena the first time and serialize the tests that mutate tables.
    pub(crate) fn init_test_heap() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            let layout = std::alloc::Layout::from_size_align(256 * PG, PG).unwrap();
            // SAFETY: non-zero layout; the arena intentionally leaks.
            let arena = unsafe { std::alloc::alloc(layout) };
            assert!(!arena.is_null());
            // SAFETY: the arena is exclusively the heap's from here on.
            unsafe {
                kalloc::init_pool(arena as usize, arena as usize + 256 * PG).unwrap();
            }
        });
    }

    pub(crate) static PROC_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn pids_are_monotonic() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let a = create(None, "/sbin/one", &["one"]).unwrap();
        let b = create(Some(a), "/sbin/two", &["two"]).unwrap();
        let c = create(Some(a), "/sbin/three", &[]).unwrap();
        assert!(a < b && b < c);
        delete(c);
        delete(b);
        delete(a);
    }

    #[test]
    fn argv_packing() {
        let argv = ArgvBuffer::new(&["init", "--verbose"]);
        assert_eq!(argv.argc(), 2);
        assert_eq!(argv.arg(0), Some("init"));
        assert_eq!(argv.arg(1), Some("--verbose"));
        assert_eq!(argv.arg(2), None);
        // Strings plus their NULs, packed together.
        assert_eq!(argv.packed_size(), 5 + 10);
    }

    #[test]
    fn fd_table_allocates_above_highest() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/fds", &[]).unwrap();
        let p = find(pid).unwrap();
        let a = p.add_fd(100, false).unwrap();
        let b = p.add_fd(101, false).unwrap();
        assert_eq!(a.as_u32(), 0);
        assert_eq!(b.as_u32(), 1);
        assert_eq!(p.find_fd(a).unwrap(), 100);

        p.remove_fd(a).unwrap();
        // Highest + 1, not lowest-free: matches the reference allocator.
        let c = p.add_fd(102, false).unwrap();
        assert_eq!(c.as_u32(), 2);
        delete(pid);
    }

    #[test]
    fn map_unmap_roundtrip_with_protection() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/mem", &[]).unwrap();
        let p = find(pid).unwrap();

        let base = p.map(0, 3 * PG, PG, Access::RW).unwrap();
        assert_eq!(base % PG, 0);
        // Rounded up to the buddy block size.
        let access = p.map_contains(base, 4 * PG);
        assert_eq!(access, Access::RW | Access::FOUND);
        assert_eq!(p.mem_ctx().regions().len(), 1);

        // User pages come back zeroed.
        // SAFETY: the region is identity-backed host memory we own.
        let zeroed = unsafe { (0..PG).all(|i| *((base + i) as *const u8) == 0) };
        assert!(zeroed);

        p.unmap(base).unwrap();
        assert_eq!(p.map_contains(base, PG), Access::empty());
        assert_eq!(p.mem_ctx().regions().len(), 0);
        delete(pid);
    }

    #[test]
    fn parent_child_links_and_reparenting() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        // Build an init stand-in as PID target for reparenting. It may not
        // be PID 1 in this shared-table test run, so reparenting targets
        // are asserted via is_parent only when init really is PID 1.
        let parent = create(None, "/sbin/parent", &[]).unwrap();
        let child_a = create(Some(parent), "/a", &[]).unwrap();
        let child_b = create(Some(parent), "/b", &[]).unwrap();
        assert!(is_parent(parent, child_a));
        assert!(is_parent(parent, child_b));
        assert!(!is_parent(child_a, parent));

        delete(child_a);
        assert!(!is_parent(parent, child_a));
        delete(child_b);
        delete(parent);
    }

    #[test]
    fn prestart_delete_only_before_start() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();
        let pid = create(None, "/sbin/pre", &[]).unwrap();
        let p = find(pid).unwrap();
        p.clear_flags(ProcFlags::PRESTART);
        p.set_flags(ProcFlags::RUNNING);
        assert!(!delete_prestart(pid));
        p.clear_flags(ProcFlags::RUNNING);
        p.set_flags(ProcFlags::PRESTART);
        assert!(delete_prestart(pid));
        assert!(find(pid).is_none());
    }

    #[test]
    fn two_phase_exit_reaps_or_zombifies() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();

        let parent = create(None, "/sbin/init-like", &[]).unwrap();
        let child = create(Some(parent), "/sbin/kid", &[]).unwrap();
        let child_proc = find(child).unwrap();

        // Phase 1 marks EXITING and records the status.
        exit_process(&child_proc, abi::w_exited(42));
        assert!(child_proc.flags().contains(ProcFlags::EXITING));

        // Phase 2 (normally run by the housekeeper).
        terminate_runtime(child).unwrap();
        let flags = child_proc.flags();
        assert!(flags.contains(ProcFlags::EXITED));
        assert!(flags.contains(ProcFlags::STATECHG));
        // Parent did not ignore SIGCHLD: zombie remains, signal queued.
        let parent_proc = find(parent).unwrap();
        assert!(parent_proc.flags().contains(ProcFlags::SIGPEND));

        // waitpid collects and reaps.
        let (got, status) = waitpid(parent, -1).unwrap();
        assert_eq!(got, child);
        assert!(abi::wifexited(status));
        assert_eq!(abi::wexitstatus(status), 42);
        assert!(find(child).is_none());

        delete(parent);
    }

    #[test]
    fn sigchld_ignore_autoreaps() {
        let _guard = PROC_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        init_test_heap();

        let parent = create(None, "/sbin/ignorer", &[]).unwrap();
        let parent_proc = find(parent).unwrap();
        parent_proc
            .with_inner(|inner| {
                inner.sighandlers[sig::SIGCHLD as usize] = SigDisposition::Ignore;
            })
            .unwrap();
        let child = create(Some(parent), "/sbin/kid2", &[]).unwrap();
        let child_proc = find(child).unwrap();

        exit_process(&child_proc, abi::w_exited(0));
        terminate_runtime(child).unwrap();

        // Reaped immediately; no signal, nothing to wait for.
        assert!(find(child).is_none());
        assert!(!parent_proc.flags().contains(ProcFlags::SIGPEND));
        assert_eq!(waitpid(parent, -1).unwrap_err().cause, Cause::NotFound);
        delete(parent);
    }
}
