//! Userland-visible ABI: syscall numbers, signal numbers, wait status
//! encoding.
//!
//! Everything in this module is wire format; the values are stable.

/// System call numbers (`a7` at the ecall site).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
#[allow(missing_docs, reason = "names mirror the ABI table")]
pub enum Syscall {
    ThreadYield = 0x0100,
    ThreadCreate = 0x0101,
    ThreadSuspend = 0x0102,
    ThreadResume = 0x0103,
    ThreadDetach = 0x0104,
    ThreadExit = 0x0106,

    SelfExit = 0x0200,
    SelfSigret = 0x0201,
    SelfSetSighandler = 0x0202,
    SelfWaitpid = 0x0203,

    FsOpen = 0x0300,
    FsClose = 0x0301,
    FsRead = 0x0302,
    FsWrite = 0x0303,
    FsGetdents = 0x0304,

    ProcCreate = 0x0400,
    ProcStart = 0x0401,
    ProcSendSignal = 0x0402,

    TempWrite = 0xff00,
    Shutdown = 0xff01,
}

impl Syscall {
    /// Decodes a raw syscall number.
    #[must_use]
    pub fn from_raw(nr: usize) -> Option<Self> {
        Some(match nr {
            0x0100 => Self::ThreadYield,
            0x0101 => Self::ThreadCreate,
            0x0102 => Self::ThreadSuspend,
            0x0103 => Self::ThreadResume,
            0x0104 => Self::ThreadDetach,
            0x0106 => Self::ThreadExit,
            0x0200 => Self::SelfExit,
            0x0201 => Self::SelfSigret,
            0x0202 => Self::SelfSetSighandler,
            0x0203 => Self::SelfWaitpid,
            0x0300 => Self::FsOpen,
            0x0301 => Self::FsClose,
            0x0302 => Self::FsRead,
            0x0303 => Self::FsWrite,
            0x0304 => Self::FsGetdents,
            0x0400 => Self::ProcCreate,
            0x0401 => Self::ProcStart,
            0x0402 => Self::ProcSendSignal,
            0xff00 => Self::TempWrite,
            0xff01 => Self::Shutdown,
            _ => return None,
        })
    }
}

// ── Signals ─────────────────────────────────────────────────────────

/// Number of signal slots (signals 1..=31; slot 0 stores the userland
/// trampoline address).
pub const SIG_COUNT: usize = 32;

#[allow(missing_docs, reason = "standard POSIX assignment")]
pub mod sig {
    pub const SIGHUP: u8 = 1;
    pub const SIGINT: u8 = 2;
    pub const SIGQUIT: u8 = 3;
    pub const SIGILL: u8 = 4;
    pub const SIGTRAP: u8 = 5;
    pub const SIGABRT: u8 = 6;
    pub const SIGBUS: u8 = 7;
    pub const SIGFPE: u8 = 8;
    pub const SIGKILL: u8 = 9;
    pub const SIGUSR1: u8 = 10;
    pub const SIGSEGV: u8 = 11;
    pub const SIGUSR2: u8 = 12;
    pub const SIGPIPE: u8 = 13;
    pub const SIGALRM: u8 = 14;
    pub const SIGTERM: u8 = 15;
    pub const SIGSTKFLT: u8 = 16;
    pub const SIGCHLD: u8 = 17;
    pub const SIGCONT: u8 = 18;
    pub const SIGSTOP: u8 = 19;
    pub const SIGTSTP: u8 = 20;
    pub const SIGTTIN: u8 = 21;
    pub const SIGTTOU: u8 = 22;
    pub const SIGURG: u8 = 23;
    pub const SIGXCPU: u8 = 24;
    pub const SIGXFSZ: u8 = 25;
    pub const SIGVTALRM: u8 = 26;
    pub const SIGPROF: u8 = 27;
    pub const SIGWINCH: u8 = 28;
    pub const SIGIO: u8 = 29;
    pub const SIGPWR: u8 = 30;
    pub const SIGSYS: u8 = 31;
}

/// Human-readable signal names, indexed by signal number.
pub const SIG_NAMES: [&str; SIG_COUNT] = [
    "SIG0", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE",
    "SIGKILL", "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT",
    "SIGCHLD", "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU",
    "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS",
];

/// Signals whose default disposition terminates the process. The
/// default-ignore set (`SIGCHLD`, `SIGCONT`, `SIGURG`, `SIGWINCH`) and the
/// stop signals are excluded; stop/continue semantics are not implemented.
pub const SIG_DFL_KILL_MASK: u32 = {
    let ignore = (1 << sig::SIGCHLD)
        | (1 << sig::SIGCONT)
        | (1 << sig::SIGURG)
        | (1 << sig::SIGWINCH)
        | (1 << sig::SIGSTOP)
        | (1 << sig::SIGTSTP)
        | (1 << sig::SIGTTIN)
        | (1 << sig::SIGTTOU);
    !ignore & !1u32
};

/// Whether default disposition for `signum` kills the process.
#[must_use]
pub fn sig_default_kills(signum: u8) -> bool {
    (signum as usize) < SIG_COUNT && SIG_DFL_KILL_MASK >> signum & 1 != 0
}

// ── Wait status ─────────────────────────────────────────────────────

/// Don't block in `waitpid`.
pub const WNOHANG: u32 = 0x1;

/// Builds the status for a normal exit.
#[must_use]
pub const fn w_exited(code: i32) -> i32 {
    code << 8
}

/// Builds the status for a signal death.
#[must_use]
pub const fn w_signalled(signum: u8) -> i32 {
    signum as i32 | 0x40
}

/// Whether the status is a normal exit.
#[must_use]
pub const fn wifexited(status: i32) -> bool {
    status & 0xff == 0
}

/// Whether the status is a signal death.
#[must_use]
pub const fn wifsignaled(status: i32) -> bool {
    status & 0x40 != 0
}

/// Exit code of a normal exit.
#[must_use]
pub const fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// Terminating signal. Alias of [`wexitstatus`] in this ABI.
#[must_use]
pub const fn wtermsig(status: i32) -> i32 {
    wexitstatus(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_roundtrip() {
        for nr in [0x0100, 0x0106, 0x0200, 0x0300, 0x0304, 0xff00, 0xff01] {
            let call = Syscall::from_raw(nr).unwrap();
            assert_eq!(call as usize, nr);
        }
        assert!(Syscall::from_raw(0x9999).is_none());
        assert!(Syscall::from_raw(0x0105).is_none());
    }

    #[test]
    fn wait_status_encoding() {
        let s = w_exited(42);
        assert!(wifexited(s));
        assert!(!wifsignaled(s));
        assert_eq!(wexitstatus(s), 42);

        let s = w_signalled(sig::SIGSYS);
        assert!(wifsignaled(s));
        assert!(!wifexited(s));
    }

    #[test]
    fn default_kill_set() {
        assert!(sig_default_kills(sig::SIGSEGV));
        assert!(sig_default_kills(sig::SIGTERM));
        assert!(sig_default_kills(sig::SIGSYS));
        assert!(!sig_default_kills(sig::SIGCHLD));
        assert!(!sig_default_kills(sig::SIGWINCH));
        assert!(!sig_default_kills(0));
    }

    #[test]
    fn signal_names_align() {
        assert_eq!(SIG_NAMES[sig::SIGSEGV as usize], "SIGSEGV");
        assert_eq!(SIG_NAMES[sig::SIGSYS as usize], "SIGSYS");
    }
}
