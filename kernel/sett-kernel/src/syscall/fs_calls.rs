//! Filesystem syscalls.

use alloc::vec;

use sett_core::id::Fd;
use sett_core::{Cause, Error, Location, Result};
use sett_fs::OpenFlags;

use super::{ret, ret_bool};
use crate::proc::{self, usercopy};

const PATH_MAX: usize = 512;
/// Per-call transfer cap; larger requests are split by userland.
const IO_MAX: usize = 64 * 1024;

fn current_proc() -> Result<alloc::sync::Arc<proc::Process>> {
    proc::current().ok_or(Error::new(Location::Process, Cause::State))
}

fn param() -> Error {
    Error::new(Location::Fs, Cause::Param)
}

/// `FS_OPEN(path, relative_to, oflags)`: open a file or directory,
/// returning a process-local fd.
///
/// Opening relative to a directory fd is reserved ABI surface; only
/// absolute paths are accepted.
pub fn sys_open(path_ptr: usize, relative_to: usize, oflags: usize) -> i64 {
    ret(current_proc().and_then(|process| {
        if relative_to as isize != -1 {
            return Err(Error::new(Location::Fs, Cause::Unsupported));
        }
        let path =
            usercopy::str_from_user(&process, path_ptr, PATH_MAX).ok_or_else(param)?;
        let flags = OpenFlags::from_bits(oflags as u32).ok_or_else(param)?;

        let handle = crate::fs::open(&path, flags)?;
        match process.add_fd(handle, flags.contains(OpenFlags::CLOEXEC)) {
            Ok(fd) => Ok(i64::from(fd.as_u32())),
            Err(e) => {
                let _ = crate::fs::close(handle);
                Err(e)
            }
        }
    }))
}

/// `FS_CLOSE(fd)`.
pub fn sys_close(fd: usize) -> i64 {
    ret_bool(current_proc().and_then(|process| {
        let handle = process.remove_fd(Fd::new(fd as u32))?;
        crate::fs::close(handle)
    }))
}

/// `FS_READ(fd, buf, len)`: returns bytes read, -1 at end-of-file, and
/// errors shifted past the EOF sentinel (≤ -2).
pub fn sys_read(fd: usize, buf_ptr: usize, len: usize) -> i64 {
    let result = current_proc().and_then(|process| {
        let len = len.min(IO_MAX);
        let handle = process.find_fd(Fd::new(fd as u32))?;
        let mut kbuf = vec![0u8; len];
        let n = crate::fs::read(handle, &mut kbuf)?;
        if n > 0 && !usercopy::copy_to_user(&process, buf_ptr, &kbuf[..n]) {
            return Err(param());
        }
        Ok((n, len))
    });
    match result {
        Ok((0, len)) if len > 0 => -1,
        Ok((n, _)) => n as i64,
        // -1 means EOF; shift real errors below it.
        Err(e) => e.as_syscall_ret() as i64 - 1,
    }
}

/// `FS_WRITE(fd, buf, len)`: returns bytes written.
pub fn sys_write(fd: usize, buf_ptr: usize, len: usize) -> i64 {
    ret(current_proc().and_then(|process| {
        let len = len.min(IO_MAX);
        let handle = process.find_fd(Fd::new(fd as u32))?;
        let mut kbuf = vec![0u8; len];
        if !usercopy::copy_from_user(&process, &mut kbuf, buf_ptr) {
            return Err(param());
        }
        let n = crate::fs::write(handle, &kbuf)?;
        Ok(n as i64)
    }))
}

/// `FS_GETDENTS(fd, buf, len)`: packed directory entries; returns bytes
/// produced, 0 at end of directory.
pub fn sys_getdents(fd: usize, buf_ptr: usize, len: usize) -> i64 {
    ret(current_proc().and_then(|process| {
        let len = len.min(IO_MAX);
        let handle = process.find_fd(Fd::new(fd as u32))?;
        let mut kbuf = vec![0u8; len];
        let n = crate::fs::getdents(handle, &mut kbuf)?;
        if n > 0 && !usercopy::copy_to_user(&process, buf_ptr, &kbuf[..n]) {
            return Err(param());
        }
        Ok(n as i64)
    }))
}

/// `TEMP_WRITE(buf, len)`: write user bytes to the kernel log.
pub fn sys_temp_write(buf_ptr: usize, len: usize) -> i64 {
    ret(current_proc().and_then(|process| {
        let len = len.min(IO_MAX);
        let mut kbuf = vec![0u8; len];
        if !usercopy::copy_from_user(&process, &mut kbuf, buf_ptr) {
            return Err(param());
        }
        sett_core::kprint!("{}", alloc::string::String::from_utf8_lossy(&kbuf));
        Ok(0)
    }))
}
