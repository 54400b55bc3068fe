//! Self-pipe signal handling.
//!
//! Per the ambient-stack concurrency note: `SIGTERM`/`SIGHUP` are translated
//! into a scheduler-visible event without ever mutating core state from
//! signal context. The classic self-pipe trick is the idiomatic way to do
//! this without an async runtime or an extra channel crate — the signal
//! handler does one `write(2)` of the signal number into a pipe, and that
//! pipe's read end is registered with the scheduler's own fd-readiness
//! table like any other descriptor.

use anyhow::{Context, Result};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let byte = signum as u8;
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

/// Installs handlers for `SIGTERM` and `SIGHUP` and returns the read end of
/// the self-pipe. Caller registers this fd with the scheduler; each
/// readable byte is the signal number that fired.
pub fn install() -> Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to create signal self-pipe");
    }
    let [read_fd, write_fd] = fds;
    WRITE_FD.store(write_fd, Ordering::Relaxed);

    for sig in [libc::SIGTERM, libc::SIGHUP] {
        let prev = unsafe { libc::signal(sig, handle_signal as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to install handler for signal {sig}"));
        }
    }

    Ok(read_fd)
}

/// Reads and returns every signal number queued on the self-pipe since the
/// last drain. Empty once the pipe has nothing left to read.
pub fn drain(read_fd: RawFd) -> Vec<i32> {
    let mut signals = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        signals.extend(buf[..n as usize].iter().map(|&b| b as i32));
    }
    signals
}
