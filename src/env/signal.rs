//! Process signal policy
//!
//! A peer that drops its connection mid-write raises SIGPIPE on the writer.
//! The harness wants that surfaced as an `EPIPE` I/O error instead of process
//! termination.

use std::io;

/// Ignore SIGPIPE for the whole process
pub fn ignore_broken_pipe() -> io::Result<()> {
    // SAFETY: installing SIG_IGN has no handler code to run and is async-signal-safe.
    let prev = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if prev == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
