//! Detach from the controlling terminal, in the manner of `nohup cmd &`.
//!
//! Classical double fork: fork (parent exits), setsid, fork again
//! (intermediate exits), grandchild continues with no controlling terminal
//! and its standard streams bound to /dev/null. A single fork would leave a
//! session leader that could re-acquire a terminal.

use anyhow::Result;

use crate::error::JobmanError;

/// Which side of the detach this process landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The detached grandchild; carries on as the supervisor.
    Supervisor,
    /// The original terminal-attached process, returned only when
    /// `keep_terminal` was requested (the `--follow` tail).
    Terminal,
}

/// Detach the current process.
///
/// With `keep_terminal = false` the caller never returns on the parent side:
/// the original process `_exit(0)`s once the daemon line is forked off, which
/// is what hands the prompt back to the user's shell. With `keep_terminal =
/// true` the original process returns [`Detached::Terminal`] with its stdio
/// intact so it can tail logs; the stream rebinding then happens on the child
/// side of the first fork.
pub fn nohupify(keep_terminal: bool) -> Result<Detached> {
    if !keep_terminal {
        bind_stdio_to_devnull()?;
    }

    match fork()? {
        ForkSide::Parent { child } => {
            if keep_terminal {
                // Reap the intermediate so the tail loop never leaves a zombie.
                // SAFETY: waitpid(2) on our own direct child.
                unsafe {
                    libc::waitpid(child, std::ptr::null_mut(), 0);
                }
                return Ok(Detached::Terminal);
            }
            // SAFETY: _exit(2) skips atexit handlers, so already-flushed
            // stdio is not flushed a second time.
            unsafe { libc::_exit(0) }
        }
        ForkSide::Child => {}
    }

    if keep_terminal {
        bind_stdio_to_devnull()?;
    }

    // SAFETY: setsid(2) has no memory effects; the first fork guarantees we
    // are not a process group leader, so it cannot fail with EPERM here.
    if unsafe { libc::setsid() } == -1 {
        return Err(os_error("setsid").into());
    }

    match fork()? {
        // SAFETY: see above.
        ForkSide::Parent { .. } => unsafe { libc::_exit(0) },
        ForkSide::Child => Ok(Detached::Supervisor),
    }
}

enum ForkSide {
    Parent { child: libc::pid_t },
    Child,
}

fn fork() -> Result<ForkSide> {
    // SAFETY: fork(2) in a single-threaded process; both sides only run
    // ordinary Rust afterwards.
    match unsafe { libc::fork() } {
        -1 => Err(os_error("fork").into()),
        0 => Ok(ForkSide::Child),
        child => Ok(ForkSide::Parent { child }),
    }
}

/// Rebind fds 0/1/2 to /dev/null so later writes by the command or library
/// code never touch the user's terminal.
fn bind_stdio_to_devnull() -> Result<()> {
    // SAFETY: open(2)/dup2(2)/close(2) on fixed descriptors.
    unsafe {
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull < 0 {
            return Err(os_error("open /dev/null").into());
        }
        for fd in 0..3 {
            if libc::dup2(devnull, fd) < 0 {
                libc::close(devnull);
                return Err(os_error("dup2").into());
            }
        }
        if devnull > 2 {
            libc::close(devnull);
        }
    }
    Ok(())
}

fn os_error(what: &str) -> JobmanError {
    JobmanError::Os(format!(
        "Failed to detach jobman process ({what}): {}",
        std::io::Error::last_os_error()
    ))
}
