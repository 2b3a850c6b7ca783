//! The abort monitor: a sibling process that signals the supervisor when any
//! abort condition fires.
//!
//! It runs as a forked OS process rather than a thread so it survives the
//! very signal it delivers: the supervisor installs a handler for that signal,
//! and a thread in the same address space could be interrupted mid-wait. The
//! monitor is one-shot: it polls, fires at most once, and exits. The
//! supervisor kills it unconditionally when the attempt loop finishes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use tracing::debug;

use crate::error::JobmanError;
use crate::supervisor::wait::POLL_INTERVAL;
use crate::timespec;

/// The signal delivered when no `-s` override is given.
pub const DEFAULT_SIGNAL: i32 = libc::SIGINT;

/// Resolve the two clock conditions into one deadline: whichever of
/// `abort_time` and `now + abort_duration` comes first. None when neither is
/// configured.
pub fn combine_aborts(
    abort_time: Option<NaiveDateTime>,
    abort_duration: Option<Duration>,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let duration_deadline = abort_duration.map(|d| timespec::after(now, d));
    match (abort_time, duration_deadline) {
        (Some(t), Some(d)) => Some(t.min(d)),
        (Some(t), None) => Some(t),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    }
}

fn any_file_exists(files: &[PathBuf]) -> bool {
    files.iter().any(|f| Path::new(f).exists())
}

/// Handle to a spawned monitor process.
pub struct MonitorHandle {
    pid: libc::pid_t,
}

impl MonitorHandle {
    /// Stop the monitor unconditionally and reap it. If it already fired and
    /// exited, the kill is a no-op and the wait clears the zombie.
    pub fn stop(self) {
        // SAFETY: kill(2)/waitpid(2) on a child we forked; ESRCH/ECHILD are
        // benign here.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            libc::waitpid(self.pid, std::ptr::null_mut(), 0);
        }
    }
}

/// Fork the monitor targeting `target_pid` with `sig`. Returns None when the
/// job carries no abort policy at all — such a monitor could never fire.
pub fn spawn_monitor(
    target_pid: libc::pid_t,
    sig: i32,
    abort_time: Option<NaiveDateTime>,
    abort_duration: Option<Duration>,
    abort_for_files: &[PathBuf],
) -> Result<Option<MonitorHandle>> {
    let deadline = combine_aborts(abort_time, abort_duration, timespec::now());
    if deadline.is_none() && abort_for_files.is_empty() {
        return Ok(None);
    }

    // SAFETY: fork(2) in the single-threaded supervisor; the child only
    // polls the filesystem and clock, delivers one signal, and _exits.
    match unsafe { libc::fork() } {
        -1 => Err(JobmanError::Os(format!(
            "Failed to fork abort monitor: {}",
            std::io::Error::last_os_error()
        ))
        .into()),
        0 => {
            monitor_loop(target_pid, sig, deadline, abort_for_files);
            // SAFETY: terminate the monitor child without running the
            // supervisor's atexit state.
            unsafe { libc::_exit(0) }
        }
        pid => {
            debug!(monitor_pid = pid, target_pid, sig, "abort monitor started");
            Ok(Some(MonitorHandle { pid }))
        }
    }
}

fn monitor_loop(
    target_pid: libc::pid_t,
    sig: i32,
    deadline: Option<NaiveDateTime>,
    files: &[PathBuf],
) {
    let deadline_reached =
        |now: NaiveDateTime| deadline.map(|d| now >= d).unwrap_or(false);

    while !(deadline_reached(timespec::now()) || any_file_exists(files)) {
        std::thread::sleep(POLL_INTERVAL);
    }

    // SAFETY: kill(2) with a validated signal number. Delivering to a pid
    // that already exited is not an error worth surfacing.
    let rc = unsafe { libc::kill(target_pid, sig) };
    if rc != 0 {
        debug!(
            target_pid,
            sig,
            error = %std::io::Error::last_os_error(),
            "abort signal not delivered (target likely exited)"
        );
    } else {
        debug!(target_pid, sig, "abort condition fired, signal delivered");
    }
}

/// Parse a signal given by name (`INT`, `SIGINT`) or number.
pub fn parse_signal(spec: &str) -> Result<i32, JobmanError> {
    if let Ok(num) = spec.parse::<i32>() {
        if (1..=31).contains(&num) {
            return Ok(num);
        }
        return Err(JobmanError::Usage(format!("Invalid signal number {num}")));
    }

    let name = spec.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    let sig = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ABRT" => libc::SIGABRT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        _ => {
            return Err(JobmanError::Usage(format!("Unknown signal '{spec}'")));
        }
    };
    Ok(sig)
}
