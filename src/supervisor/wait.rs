//! The wait gate: block until every configured start condition holds.
//!
//! Conditions are a conjunction: the wall clock has passed `wait_time`, the
//! relative `wait_duration` has elapsed, and every `wait_for_files` path
//! exists. Absent components are satisfied immediately. The gate samples at a
//! fixed cadence and yields on the first tick where one sample sees all
//! conditions true, so a flapping file only has to be present at sample time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::timespec;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolve the two clock conditions into one target instant: whichever of
/// `wait_time` and `now + wait_duration` is later. No clock condition means
/// "now", which is already satisfied.
pub fn combine_waits(
    wait_time: Option<NaiveDateTime>,
    wait_duration: Option<Duration>,
    now: NaiveDateTime,
) -> NaiveDateTime {
    let duration_target = match wait_duration {
        Some(d) => timespec::after(now, d),
        None => now,
    };
    wait_time.unwrap_or(now).max(duration_target)
}

fn files_exist(files: &[PathBuf]) -> bool {
    files.iter().all(|f| Path::new(f).exists())
}

/// Block until all wait conditions hold. The condition is checked before the
/// first sleep, so a policy with nothing to wait for returns in one pass.
pub fn wait(
    wait_time: Option<NaiveDateTime>,
    wait_duration: Option<Duration>,
    wait_for_files: &[PathBuf],
) {
    let target = combine_waits(wait_time, wait_duration, timespec::now());
    debug!(%target, files = wait_for_files.len(), "wait gate armed");

    while !(timespec::now() >= target && files_exist(wait_for_files)) {
        std::thread::sleep(POLL_INTERVAL);
    }
    debug!("wait gate released");
}
