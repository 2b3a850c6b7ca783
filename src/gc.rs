//! Background log garbage collection.
//!
//! Inspection and run ops spawn a detached `jobman _gc` at entry; that child
//! purges the log directories of Complete jobs older than the configured
//! expiry horizon. Every failure path here is swallowed into the logger — GC
//! is never allowed to fail the operation that triggered it.

use std::process::{Command, Stdio};

use anyhow::Result;
use tracing::{debug, warn};

use crate::config::JobmanConfig;
use crate::host;
use crate::purge;
use crate::store::Store;
use crate::timespec;

/// Best-effort spawn of the background sweep. Errors are logged, not raised.
pub fn spawn_background_gc() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            warn!(error = %e, "log GC skipped: cannot resolve current executable");
            return;
        }
    };
    let spawned = Command::new(exe)
        .arg("_gc")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(child) => debug!(pid = child.id(), "log GC spawned"),
        Err(e) => warn!(error = %e, "log GC spawn failed"),
    }
}

/// Body of the hidden `_gc` subcommand: purge logs (not metadata) of
/// Complete jobs that started before `now − gc_expiry`.
pub fn run_gc(config: &JobmanConfig) -> Result<()> {
    let until = timespec::now() - chrono::Duration::from_std(config.gc_expiry())?;
    debug!(%until, "log GC sweeping");

    let store = Store::open(&config.db_path())?;
    let report = purge::purge_jobs(
        config,
        &store,
        &host::host_id(),
        None,
        None,
        Some(until),
        false,
    )?;
    debug!(
        purged = report.purged.len(),
        skipped = report.skipped.len(),
        "log GC complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobmanConfig;
    use crate::model::{test_job, JobState};
    use crate::timespec;
    use std::time::Duration;

    #[test]
    fn gc_purges_only_expired_complete_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobmanConfig::default();
        config.storage_path = dir.path().to_path_buf();
        config.gc_expiry_days = 7.0;

        let store = Store::open(&config.db_path()).unwrap();
        let host_id = host::host_id();

        let old_start = timespec::now() - chrono::Duration::days(30);
        for (id, state, start) in [
            ("11111111", JobState::Complete, old_start),
            ("22222222", JobState::Running, old_start),
            ("33333333", JobState::Complete, timespec::now()),
        ] {
            let mut job = test_job();
            job.job_id = id.to_string();
            job.host_id = host_id.clone();
            job.state = state;
            job.start_time = Some(start);
            store.insert_job(&job).unwrap();
            std::fs::create_dir_all(config.stdio_path().join(id).join("0")).unwrap();
        }

        run_gc(&config).unwrap();

        // Only the expired Complete job lost its logs; metadata stays.
        assert!(!config.stdio_path().join("11111111").exists());
        assert!(config.stdio_path().join("22222222").exists());
        assert!(config.stdio_path().join("33333333").exists());
        assert!(store.job(&host_id, "11111111").unwrap().is_some());
    }

    #[test]
    fn gc_expiry_converts_days() {
        let mut config = JobmanConfig::default();
        config.gc_expiry_days = 0.5;
        assert_eq!(config.gc_expiry(), Duration::from_secs(43_200));
    }
}
