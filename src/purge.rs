//! Implementation of the `purge` sub-command.
//!
//! Deletes log directories (and optionally store metadata) for Complete jobs.
//! Jobs that are not yet Complete are skipped and reported; unknown ids are
//! reported as nonexistent. Any skipped or nonexistent entry turns the exit
//! code into DATAERR while still reporting the full result.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde_json::json;
use tracing::{debug, info};

use crate::config::JobmanConfig;
use crate::display::{Displayer, OutputMode};
use crate::error::{exit_code, JobmanError};
use crate::host;
use crate::store::{JobFilter, Store};

/// Options for the `purge` sub-command.
#[derive(Debug, Default)]
pub struct PurgeOpts {
    pub job_ids: Vec<String>,
    pub all: bool,
    pub metadata: bool,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
    pub force: bool,
}

/// The three disjoint outcome sets.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: Vec<String>,
    pub skipped: Vec<String>,
    pub nonexistent: Vec<String>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.nonexistent.is_empty()
    }
}

/// Execute `purge`: validate the id/all exclusivity, confirm, sweep, report.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: PurgeOpts) -> Result<i32> {
    if opts.job_ids.is_empty() == !opts.all {
        return Err(JobmanError::Usage(
            "Must supply either a job-id argument or the -a/--all flag, but not both".to_string(),
        )
        .into());
    }

    if !displayer.confirm(
        "Purging will permanently delete all specified job history and logs. Continue?",
        opts.force,
    ) {
        displayer.note("Purge aborted");
        return Ok(exit_code::OK);
    }

    let store = Store::open(&config.db_path())?;
    let ids = if opts.all { None } else { Some(opts.job_ids.as_slice()) };
    let report = purge_jobs(
        config,
        &store,
        &host::host_id(),
        ids,
        opts.since,
        opts.until,
        opts.metadata,
    )?;

    let pretty = format!(
        "Purged {} job(s){}{}",
        report.purged.len(),
        if report.skipped.is_empty() {
            String::new()
        } else {
            format!("; skipped (not complete): {}", report.skipped.join(", "))
        },
        if report.nonexistent.is_empty() {
            String::new()
        } else {
            format!("; no such job(s): {}", report.nonexistent.join(", "))
        },
    );
    let plain = report.purged.join("\n");
    displayer.result(
        &pretty,
        &plain,
        json!({
            "result": if report.is_clean() { "success" } else { "error" },
            "purged": report.purged,
            "skipped": report.skipped,
            "nonexistent": report.nonexistent,
        }),
    );

    if report.is_clean() {
        Ok(exit_code::OK)
    } else {
        if displayer.mode != OutputMode::Json {
            displayer.error("Some jobs could not be purged");
        }
        Ok(exit_code::DATAERR)
    }
}

/// The purge core, shared with the background log GC. `ids = None` means all
/// jobs for the host; the optional window filters on start time. Only
/// Complete jobs are purged; `metadata` additionally cascade-deletes the
/// store rows.
pub fn purge_jobs(
    config: &JobmanConfig,
    store: &Store,
    host_id: &str,
    ids: Option<&[String]>,
    since: Option<NaiveDateTime>,
    until: Option<NaiveDateTime>,
    metadata: bool,
) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();

    let filter = JobFilter {
        ids: ids.map(|ids| dedup(ids)),
        states: None,
        since,
        until,
    };
    let jobs = store.jobs(host_id, &filter)?;

    if let Some(requested) = &filter.ids {
        for id in requested {
            if !jobs.iter().any(|j| &j.job_id == id) {
                report.nonexistent.push(id.clone());
            }
        }
    }

    for job in jobs {
        if !job.is_completed() {
            debug!(job_id = %job.job_id, "purge skipping job that is not complete");
            report.skipped.push(job.job_id);
            continue;
        }

        let log_dir = config.stdio_path().join(&job.job_id);
        match std::fs::remove_dir_all(&log_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("delete log dir {}", log_dir.display()));
            }
        }

        if metadata {
            store.delete_job(&job.job_id)?;
        }
        info!(job_id = %job.job_id, metadata, "job purged");
        report.purged.push(job.job_id);
    }

    Ok(report)
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for id in ids {
        if !seen.contains(id) {
            seen.push(id.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_job, JobState, Run, RunState};
    use crate::timespec;

    fn setup() -> (tempfile::TempDir, JobmanConfig, Store, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobmanConfig::default();
        config.storage_path = dir.path().to_path_buf();
        let store = Store::open(&config.db_path()).unwrap();
        let host_id = test_job().host_id;
        (dir, config, store, host_id)
    }

    fn seed_job(
        config: &JobmanConfig,
        store: &Store,
        id: &str,
        state: JobState,
    ) {
        let mut job = test_job();
        job.job_id = id.to_string();
        job.state = state;
        job.start_time = Some(timespec::now());
        store.insert_job(&job).unwrap();
        store
            .insert_run(&Run {
                job_id: id.to_string(),
                attempt: 0,
                log_path: config.stdio_path().join(id).join("0"),
                pid: None,
                start_time: None,
                finish_time: None,
                state: RunState::Complete,
                exit_code: Some(0),
                killed: false,
            })
            .unwrap();
        std::fs::create_dir_all(config.stdio_path().join(id).join("0")).unwrap();
    }

    #[test]
    fn complete_jobs_purge_incomplete_skip_unknown_report() {
        let (_dir, config, store, host_id) = setup();
        seed_job(&config, &store, "aaaaaaaa", JobState::Complete);
        seed_job(&config, &store, "bbbbbbbb", JobState::Running);

        let ids = vec![
            "aaaaaaaa".to_string(),
            "bbbbbbbb".to_string(),
            "eeeeeeee".to_string(),
        ];
        let report =
            purge_jobs(&config, &store, &host_id, Some(&ids), None, None, true).unwrap();

        assert_eq!(report.purged, vec!["aaaaaaaa"]);
        assert_eq!(report.skipped, vec!["bbbbbbbb"]);
        assert_eq!(report.nonexistent, vec!["eeeeeeee"]);
        assert!(!report.is_clean());

        // A purged the logs and (metadata = true) the rows, runs included.
        assert!(!config.stdio_path().join("aaaaaaaa").exists());
        assert!(store.job(&host_id, "aaaaaaaa").unwrap().is_none());
        assert!(store.runs("aaaaaaaa").unwrap().is_empty());

        // B untouched.
        assert!(config.stdio_path().join("bbbbbbbb").exists());
        assert!(store.job(&host_id, "bbbbbbbb").unwrap().is_some());
    }

    #[test]
    fn logs_only_purge_keeps_metadata() {
        let (_dir, config, store, host_id) = setup();
        seed_job(&config, &store, "aaaaaaaa", JobState::Complete);

        let report =
            purge_jobs(&config, &store, &host_id, None, None, None, false).unwrap();

        assert_eq!(report.purged, vec!["aaaaaaaa"]);
        assert!(!config.stdio_path().join("aaaaaaaa").exists());
        assert!(store.job(&host_id, "aaaaaaaa").unwrap().is_some());
    }

    #[test]
    fn window_excludes_recent_jobs() {
        let (_dir, config, store, host_id) = setup();
        seed_job(&config, &store, "aaaaaaaa", JobState::Complete);

        let cutoff = timespec::now() - chrono::Duration::hours(1);
        let report =
            purge_jobs(&config, &store, &host_id, None, None, Some(cutoff), false).unwrap();
        assert!(report.purged.is_empty());
        assert!(config.stdio_path().join("aaaaaaaa").exists());
    }

    #[test]
    fn missing_log_dir_is_not_an_error() {
        let (_dir, config, store, host_id) = setup();
        seed_job(&config, &store, "aaaaaaaa", JobState::Complete);
        std::fs::remove_dir_all(config.stdio_path().join("aaaaaaaa")).unwrap();

        let report =
            purge_jobs(&config, &store, &host_id, None, None, None, true).unwrap();
        assert_eq!(report.purged, vec!["aaaaaaaa"]);
    }
}
