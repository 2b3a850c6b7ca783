//! Implementation of the `ls` sub-command.
//!
//! Lists this host's jobs, newest first (jobs without a start time sort
//! last). The default view is restricted to jobs still in flight; `--all`
//! includes completed ones and adds the terminal columns.

use anyhow::Result;
use chrono::Timelike;
use serde_json::json;
use tracing::debug;

use crate::config::JobmanConfig;
use crate::display::Displayer;
use crate::error::exit_code;
use crate::host;
use crate::model::{encode_time, Job, JobState};
use crate::store::{JobFilter, Store};

/// Options for the `ls` sub-command.
#[derive(Debug, Default)]
pub struct LsOpts {
    /// Include Complete jobs too.
    pub all: bool,
}

/// Execute `ls`: query, sort, render.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: LsOpts) -> Result<i32> {
    let store = Store::open(&config.db_path())?;
    let jobs = ls(&store, opts.all)?;

    if jobs.is_empty() {
        displayer.note("No jobs found");
        if displayer.mode == crate::display::OutputMode::Json {
            displayer.result("", "", json!({ "result": "success", "jobs": [] }));
        }
        return Ok(exit_code::OK);
    }

    let mut pretty = format!(
        "{} jobman jobs\n{:<10} {:<20} {:<20} {:<20}{}\n",
        if opts.all { "All" } else { "Running" },
        "job id",
        "start time",
        "finish time",
        "command",
        if opts.all { "  state     exit code" } else { "" },
    );
    for job in &jobs {
        let line = format!(
            "{:<10} {:<20} {:<20} {:<20}{}",
            job.job_id,
            column_time(job.start_time),
            column_time(job.finish_time),
            job.command,
            if opts.all {
                format!(
                    "  {:<9} {}",
                    job.state.name(),
                    job.exit_code.map_or("-".to_string(), |c| c.to_string())
                )
            } else {
                String::new()
            },
        );
        pretty.push_str(&line);
        pretty.push('\n');
    }

    let plain = jobs
        .iter()
        .map(|j| j.job_id.clone())
        .collect::<Vec<_>>()
        .join("\n");
    let json_jobs: Vec<_> = jobs.iter().map(Job::to_json).collect();

    displayer.result(
        pretty.trim_end(),
        &plain,
        json!({ "result": "success", "jobs": json_jobs }),
    );
    Ok(exit_code::OK)
}

/// Query the host's jobs, active-only unless `all`, sorted newest first with
/// missing start times last.
pub fn ls(store: &Store, all: bool) -> Result<Vec<Job>> {
    let filter = if all {
        JobFilter::default()
    } else {
        JobFilter {
            states: Some(vec![JobState::Submitted, JobState::Running]),
            ..Default::default()
        }
    };

    let mut jobs = store.jobs(&host::host_id(), &filter)?;
    jobs.sort_by(|a, b| match (a.start_time, b.start_time) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => b.job_id.cmp(&a.job_id),
    });
    debug!(count = jobs.len(), all, "ls complete");
    Ok(jobs)
}

fn column_time(t: Option<chrono::NaiveDateTime>) -> String {
    t.map(|t| encode_time(t.with_nanosecond(0).unwrap_or(t)))
        .unwrap_or_else(|| "-".to_string())
}
