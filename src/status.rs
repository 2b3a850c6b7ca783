//! Implementation of the `status` sub-command.
//!
//! Fetches each requested job (scoped to this host) together with its runs.
//! Ids that match nothing are collected into a missing set; any missing id
//! turns the exit code into UNAVAILABLE after the found jobs are shown.

use anyhow::Result;
use serde_json::json;
use tracing::debug;

use crate::config::JobmanConfig;
use crate::display::{Displayer, OutputMode};
use crate::error::exit_code;
use crate::host;
use crate::model::{encode_time, Job, Run};
use crate::store::Store;

/// Options for the `status` sub-command.
#[derive(Debug, Default)]
pub struct StatusOpts {
    pub job_ids: Vec<String>,
}

/// Execute `status`: fetch, render, pick the exit code from the missing set.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: StatusOpts) -> Result<i32> {
    let store = Store::open(&config.db_path())?;
    let host_id = host::host_id();

    let mut found: Vec<(Job, Vec<Run>)> = Vec::new();
    let mut missing: Vec<String> = Vec::new();
    for id in dedup(&opts.job_ids) {
        match store.job(&host_id, &id)? {
            Some(job) => {
                let runs = store.runs(&job.job_id)?;
                found.push((job, runs));
            }
            None => missing.push(id),
        }
    }
    debug!(found = found.len(), missing = missing.len(), "status query");

    let mut pretty = String::new();
    let mut plain = String::new();
    for (job, runs) in &found {
        pretty.push_str(&format!(
            "Job {}\n  command:    {}\n  state:      {}\n  exit code:  {}\n  start:      {}\n  finish:     {}\n",
            job.job_id,
            job.command,
            job.state.name(),
            job.exit_code.map_or("-".to_string(), |c| c.to_string()),
            opt_time(job.start_time),
            opt_time(job.finish_time),
        ));
        for run in runs {
            pretty.push_str(&format!(
                "  run {}:  state {}  pid {}  exit code {}  killed {}\n",
                run.attempt,
                run.state.name(),
                run.pid.map_or("-".to_string(), |p| p.to_string()),
                run.exit_code.map_or("-".to_string(), |c| c.to_string()),
                run.killed,
            ));
        }
        plain.push_str(&format!(
            "{}\t{}\t{}\n",
            job.job_id,
            job.state.name(),
            job.exit_code.map_or("-".to_string(), |c| c.to_string()),
        ));
    }

    let json_jobs: Vec<serde_json::Value> = found
        .iter()
        .map(|(job, runs)| {
            let mut value = job.to_json();
            value["runs"] = runs.iter().map(Run::to_json).collect();
            value
        })
        .collect();

    displayer.result(
        pretty.trim_end(),
        plain.trim_end(),
        json!({
            "result": if missing.is_empty() { "success" } else { "error" },
            "jobs": json_jobs,
            "missing": missing,
        }),
    );

    if missing.is_empty() {
        Ok(exit_code::OK)
    } else {
        if displayer.mode != OutputMode::Json {
            displayer.error(&format!(
                "No such job(s) on this host: {}",
                missing.join(", ")
            ));
        }
        Ok(exit_code::UNAVAILABLE)
    }
}

fn opt_time(t: Option<chrono::NaiveDateTime>) -> String {
    t.map(encode_time).unwrap_or_else(|| "-".to_string())
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
