//! Implementation of the `logs` sub-command.
//!
//! Reads `out.txt` / `err.txt` for each run of a job in attempt order, with
//! per-stream filters. `--follow` keeps tailing file growth (new attempts
//! included) until the job reaches Complete, then drains what is left.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveDateTime;
use serde_json::json;
use tracing::debug;

use crate::config::JobmanConfig;
use crate::display::Displayer;
use crate::error::{exit_code, JobmanError};
use crate::host;
use crate::model::Run;
use crate::store::Store;
use crate::supervisor::{ERR_FILE, OUT_FILE};
use crate::timespec;

const FOLLOW_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// Options for the `logs` sub-command.
#[derive(Debug, Default)]
pub struct LogsOpts {
    pub job_id: String,
    pub hide_stdout: bool,
    pub hide_stderr: bool,
    pub follow: bool,
    pub no_log_prefix: bool,
    /// Keep only the last N lines per stream per run.
    pub tail: Option<usize>,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
}

/// Execute `logs`: snapshot mode renders once; follow mode streams until the
/// job completes.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: LogsOpts) -> Result<i32> {
    let store = Store::open(&config.db_path())?;
    let host_id = host::host_id();

    let Some(job) = store.job(&host_id, &opts.job_id)? else {
        return Err(JobmanError::Unavailable(format!(
            "No such job on this host: {}",
            opts.job_id
        ))
        .into());
    };

    if opts.follow && !job.is_completed() {
        follow(&store, &host_id, &opts)?;
        return Ok(exit_code::OK);
    }

    let runs = select_runs(store.runs(&job.job_id)?, opts.since, opts.until);
    debug!(job_id = %job.job_id, runs = runs.len(), "logs snapshot");

    let mut text = String::new();
    let mut json_runs = Vec::new();
    for run in &runs {
        let stdout = stream_lines(&run.log_path.join(OUT_FILE), opts.tail);
        let stderr = stream_lines(&run.log_path.join(ERR_FILE), opts.tail);

        if !opts.hide_stdout {
            for line in &stdout {
                text.push_str(&prefixed(line, "out", opts.no_log_prefix));
                text.push('\n');
            }
        }
        if !opts.hide_stderr {
            for line in &stderr {
                text.push_str(&prefixed(line, "err", opts.no_log_prefix));
                text.push('\n');
            }
        }
        json_runs.push(json!({
            "attempt": run.attempt,
            "stdout": if opts.hide_stdout { Vec::new() } else { stdout },
            "stderr": if opts.hide_stderr { Vec::new() } else { stderr },
        }));
    }

    let text = text.trim_end_matches('\n');
    displayer.result(
        text,
        text,
        json!({
            "result": "success",
            "job_id": job.job_id,
            "runs": json_runs,
        }),
    );
    Ok(exit_code::OK)
}

/// Keep runs whose lifespan overlaps the `[since, until]` window. Open ends
/// of either the window or the run match everything on that side.
fn select_runs(
    runs: Vec<Run>,
    since: Option<NaiveDateTime>,
    until: Option<NaiveDateTime>,
) -> Vec<Run> {
    runs.into_iter()
        .filter(|run| {
            let started = run.start_time.unwrap_or_else(timespec::now);
            let finished = run.finish_time.unwrap_or_else(timespec::now);
            since.is_none_or(|s| finished >= s) && until.is_none_or(|u| started <= u)
        })
        .collect()
}

fn stream_lines(path: &Path, tail: Option<usize>) -> Vec<String> {
    let Ok(raw) = std::fs::read(path) else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&raw);
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if let Some(n) = tail {
        let skip = lines.len().saturating_sub(n);
        lines.drain(..skip);
    }
    lines
}

fn prefixed(line: &str, stream: &str, no_prefix: bool) -> String {
    if no_prefix {
        line.to_string()
    } else {
        format!("{stream} | {line}")
    }
}

/// Per-stream cursor for the follow loop: only complete lines are printed,
/// so a partially written line waits for its newline.
struct StreamCursor {
    path: PathBuf,
    label: &'static str,
    offset: usize,
}

impl StreamCursor {
    fn drain(&mut self, no_prefix: bool, everything: bool) -> bool {
        let Ok(raw) = std::fs::read(&self.path) else {
            return false;
        };
        if raw.len() <= self.offset {
            return false;
        }
        let fresh = &raw[self.offset..];
        let printable_end = if everything {
            fresh.len()
        } else {
            match fresh.iter().rposition(|&b| b == b'\n') {
                Some(idx) => idx + 1,
                None => return false,
            }
        };

        let chunk = String::from_utf8_lossy(&fresh[..printable_end]);
        for line in chunk.lines() {
            println!("{}", prefixed(line, self.label, no_prefix));
        }
        self.offset += printable_end;
        true
    }
}

/// Tail the job's streams until it reaches Complete, then drain the rest.
/// Output is streamed as plain lines in every display mode.
fn follow(store: &Store, host_id: &str, opts: &LogsOpts) -> Result<()> {
    let mut cursors: Vec<(u32, StreamCursor)> = Vec::new();

    loop {
        let job = store.job(host_id, &opts.job_id)?;
        let done = job.as_ref().map(|j| j.is_completed()).unwrap_or(true);

        for run in select_runs(store.runs(&opts.job_id)?, opts.since, opts.until) {
            for (label, file, hidden) in [
                ("out", OUT_FILE, opts.hide_stdout),
                ("err", ERR_FILE, opts.hide_stderr),
            ] {
                if hidden {
                    continue;
                }
                let tracked = cursors
                    .iter()
                    .any(|(attempt, c)| *attempt == run.attempt && c.label == label);
                if !tracked {
                    cursors.push((
                        run.attempt,
                        StreamCursor {
                            path: run.log_path.join(file),
                            label,
                            offset: 0,
                        },
                    ));
                }
            }
        }

        for (_, cursor) in cursors.iter_mut() {
            cursor.drain(opts.no_log_prefix, done);
        }

        if done {
            return Ok(());
        }
        std::thread::sleep(FOLLOW_POLL);
    }
}
