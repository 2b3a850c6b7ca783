//! Implementation of the `kill` sub-command.
//!
//! Selects the running runs of the requested jobs and delivers a signal to
//! their pids. Unless retries are explicitly allowed, each run's `killed`
//! flag is flipped in the store first, so the supervisor breaks its attempt
//! loop when the child is reaped. Four disjoint sets are reported:
//! nonexistent job ids, jobs with nothing running, runs signalled, and runs
//! whose signal delivery failed.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::config::JobmanConfig;
use crate::display::{Displayer, OutputMode};
use crate::error::exit_code;
use crate::host;
use crate::store::Store;
use crate::supervisor::abort;

/// Options for the `kill` sub-command.
#[derive(Debug, Default)]
pub struct KillOpts {
    pub job_ids: Vec<String>,
    /// Signal name or number; SIGINT when unset.
    pub signal: Option<String>,
    /// Leave the retry policy in force instead of ending the job.
    pub allow_retries: bool,
    pub force: bool,
}

/// The four disjoint outcome sets.
#[derive(Debug, Default)]
pub struct KillReport {
    pub nonexistent_job_ids: Vec<String>,
    pub nonrunning_job_ids: Vec<String>,
    pub killed_runs: Vec<(String, u32)>,
    pub failed_killed_runs: Vec<(String, u32)>,
}

impl KillReport {
    pub fn is_clean(&self) -> bool {
        self.nonexistent_job_ids.is_empty()
            && self.nonrunning_job_ids.is_empty()
            && self.failed_killed_runs.is_empty()
    }
}

/// Execute `kill`: resolve runs, flip `killed` when retries are not allowed,
/// deliver the signal, report.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: KillOpts) -> Result<i32> {
    let sig = match &opts.signal {
        Some(spec) => abort::parse_signal(spec)?,
        None => abort::DEFAULT_SIGNAL,
    };

    if !displayer.confirm(
        "Killing will interrupt the running job(s). Continue?",
        opts.force,
    ) {
        displayer.note("Kill aborted");
        return Ok(exit_code::OK);
    }

    let store = Store::open(&config.db_path())?;
    let host_id = host::host_id();
    let mut report = KillReport::default();

    for id in dedup(&opts.job_ids) {
        let Some(job) = store.job(&host_id, &id)? else {
            report.nonexistent_job_ids.push(id);
            continue;
        };

        let active = store.active_runs(&job.job_id)?;
        if active.is_empty() {
            report.nonrunning_job_ids.push(job.job_id);
            continue;
        }

        for run in active {
            // Flip the flag before signalling so the supervisor's retry
            // decision already sees it when the child is reaped.
            if !opts.allow_retries {
                store.mark_run_killed(&run.job_id, run.attempt)?;
            }

            let Some(pid) = run.pid else {
                report.failed_killed_runs.push((run.job_id, run.attempt));
                continue;
            };
            match send_signal(pid, sig) {
                Ok(()) => {
                    info!(job_id = %run.job_id, attempt = run.attempt, pid, sig, "run signalled");
                    report.killed_runs.push((run.job_id, run.attempt));
                }
                Err(e) => {
                    warn!(
                        job_id = %run.job_id,
                        attempt = run.attempt,
                        pid,
                        sig,
                        error = %e,
                        "signal delivery failed"
                    );
                    report.failed_killed_runs.push((run.job_id, run.attempt));
                }
            }
        }
    }

    render(displayer, &report);
    if report.is_clean() {
        Ok(exit_code::OK)
    } else {
        if displayer.mode != OutputMode::Json {
            displayer.error("Some jobs could not be killed");
        }
        Ok(exit_code::DATAERR)
    }
}

fn render(displayer: &Displayer, report: &KillReport) {
    let runs = |set: &[(String, u32)]| -> Vec<String> {
        set.iter()
            .map(|(id, attempt)| format!("{id}/{attempt}"))
            .collect()
    };
    let killed = runs(&report.killed_runs);
    let failed = runs(&report.failed_killed_runs);

    let mut pretty = format!("Killed {} run(s)", killed.len());
    if !killed.is_empty() {
        pretty.push_str(&format!(": {}", killed.join(", ")));
    }
    if !report.nonrunning_job_ids.is_empty() {
        pretty.push_str(&format!(
            "; not running: {}",
            report.nonrunning_job_ids.join(", ")
        ));
    }
    if !report.nonexistent_job_ids.is_empty() {
        pretty.push_str(&format!(
            "; no such job(s): {}",
            report.nonexistent_job_ids.join(", ")
        ));
    }
    if !failed.is_empty() {
        pretty.push_str(&format!("; failed: {}", failed.join(", ")));
    }

    displayer.result(
        &pretty,
        &killed.join("\n"),
        json!({
            "result": if report.is_clean() { "success" } else { "error" },
            "killed_runs": killed,
            "failed_killed_runs": failed,
            "nonrunning_job_ids": report.nonrunning_job_ids,
            "nonexistent_job_ids": report.nonexistent_job_ids,
        }),
    );
}

fn send_signal(pid: u32, sig: i32) -> std::io::Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
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

    #[test]
    fn signalling_own_pid_with_zero_probe_succeeds() {
        // Signal 0 probes deliverability without delivering anything.
        assert!(send_signal(std::process::id(), 0).is_ok());
    }

    #[test]
    fn signalling_dead_pid_fails() {
        // Spawn and reap a child so its pid is free-ish; ESRCH expected.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(send_signal(pid, 0).is_err());
    }
}
