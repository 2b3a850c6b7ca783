//! Notification dispatch for the six job/run lifecycle events.
//!
//! Callbacks named on a job's `notify_on_*` lists resolve against the sinks
//! configured under `notification_sinks`. Delivery is strictly best-effort:
//! unknown callback names and failed deliveries are logged and never fail the
//! job.

use std::io::Write;
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{JobmanConfig, SinkKind, SinkSpec};
use crate::model::{encode_time, Job, Run};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    RunCompletion,
    RunSuccess,
    RunFailure,
    JobCompletion,
    JobSuccess,
    JobFailure,
}

impl NotifyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyEvent::RunCompletion => "run_completion",
            NotifyEvent::RunSuccess => "run_success",
            NotifyEvent::RunFailure => "run_failure",
            NotifyEvent::JobCompletion => "job_completion",
            NotifyEvent::JobSuccess => "job_success",
            NotifyEvent::JobFailure => "job_failure",
        }
    }
}

/// What a sink receives, one JSON object per event.
#[derive(Debug, Serialize)]
struct Payload<'a> {
    job_id: &'a str,
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_time: Option<String>,
}

/// Dispatched after a run's terminal record is persisted: always
/// `run_completion`, plus exactly one of `run_success` / `run_failure`.
pub fn dispatch_run_events(config: &JobmanConfig, job: &Job, run: &Run) {
    let payload = |event: NotifyEvent| Payload {
        job_id: &job.job_id,
        event: event.as_str(),
        attempt: Some(run.attempt),
        exit_code: run.exit_code,
        start_time: run.start_time.map(encode_time),
        finish_time: run.finish_time.map(encode_time),
    };

    deliver_all(config, job, NotifyEvent::RunCompletion, &payload(NotifyEvent::RunCompletion));

    let outcome = match run.exit_code {
        Some(code) if job.is_success_code(code) => NotifyEvent::RunSuccess,
        _ => NotifyEvent::RunFailure,
    };
    deliver_all(config, job, outcome, &payload(outcome));
}

/// Dispatched after the job's terminal record is persisted, strictly after
/// the final run's notifications.
pub fn dispatch_job_events(config: &JobmanConfig, job: &Job) {
    let payload = |event: NotifyEvent| Payload {
        job_id: &job.job_id,
        event: event.as_str(),
        attempt: None,
        exit_code: job.exit_code,
        start_time: job.start_time.map(encode_time),
        finish_time: job.finish_time.map(encode_time),
    };

    deliver_all(config, job, NotifyEvent::JobCompletion, &payload(NotifyEvent::JobCompletion));

    let outcome = match job.exit_code {
        Some(code) if job.is_success_code(code) => NotifyEvent::JobSuccess,
        _ => NotifyEvent::JobFailure,
    };
    deliver_all(config, job, outcome, &payload(outcome));
}

fn deliver_all(config: &JobmanConfig, job: &Job, event: NotifyEvent, payload: &Payload<'_>) {
    for callback in job.callbacks_for(event) {
        let Some(sink) = config.notification_sinks.iter().find(|s| &s.name == callback) else {
            warn!(
                job_id = %job.job_id,
                %callback,
                event = event.as_str(),
                "no configured notification sink matches callback"
            );
            continue;
        };
        if let Err(e) = deliver(sink, payload) {
            warn!(
                job_id = %job.job_id,
                sink = %sink.name,
                event = event.as_str(),
                error = %e,
                "notification delivery failed"
            );
        } else {
            debug!(job_id = %job.job_id, sink = %sink.name, event = event.as_str(), "notified");
        }
    }
}

fn deliver(sink: &SinkSpec, payload: &Payload<'_>) -> anyhow::Result<()> {
    let line = serde_json::to_string(payload)?;
    match &sink.kind {
        SinkKind::Command { command } => {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(command)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(line.as_bytes())?;
                stdin.write_all(b"\n")?;
            }
            drop(child.stdin.take());
            let status = child.wait()?;
            if !status.success() {
                anyhow::bail!("sink command exited with {status}");
            }
            Ok(())
        }
        SinkKind::File { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{line}")?;
            Ok(())
        }
    }
}
