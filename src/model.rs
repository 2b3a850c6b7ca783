//! The persistent data model: Jobs, Runs, their states, and the column codecs.
//!
//! A Job is a user-submitted command plus policy plus terminal outcome; a Run
//! is one attempted execution of it. Both live in the SQLite store with typed
//! text columns: datetimes as ISO-local strings, durations as float seconds,
//! ordered lists as `|`-joined text, states as the integer codes {0, 1, 2}.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde_json::json;

use crate::error::JobmanError;
use crate::notify::NotifyEvent;

/// Internal delimiter for list-typed columns. Elements must not contain it.
pub const LIST_DELIM: char = '|';

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted = 0,
    Running = 1,
    Complete = 2,
}

impl JobState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Result<Self, JobmanError> {
        match value {
            0 => Ok(JobState::Submitted),
            1 => Ok(JobState::Running),
            2 => Ok(JobState::Complete),
            other => Err(JobmanError::DataErr(format!("invalid job state {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JobState::Submitted => "Submitted",
            JobState::Running => "Running",
            JobState::Complete => "Complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Submitted = 0,
    Running = 1,
    Complete = 2,
}

impl RunState {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Result<Self, JobmanError> {
        match value {
            0 => Ok(RunState::Submitted),
            1 => Ok(RunState::Running),
            2 => Ok(RunState::Complete),
            other => Err(JobmanError::DataErr(format!("invalid run state {other}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RunState::Submitted => "Submitted",
            RunState::Running => "Running",
            RunState::Complete => "Complete",
        }
    }
}

/// Identity + policy + terminal outcome for one submitted command.
#[derive(Debug, Clone)]
pub struct Job {
    /// 8 lowercase hex chars, unique per host.
    pub job_id: String,
    pub host_id: String,
    /// The literal shell command line handed to `sh -c`.
    pub command: String,

    pub wait_time: Option<NaiveDateTime>,
    pub wait_duration: Option<Duration>,
    pub wait_for_files: Vec<PathBuf>,

    pub abort_time: Option<NaiveDateTime>,
    pub abort_duration: Option<Duration>,
    pub abort_for_files: Vec<PathBuf>,

    /// Total attempts = retry_attempts + 1.
    pub retry_attempts: u32,
    pub retry_delay: Option<Duration>,
    pub retry_expo_backoff: bool,
    pub retry_jitter: bool,

    pub success_codes: Vec<i32>,

    pub notify_on_run_completion: Vec<String>,
    pub notify_on_run_success: Vec<String>,
    pub notify_on_run_failure: Vec<String>,
    pub notify_on_job_completion: Vec<String>,
    pub notify_on_job_success: Vec<String>,
    pub notify_on_job_failure: Vec<String>,

    pub follow: bool,
    pub start_time: Option<NaiveDateTime>,
    pub finish_time: Option<NaiveDateTime>,
    pub state: JobState,
    pub exit_code: Option<i32>,
}

impl Job {
    pub fn is_success_code(&self, code: i32) -> bool {
        self.success_codes.contains(&code)
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Complete
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.exit_code, Some(code) if !self.is_success_code(code))
    }

    pub fn callbacks_for(&self, event: NotifyEvent) -> &[String] {
        match event {
            NotifyEvent::RunCompletion => &self.notify_on_run_completion,
            NotifyEvent::RunSuccess => &self.notify_on_run_success,
            NotifyEvent::RunFailure => &self.notify_on_run_failure,
            NotifyEvent::JobCompletion => &self.notify_on_job_completion,
            NotifyEvent::JobSuccess => &self.notify_on_job_success,
            NotifyEvent::JobFailure => &self.notify_on_job_failure,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "job_id": self.job_id,
            "host_id": self.host_id,
            "command": self.command,
            "wait_time": self.wait_time.map(encode_time),
            "wait_duration": self.wait_duration.map(|d| d.as_secs_f64()),
            "wait_for_files": paths_to_strings(&self.wait_for_files),
            "abort_time": self.abort_time.map(encode_time),
            "abort_duration": self.abort_duration.map(|d| d.as_secs_f64()),
            "abort_for_files": paths_to_strings(&self.abort_for_files),
            "retry_attempts": self.retry_attempts,
            "retry_delay": self.retry_delay.map(|d| d.as_secs_f64()),
            "retry_expo_backoff": self.retry_expo_backoff,
            "retry_jitter": self.retry_jitter,
            "success_codes": self.success_codes,
            "follow": self.follow,
            "start_time": self.start_time.map(encode_time),
            "finish_time": self.finish_time.map(encode_time),
            "state": self.state.name(),
            "exit_code": self.exit_code,
        })
    }
}

/// One attempted execution of a Job: one child process, one log directory.
#[derive(Debug, Clone)]
pub struct Run {
    pub job_id: String,
    /// 0-based index within the Job; consecutive.
    pub attempt: u32,
    /// Directory containing `out.txt` and `err.txt`.
    pub log_path: PathBuf,
    pub pid: Option<u32>,
    pub start_time: Option<NaiveDateTime>,
    pub finish_time: Option<NaiveDateTime>,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub killed: bool,
}

impl Run {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "job_id": self.job_id,
            "attempt": self.attempt,
            "log_path": self.log_path.display().to_string(),
            "pid": self.pid,
            "start_time": self.start_time.map(encode_time),
            "finish_time": self.finish_time.map(encode_time),
            "state": self.state.name(),
            "exit_code": self.exit_code,
            "killed": self.killed,
        })
    }
}

fn paths_to_strings(paths: &[PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.display().to_string()).collect()
}

/// A minimal Job for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_job() -> Job {
    Job {
        job_id: "a1b2c3d4".into(),
        host_id: "0123456789ab".into(),
        command: "echo hi".into(),
        wait_time: None,
        wait_duration: None,
        wait_for_files: Vec::new(),
        abort_time: None,
        abort_duration: None,
        abort_for_files: Vec::new(),
        retry_attempts: 0,
        retry_delay: None,
        retry_expo_backoff: false,
        retry_jitter: false,
        success_codes: vec![0],
        notify_on_run_completion: Vec::new(),
        notify_on_run_success: Vec::new(),
        notify_on_run_failure: Vec::new(),
        notify_on_job_completion: Vec::new(),
        notify_on_job_success: Vec::new(),
        notify_on_job_failure: Vec::new(),
        follow: false,
        start_time: None,
        finish_time: None,
        state: JobState::Submitted,
        exit_code: None,
    }
}

// ---------- Column codecs ----------

pub fn encode_time(t: NaiveDateTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub fn decode_time(s: &str) -> Result<NaiveDateTime, JobmanError> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| JobmanError::DataErr(format!("invalid stored timestamp '{s}': {e}")))
}

pub fn encode_duration(d: Duration) -> f64 {
    d.as_secs_f64()
}

pub fn decode_duration(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

/// Join list elements with the internal delimiter. Empty lists map to NULL so
/// that "unset" and "no entries" round-trip identically.
pub fn encode_str_list(items: &[String]) -> Result<Option<String>, JobmanError> {
    if items.is_empty() {
        return Ok(None);
    }
    for item in items {
        if item.contains(LIST_DELIM) {
            return Err(JobmanError::Usage(format!(
                "List elements must not contain the internal delimiter '{LIST_DELIM}'. \
                 Received element '{item}'."
            )));
        }
    }
    Ok(Some(
        items
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(&LIST_DELIM.to_string()),
    ))
}

pub fn decode_str_list(column: Option<String>) -> Vec<String> {
    match column {
        None => Vec::new(),
        Some(s) => s.split(LIST_DELIM).map(str::to_string).collect(),
    }
}

pub fn encode_int_list(items: &[i32]) -> Result<Option<String>, JobmanError> {
    let as_strings: Vec<String> = items.iter().map(|i| i.to_string()).collect();
    encode_str_list(&as_strings)
}

pub fn decode_int_list(column: Option<String>) -> Result<Vec<i32>, JobmanError> {
    decode_str_list(column)
        .iter()
        .map(|s| {
            s.parse::<i32>()
                .map_err(|e| JobmanError::DataErr(format!("invalid stored integer '{s}': {e}")))
        })
        .collect()
}

pub fn encode_path_list(paths: &[PathBuf]) -> Result<Option<String>, JobmanError> {
    let as_strings: Result<Vec<String>, JobmanError> = paths
        .iter()
        .map(|p| {
            p.to_str().map(str::to_string).ok_or_else(|| {
                JobmanError::Usage(format!(
                    "Path {} is not valid UTF-8 and cannot be stored",
                    p.display()
                ))
            })
        })
        .collect();
    encode_str_list(&as_strings?)
}

pub fn decode_path_list(column: Option<String>) -> Vec<PathBuf> {
    decode_str_list(column).into_iter().map(PathBuf::from).collect()
}
