//! The per-job supervisor: builds the Job record, then drives it through
//! wait → run → observe → retry → notify after the process has detached.
//!
//! The supervisor is the only writer of its job's records while the job is
//! alive; sibling invocations read them through the store and interfere only
//! via `kill` (which flips `Run.killed` and signals the child directly).

pub mod abort;
pub mod nohup;
pub mod wait;

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rand::Rng;
use tracing::{debug, info};

use crate::config::JobmanConfig;
use crate::error::JobmanError;
use crate::host;
use crate::model::{Job, JobState, Run, RunState};
use crate::notify;
use crate::store::Store;
use crate::timespec;

pub const OUT_FILE: &str = "out.txt";
pub const ERR_FILE: &str = "err.txt";

pub const ENV_JOB_ID: &str = "JOBMAN_JOB_ID";
pub const ENV_ATTEMPT_NUM: &str = "JOBMAN_ATTEMPT_NUM";

/// Set by the abort handler; the handler itself does nothing else except
/// forward the signal to the current child.
static ABORT_RECEIVED: AtomicBool = AtomicBool::new(false);
/// Set when the abort signal arrived while no child existed; the next spawn
/// consumes it so the one delivery is not lost to that race.
static ABORT_PENDING: AtomicBool = AtomicBool::new(false);
/// Pid of the currently running child, 0 when none.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Everything `run` collects from the CLI to describe one job.
#[derive(Debug, Clone, Default)]
pub struct SubmitOpts {
    pub command: Vec<String>,
    pub wait_time: Option<NaiveDateTime>,
    pub wait_duration: Option<Duration>,
    pub wait_for_files: Vec<PathBuf>,
    pub abort_time: Option<NaiveDateTime>,
    pub abort_duration: Option<Duration>,
    pub abort_for_files: Vec<PathBuf>,
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
}

/// Collapse the argv the shell handed us into the literal command line the
/// child's `sh -c` will see. A single token passes verbatim so an
/// already-quoted command survives; multiple tokens are re-quoted so
/// `foo 'a b' | bar` round-trips.
pub fn preproc_cmd(tokens: &[String]) -> Result<String, JobmanError> {
    if tokens.len() == 1 {
        return Ok(tokens[0].clone());
    }
    shlex::try_join(tokens.iter().map(String::as_str))
        .map_err(|_| JobmanError::Usage("Command contains a NUL byte".to_string()))
}

fn generate_job_id<R: Rng>(rng: &mut R) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    (0..8).map(|_| HEX[rng.gen_range(0..HEX.len())] as char).collect()
}

/// Build and persist the Job record with `state = Submitted`. Runs in the
/// still-attached terminal process so the id can be printed before detach.
pub fn build_job(store: &Store, opts: SubmitOpts) -> Result<Job> {
    for code in &opts.success_codes {
        if !(0..=255).contains(code) {
            return Err(JobmanError::Usage(format!(
                "Success codes must be in 0..255, got {code}"
            ))
            .into());
        }
    }
    let success_codes = if opts.success_codes.is_empty() {
        vec![0]
    } else {
        opts.success_codes
    };

    let host_id = host::host_id();
    let mut rng = rand::thread_rng();
    let job_id = loop {
        let candidate = generate_job_id(&mut rng);
        if !store.job_id_taken(&host_id, &candidate)? {
            break candidate;
        }
    };

    let job = Job {
        job_id,
        host_id,
        command: preproc_cmd(&opts.command)?,
        wait_time: opts.wait_time,
        wait_duration: opts.wait_duration,
        wait_for_files: opts.wait_for_files,
        abort_time: opts.abort_time,
        abort_duration: opts.abort_duration,
        abort_for_files: opts.abort_for_files,
        retry_attempts: opts.retry_attempts,
        retry_delay: opts.retry_delay,
        retry_expo_backoff: opts.retry_expo_backoff,
        retry_jitter: opts.retry_jitter,
        success_codes,
        notify_on_run_completion: opts.notify_on_run_completion,
        notify_on_run_success: opts.notify_on_run_success,
        notify_on_run_failure: opts.notify_on_run_failure,
        notify_on_job_completion: opts.notify_on_job_completion,
        notify_on_job_success: opts.notify_on_job_success,
        notify_on_job_failure: opts.notify_on_job_failure,
        follow: opts.follow,
        start_time: Some(timespec::now()),
        finish_time: None,
        state: JobState::Submitted,
        exit_code: None,
    };
    store.insert_job(&job)?;
    info!(job_id = %job.job_id, command = %job.command, "job submitted");
    Ok(job)
}

/// Drive one job to completion. Runs in the detached grandchild.
pub fn supervise(config: &JobmanConfig, mut job: Job) -> Result<()> {
    let store = Store::open(&config.db_path())?;

    install_abort_handler(abort::DEFAULT_SIGNAL)?;
    let monitor = abort::spawn_monitor(
        std::process::id() as libc::pid_t,
        abort::DEFAULT_SIGNAL,
        job.abort_time,
        job.abort_duration,
        &job.abort_for_files,
    )?;

    wait::wait(job.wait_time, job.wait_duration, &job.wait_for_files);

    store.update_job_state(&job.job_id, JobState::Running)?;
    job.state = JobState::Running;
    info!(job_id = %job.job_id, "job running");

    for attempt in 0..=job.retry_attempts {
        if attempt > 0 {
            let Some(prev) = store.run(&job.job_id, attempt - 1)? else {
                break;
            };
            let succeeded = prev.exit_code.is_some_and(|c| job.is_success_code(c));
            if succeeded || prev.killed {
                break;
            }
            let delay = retry_delay(&job, attempt);
            if !delay.is_zero() {
                debug!(job_id = %job.job_id, attempt, ?delay, "retry delay");
                std::thread::sleep(delay);
            }
        }
        run_attempt(&store, config, &job, attempt)?;
    }

    if let Some(monitor) = monitor {
        monitor.stop();
    }

    let runs = store.runs(&job.job_id)?;
    let last = runs.last();
    let finish_time = last
        .and_then(|r| r.finish_time)
        .unwrap_or_else(timespec::now);
    let exit_code = last.and_then(|r| r.exit_code);
    store.finalize_job(&job.job_id, finish_time, exit_code)?;
    job.finish_time = Some(finish_time);
    job.exit_code = exit_code;
    job.state = JobState::Complete;
    info!(job_id = %job.job_id, exit_code, runs = runs.len(), "job complete");

    notify::dispatch_job_events(config, &job);
    Ok(())
}

/// One attempt: create the Run, launch the child, await it, persist the
/// outcome, dispatch per-run notifications.
fn run_attempt(store: &Store, config: &JobmanConfig, job: &Job, attempt: u32) -> Result<()> {
    let log_dir = config
        .stdio_path()
        .join(&job.job_id)
        .join(attempt.to_string());
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;

    let run = Run {
        job_id: job.job_id.clone(),
        attempt,
        log_path: log_dir.clone(),
        pid: None,
        start_time: None,
        finish_time: None,
        state: RunState::Submitted,
        exit_code: None,
        killed: false,
    };
    store.insert_run(&run)?;

    let out = File::create(log_dir.join(OUT_FILE))
        .with_context(|| format!("create {OUT_FILE} in {}", log_dir.display()))?;
    let err = File::create(log_dir.join(ERR_FILE))
        .with_context(|| format!("create {ERR_FILE} in {}", log_dir.display()))?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&job.command)
        .env(ENV_JOB_ID, &job.job_id)
        .env(ENV_ATTEMPT_NUM, attempt.to_string())
        .stdin(Stdio::null())
        .stdout(out)
        .stderr(err)
        .spawn()
        .context("spawn job command")?;

    let pid = child.id();
    CHILD_PID.store(pid as i32, Ordering::SeqCst);
    if ABORT_PENDING.swap(false, Ordering::SeqCst) {
        // The abort signal landed before this child existed; deliver it now.
        // SAFETY: kill(2) on the child we just spawned.
        unsafe {
            libc::kill(pid as libc::pid_t, abort::DEFAULT_SIGNAL);
        }
    }
    store.mark_run_running(&job.job_id, attempt, pid, timespec::now())?;
    info!(job_id = %job.job_id, attempt, pid, "run started");

    let status = child.wait().context("await job command")?;
    CHILD_PID.store(0, Ordering::SeqCst);

    let exit_code = exit_code_of(status);
    store.complete_run(&job.job_id, attempt, timespec::now(), exit_code)?;
    if abort_received() {
        debug!(job_id = %job.job_id, attempt, "attempt ended after an abort signal");
    }
    info!(job_id = %job.job_id, attempt, exit_code, "run complete");

    // Re-read so a concurrent kill's `killed` flag reaches the notification
    // payload and the retry decision.
    let run = store.run(&job.job_id, attempt)?.unwrap_or(run);
    notify::dispatch_run_events(config, job, &run);
    Ok(())
}

/// `base · (2^(n-1) if expo else 1) + jitter`, clamped at zero.
fn retry_delay(job: &Job, attempt: u32) -> Duration {
    let base = job.retry_delay.map(|d| d.as_secs_f64()).unwrap_or(0.0);
    let mut secs = if job.retry_expo_backoff {
        base * 2f64.powi(attempt as i32 - 1)
    } else {
        base
    };
    if job.retry_jitter && base > 0.0 {
        let bound = base / 10.0;
        secs += rand::thread_rng().gen_range(-bound..=bound);
    }
    Duration::from_secs_f64(secs.max(0.0))
}

/// `128 + signum` for signal deaths, the exit code otherwise.
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Whether the abort monitor has fired at this process. An abort fire does
/// not set `Run.killed` (only the external `kill` op does), so retries stay
/// eligible afterwards.
fn abort_received() -> bool {
    ABORT_RECEIVED.load(Ordering::SeqCst)
}

extern "C" fn forward_abort(sig: libc::c_int) {
    ABORT_RECEIVED.store(true, Ordering::SeqCst);
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe; the handler does nothing else.
        unsafe {
            libc::kill(pid, sig);
        }
    } else {
        ABORT_PENDING.store(true, Ordering::SeqCst);
    }
}

fn install_abort_handler(sig: i32) -> Result<()> {
    // SAFETY: installs a handler restricted to async-signal-safe work
    // (atomics and kill). All store mutation stays on the main path.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = forward_abort as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(JobmanError::Os(format!(
                "Failed to install abort handler: {}",
                std::io::Error::last_os_error()
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_job;

    #[test]
    fn single_token_passes_verbatim() {
        let cmd = vec!["echo 'a b' | wc -l".to_string()];
        assert_eq!(preproc_cmd(&cmd).unwrap(), "echo 'a b' | wc -l");
    }

    #[test]
    fn multi_token_is_requoted() {
        let cmd = vec!["echo".to_string(), "a b".to_string()];
        let joined = preproc_cmd(&cmd).unwrap();
        let split = shlex::split(&joined).unwrap();
        assert_eq!(split, vec!["echo", "a b"]);
    }

    #[test]
    fn job_id_is_8_lowercase_hex() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let id = generate_job_id(&mut rng);
            assert_eq!(id.len(), 8);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn retry_delay_flat_and_exponential() {
        let mut job = test_job();
        job.retry_delay = Some(Duration::from_secs(2));

        assert_eq!(retry_delay(&job, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&job, 3), Duration::from_secs(2));

        job.retry_expo_backoff = true;
        assert_eq!(retry_delay(&job, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&job, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(&job, 4), Duration::from_secs(16));
    }

    #[test]
    fn retry_delay_jitter_stays_in_bounds() {
        let mut job = test_job();
        job.retry_delay = Some(Duration::from_secs(10));
        job.retry_jitter = true;

        for _ in 0..64 {
            let d = retry_delay(&job, 1).as_secs_f64();
            assert!((9.0..=11.0).contains(&d), "delay {d} outside jitter bounds");
        }
    }

    #[test]
    fn retry_delay_unset_is_zero() {
        let job = test_job();
        assert_eq!(retry_delay(&job, 1), Duration::ZERO);
    }

    #[test]
    fn exit_code_follows_wait_status_conventions() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code_of(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(
            exit_code_of(ExitStatus::from_raw(libc::SIGINT)),
            128 + libc::SIGINT
        );
    }
}
