//! SQLite-backed persistent store for Jobs and Runs.
//!
//! One database file under `<storage_path>/db`, WAL-journaled, foreign keys
//! on, 64 KiB page cache. The schema is created idempotently on every open,
//! so any entry point (supervisor or inspection op) can be the first one on a
//! fresh machine. Concurrent invocations on the same host coordinate purely
//! through SQLite's own locking; nothing here holds a transaction across a
//! child process's lifetime.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::JobmanError;
use crate::model::{
    decode_duration, decode_int_list, decode_path_list, decode_str_list, decode_time,
    encode_duration, encode_int_list, encode_path_list, encode_str_list, encode_time, Job,
    JobState, Run, RunState,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS job (
    job_id                   TEXT PRIMARY KEY,
    host_id                  TEXT NOT NULL,
    command                  TEXT NOT NULL,
    wait_time                TEXT,
    wait_duration            REAL,
    wait_for_files           TEXT,
    abort_time               TEXT,
    abort_duration           REAL,
    abort_for_files          TEXT,
    retry_attempts           INTEGER NOT NULL DEFAULT 0,
    retry_delay              REAL,
    retry_expo_backoff       INTEGER NOT NULL DEFAULT 0,
    retry_jitter             INTEGER NOT NULL DEFAULT 0,
    success_codes            TEXT,
    notify_on_run_completion TEXT,
    notify_on_run_success    TEXT,
    notify_on_run_failure    TEXT,
    notify_on_job_completion TEXT,
    notify_on_job_success    TEXT,
    notify_on_job_failure    TEXT,
    follow                   INTEGER NOT NULL DEFAULT 0,
    start_time               TEXT,
    finish_time              TEXT,
    state                    INTEGER NOT NULL,
    exit_code                INTEGER
);
CREATE INDEX IF NOT EXISTS idx_job_host ON job(host_id);
CREATE INDEX IF NOT EXISTS idx_job_host_state ON job(host_id, state);

CREATE TABLE IF NOT EXISTS run (
    job_id      TEXT NOT NULL REFERENCES job(job_id) ON DELETE CASCADE,
    attempt     INTEGER NOT NULL,
    log_path    TEXT NOT NULL,
    pid         INTEGER,
    start_time  TEXT,
    finish_time TEXT,
    state       INTEGER NOT NULL,
    exit_code   INTEGER,
    killed      INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, attempt)
);
";

/// Subset filter for job queries. All present parts must match.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub ids: Option<Vec<String>>,
    pub states: Option<Vec<JobState>>,
    pub since: Option<NaiveDateTime>,
    pub until: Option<NaiveDateTime>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database, applying pragmas and the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("open store at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA cache_size=-64;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .context("apply store pragmas")?;

        conn.execute_batch(SCHEMA).context("create store schema")?;

        Ok(Store { conn })
    }

    // ---------- Jobs ----------

    pub fn insert_job(&self, job: &Job) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO job (
                    job_id, host_id, command,
                    wait_time, wait_duration, wait_for_files,
                    abort_time, abort_duration, abort_for_files,
                    retry_attempts, retry_delay, retry_expo_backoff, retry_jitter,
                    success_codes,
                    notify_on_run_completion, notify_on_run_success, notify_on_run_failure,
                    notify_on_job_completion, notify_on_job_success, notify_on_job_failure,
                    follow, start_time, finish_time, state, exit_code
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25
                 )",
                params![
                    job.job_id,
                    job.host_id,
                    job.command,
                    job.wait_time.map(encode_time),
                    job.wait_duration.map(encode_duration),
                    encode_path_list(&job.wait_for_files)?,
                    job.abort_time.map(encode_time),
                    job.abort_duration.map(encode_duration),
                    encode_path_list(&job.abort_for_files)?,
                    job.retry_attempts,
                    job.retry_delay.map(encode_duration),
                    job.retry_expo_backoff,
                    job.retry_jitter,
                    encode_int_list(&job.success_codes)?,
                    encode_str_list(&job.notify_on_run_completion)?,
                    encode_str_list(&job.notify_on_run_success)?,
                    encode_str_list(&job.notify_on_run_failure)?,
                    encode_str_list(&job.notify_on_job_completion)?,
                    encode_str_list(&job.notify_on_job_success)?,
                    encode_str_list(&job.notify_on_job_failure)?,
                    job.follow,
                    job.start_time.map(encode_time),
                    job.finish_time.map(encode_time),
                    job.state.as_i64(),
                    job.exit_code,
                ],
            )
            .context("insert job")?;
        Ok(())
    }

    pub fn job_id_taken(&self, host_id: &str, job_id: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM job WHERE host_id = ?1 AND job_id = ?2",
                params![host_id, job_id],
                |row| row.get(0),
            )
            .context("check job id")?;
        Ok(count > 0)
    }

    pub fn job(&self, host_id: &str, job_id: &str) -> Result<Option<Job>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM job WHERE host_id = ?1 AND job_id = ?2"),
                params![host_id, job_id],
                job_from_row,
            )
            .optional()
            .context("fetch job")
    }

    /// Fetch jobs for a host, optionally narrowed by id set, state set, and a
    /// start-time window.
    pub fn jobs(&self, host_id: &str, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE host_id = ?");
        let mut values: Vec<Value> = vec![Value::from(host_id.to_string())];

        if let Some(ids) = &filter.ids {
            sql.push_str(&format!(" AND job_id IN ({})", placeholders(ids.len())));
            values.extend(ids.iter().map(|id| Value::from(id.clone())));
        }
        if let Some(states) = &filter.states {
            sql.push_str(&format!(" AND state IN ({})", placeholders(states.len())));
            values.extend(states.iter().map(|s| Value::from(s.as_i64())));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND start_time IS NOT NULL AND start_time >= ?");
            values.push(Value::from(encode_time(since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND start_time IS NOT NULL AND start_time <= ?");
            values.push(Value::from(encode_time(until)));
        }

        let mut stmt = self.conn.prepare(&sql).context("prepare job query")?;
        let jobs = stmt
            .query_map(rusqlite::params_from_iter(values), job_from_row)
            .context("run job query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("decode job rows")?;
        Ok(jobs)
    }

    pub fn update_job_state(&self, job_id: &str, state: JobState) -> Result<()> {
        self.conn
            .execute(
                "UPDATE job SET state = ?1 WHERE job_id = ?2",
                params![state.as_i64(), job_id],
            )
            .context("update job state")?;
        Ok(())
    }

    pub fn finalize_job(
        &self,
        job_id: &str,
        finish_time: NaiveDateTime,
        exit_code: Option<i32>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE job SET state = ?1, finish_time = ?2, exit_code = ?3 WHERE job_id = ?4",
                params![
                    JobState::Complete.as_i64(),
                    encode_time(finish_time),
                    exit_code,
                    job_id
                ],
            )
            .context("finalize job")?;
        Ok(())
    }

    /// Delete a job row; runs go with it via the cascade.
    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM job WHERE job_id = ?1", params![job_id])
            .context("delete job")?;
        Ok(())
    }

    // ---------- Runs ----------

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run (
                    job_id, attempt, log_path, pid, start_time, finish_time,
                    state, exit_code, killed
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.job_id,
                    run.attempt,
                    path_to_db(&run.log_path)?,
                    run.pid,
                    run.start_time.map(encode_time),
                    run.finish_time.map(encode_time),
                    run.state.as_i64(),
                    run.exit_code,
                    run.killed,
                ],
            )
            .context("insert run")?;
        Ok(())
    }

    pub fn run(&self, job_id: &str, attempt: u32) -> Result<Option<Run>> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM run WHERE job_id = ?1 AND attempt = ?2"),
                params![job_id, attempt],
                run_from_row,
            )
            .optional()
            .context("fetch run")
    }

    /// All runs of a job, ordered by attempt.
    pub fn runs(&self, job_id: &str) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM run WHERE job_id = ?1 ORDER BY attempt"
            ))
            .context("prepare runs query")?;
        let runs = stmt
            .query_map(params![job_id], run_from_row)
            .context("run runs query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("decode run rows")?;
        Ok(runs)
    }

    /// Runs that a concurrent `kill` can act on: running with a usable pid.
    pub fn active_runs(&self, job_id: &str) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM run
                 WHERE job_id = ?1 AND state = ?2 AND pid IS NOT NULL
                 ORDER BY attempt"
            ))
            .context("prepare active runs query")?;
        let runs = stmt
            .query_map(params![job_id, RunState::Running.as_i64()], run_from_row)
            .context("run active runs query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("decode active run rows")?;
        Ok(runs)
    }

    /// Persisted before the supervisor blocks on the child, so a concurrent
    /// reader that sees Running also sees the pid.
    pub fn mark_run_running(
        &self,
        job_id: &str,
        attempt: u32,
        pid: u32,
        start_time: NaiveDateTime,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE run SET state = ?1, pid = ?2, start_time = ?3
                 WHERE job_id = ?4 AND attempt = ?5",
                params![
                    RunState::Running.as_i64(),
                    pid,
                    encode_time(start_time),
                    job_id,
                    attempt
                ],
            )
            .context("mark run running")?;
        Ok(())
    }

    pub fn complete_run(
        &self,
        job_id: &str,
        attempt: u32,
        finish_time: NaiveDateTime,
        exit_code: i32,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE run SET state = ?1, finish_time = ?2, exit_code = ?3
                 WHERE job_id = ?4 AND attempt = ?5",
                params![
                    RunState::Complete.as_i64(),
                    encode_time(finish_time),
                    exit_code,
                    job_id,
                    attempt
                ],
            )
            .context("complete run")?;
        Ok(())
    }

    pub fn mark_run_killed(&self, job_id: &str, attempt: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE run SET killed = 1 WHERE job_id = ?1 AND attempt = ?2",
                params![job_id, attempt],
            )
            .context("mark run killed")?;
        Ok(())
    }
}

const JOB_COLUMNS: &str = "job_id, host_id, command, \
    wait_time, wait_duration, wait_for_files, \
    abort_time, abort_duration, abort_for_files, \
    retry_attempts, retry_delay, retry_expo_backoff, retry_jitter, \
    success_codes, \
    notify_on_run_completion, notify_on_run_success, notify_on_run_failure, \
    notify_on_job_completion, notify_on_job_success, notify_on_job_failure, \
    follow, start_time, finish_time, state, exit_code";

const RUN_COLUMNS: &str =
    "job_id, attempt, log_path, pid, start_time, finish_time, state, exit_code, killed";

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn path_to_db(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        JobmanError::Usage(format!(
            "Path {} is not valid UTF-8 and cannot be stored",
            path.display()
        ))
        .into()
    })
}

/// Wrap a codec failure so it can travel through rusqlite's row mapping.
fn conv_err(e: JobmanError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn opt_time(column: Option<String>) -> rusqlite::Result<Option<NaiveDateTime>> {
    column
        .map(|s| decode_time(&s).map_err(conv_err))
        .transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        job_id: row.get(0)?,
        host_id: row.get(1)?,
        command: row.get(2)?,
        wait_time: opt_time(row.get(3)?)?,
        wait_duration: row.get::<_, Option<f64>>(4)?.map(decode_duration),
        wait_for_files: decode_path_list(row.get(5)?),
        abort_time: opt_time(row.get(6)?)?,
        abort_duration: row.get::<_, Option<f64>>(7)?.map(decode_duration),
        abort_for_files: decode_path_list(row.get(8)?),
        retry_attempts: row.get(9)?,
        retry_delay: row.get::<_, Option<f64>>(10)?.map(decode_duration),
        retry_expo_backoff: row.get(11)?,
        retry_jitter: row.get(12)?,
        success_codes: decode_int_list(row.get(13)?).map_err(conv_err)?,
        notify_on_run_completion: decode_str_list(row.get(14)?),
        notify_on_run_success: decode_str_list(row.get(15)?),
        notify_on_run_failure: decode_str_list(row.get(16)?),
        notify_on_job_completion: decode_str_list(row.get(17)?),
        notify_on_job_success: decode_str_list(row.get(18)?),
        notify_on_job_failure: decode_str_list(row.get(19)?),
        follow: row.get(20)?,
        start_time: opt_time(row.get(21)?)?,
        finish_time: opt_time(row.get(22)?)?,
        state: JobState::from_i64(row.get(23)?).map_err(conv_err)?,
        exit_code: row.get(24)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        job_id: row.get(0)?,
        attempt: row.get(1)?,
        log_path: PathBuf::from(row.get::<_, String>(2)?),
        pid: row.get(3)?,
        start_time: opt_time(row.get(4)?)?,
        finish_time: opt_time(row.get(5)?)?,
        state: RunState::from_i64(row.get(6)?).map_err(conv_err)?,
        exit_code: row.get(7)?,
        killed: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_job;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("db")).unwrap();
        (dir, store)
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        drop(Store::open(&path).unwrap());
        drop(Store::open(&path).unwrap());
    }

    #[test]
    fn job_round_trip_with_full_policy() {
        let (_dir, store) = open_store();
        let mut job = test_job();
        job.wait_time = Some(at(1, 9));
        job.wait_duration = Some(Duration::from_secs(90));
        job.wait_for_files = vec!["/tmp/go".into(), "/tmp/also go".into()];
        job.abort_duration = Some(Duration::from_millis(1500));
        job.retry_attempts = 3;
        job.retry_delay = Some(Duration::from_secs(2));
        job.retry_expo_backoff = true;
        job.retry_jitter = true;
        job.success_codes = vec![0, 7];
        job.notify_on_job_failure = vec!["pager".into(), "audit".into()];
        job.start_time = Some(at(1, 8));

        store.insert_job(&job).unwrap();
        let back = store.job(&job.host_id, &job.job_id).unwrap().unwrap();

        assert_eq!(back.command, job.command);
        assert_eq!(back.wait_time, job.wait_time);
        assert_eq!(back.wait_duration, job.wait_duration);
        assert_eq!(back.wait_for_files, job.wait_for_files);
        assert_eq!(back.abort_duration, job.abort_duration);
        assert_eq!(back.retry_attempts, 3);
        assert!(back.retry_expo_backoff);
        assert!(back.retry_jitter);
        assert_eq!(back.success_codes, vec![0, 7]);
        assert_eq!(back.notify_on_job_failure, job.notify_on_job_failure);
        assert_eq!(back.state, JobState::Submitted);
        assert_eq!(back.exit_code, None);
    }

    #[test]
    fn queries_are_host_scoped() {
        let (_dir, store) = open_store();
        let job = test_job();
        store.insert_job(&job).unwrap();

        assert!(store.job("other-host-id", &job.job_id).unwrap().is_none());
        assert!(store
            .jobs("other-host-id", &JobFilter::default())
            .unwrap()
            .is_empty());
        assert!(!store.job_id_taken("other-host-id", &job.job_id).unwrap());
        assert!(store.job_id_taken(&job.host_id, &job.job_id).unwrap());
    }

    #[test]
    fn filter_by_state_and_window() {
        let (_dir, store) = open_store();
        for (id, state, day) in [
            ("aaaaaaaa", JobState::Submitted, 1),
            ("bbbbbbbb", JobState::Running, 2),
            ("cccccccc", JobState::Complete, 3),
        ] {
            let mut job = test_job();
            job.job_id = id.to_string();
            job.state = state;
            job.start_time = Some(at(day, 12));
            store.insert_job(&job).unwrap();
        }
        let host = test_job().host_id;

        let active = store
            .jobs(
                &host,
                &JobFilter {
                    states: Some(vec![JobState::Submitted, JobState::Running]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(active.len(), 2);

        let windowed = store
            .jobs(
                &host,
                &JobFilter {
                    since: Some(at(2, 0)),
                    until: Some(at(2, 23)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].job_id, "bbbbbbbb");

        let by_id = store
            .jobs(
                &host,
                &JobFilter {
                    ids: Some(vec!["aaaaaaaa".into(), "cccccccc".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_id.len(), 2);
    }

    #[test]
    fn run_lifecycle_and_active_query() {
        let (_dir, store) = open_store();
        let job = test_job();
        store.insert_job(&job).unwrap();

        let run = Run {
            job_id: job.job_id.clone(),
            attempt: 0,
            log_path: "/tmp/stdio/a1b2c3d4/0".into(),
            pid: None,
            start_time: None,
            finish_time: None,
            state: RunState::Submitted,
            exit_code: None,
            killed: false,
        };
        store.insert_run(&run).unwrap();
        assert!(store.active_runs(&job.job_id).unwrap().is_empty());

        store
            .mark_run_running(&job.job_id, 0, 4242, at(1, 10))
            .unwrap();
        let active = store.active_runs(&job.job_id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pid, Some(4242));
        assert_eq!(active[0].state, RunState::Running);

        store.mark_run_killed(&job.job_id, 0).unwrap();
        store.complete_run(&job.job_id, 0, at(1, 11), 130).unwrap();

        let back = store.run(&job.job_id, 0).unwrap().unwrap();
        assert!(back.killed);
        assert_eq!(back.exit_code, Some(130));
        assert_eq!(back.state, RunState::Complete);
        assert!(store.active_runs(&job.job_id).unwrap().is_empty());
    }

    #[test]
    fn delete_job_cascades_to_runs() {
        let (_dir, store) = open_store();
        let job = test_job();
        store.insert_job(&job).unwrap();
        for attempt in 0..2 {
            store
                .insert_run(&Run {
                    job_id: job.job_id.clone(),
                    attempt,
                    log_path: format!("/tmp/stdio/{}/{attempt}", job.job_id).into(),
                    pid: None,
                    start_time: None,
                    finish_time: None,
                    state: RunState::Submitted,
                    exit_code: None,
                    killed: false,
                })
                .unwrap();
        }

        store.delete_job(&job.job_id).unwrap();
        assert!(store.job(&job.host_id, &job.job_id).unwrap().is_none());
        assert!(store.runs(&job.job_id).unwrap().is_empty());
    }

    #[test]
    fn finalize_job_sets_terminal_fields() {
        let (_dir, store) = open_store();
        let job = test_job();
        store.insert_job(&job).unwrap();

        store.update_job_state(&job.job_id, JobState::Running).unwrap();
        store.finalize_job(&job.job_id, at(1, 12), Some(0)).unwrap();

        let back = store.job(&job.host_id, &job.job_id).unwrap().unwrap();
        assert_eq!(back.state, JobState::Complete);
        assert_eq!(back.exit_code, Some(0));
        assert_eq!(back.finish_time, Some(at(1, 12)));
    }
}
