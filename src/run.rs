//! Implementation of the `run` sub-command.
//!
//! The terminal-attached front half builds and persists the Job, prints the
//! id, and then detaches; the detached grandchild becomes the supervisor and
//! drives the job to completion. With `--follow`, the original process stays
//! on the terminal tailing run logs while the supervisor proceeds detached.

use std::io::Write;

use anyhow::Result;
use serde_json::json;

use crate::config::JobmanConfig;
use crate::display::Displayer;
use crate::error::exit_code;
use crate::gc;
use crate::logs::{self, LogsOpts};
use crate::store::Store;
use crate::supervisor::{self, nohup, SubmitOpts};

/// Execute `run`: submit, print the id, detach, supervise.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: SubmitOpts) -> Result<i32> {
    // The store handle must not survive into the forks below; build the job
    // in its own scope and reopen on the supervisor side.
    let job = {
        let store = Store::open(&config.db_path())?;
        supervisor::build_job(&store, opts)?
    };

    gc::spawn_background_gc();

    // The terminal observes the id before any fork happens.
    displayer.result(
        &format!("Submitted job {}", job.job_id),
        &job.job_id,
        json!({
            "result": "success",
            "message": "Job submitted",
            "job_id": job.job_id,
        }),
    );
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    match nohup::nohupify(job.follow)? {
        nohup::Detached::Supervisor => {
            supervisor::supervise(config, job)?;
            Ok(exit_code::OK)
        }
        nohup::Detached::Terminal => {
            // Tail the logs on the user's terminal until the job completes.
            logs::execute(
                config,
                displayer,
                LogsOpts {
                    job_id: job.job_id,
                    follow: true,
                    ..Default::default()
                },
            )
        }
    }
}
