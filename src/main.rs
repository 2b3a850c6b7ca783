//! jobman — entry point.
//!
//! Argument parsing and display-mode selection live here; each subcommand
//! body is in its own module. Tracing logs go to stderr so stdout stays
//! script-consumable. Exit codes follow the sysexits-style taxonomy in
//! [`jobman::error`].

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jobman::config::load_config;
use jobman::display::{Displayer, OutputMode};
use jobman::error::{exit_code, exit_code_for};
use jobman::supervisor::SubmitOpts;
use jobman::{completions, gc, kill, logs, ls, purge, reset, run, status, timespec};

#[derive(Debug, Parser)]
#[command(name = "jobman", version)]
#[command(about = "Run and monitor jobs on the command line with support for retries, \
                   timeouts, logging, notifications, and more.")]
struct Cli {
    /// Suppress unnecessary output.
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Show output in machine-readable JSON format.
    #[arg(short = 'j', long, global = true)]
    json: bool,

    /// Show output as unadorned plain text.
    #[arg(short = 'p', long, global = true)]
    plain: bool,

    /// Log debug detail to stderr.
    #[arg(short = 'd', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a job in the background immune to hangups.
    Run {
        /// Do not run the command until the specified date or time.
        #[arg(long, value_parser = timespec::parse_time_or_datetime)]
        wait_time: Option<NaiveDateTime>,

        /// Do not run the command until the specified duration has elapsed.
        #[arg(long, value_parser = timespec::parse_duration)]
        wait_duration: Option<Duration>,

        /// Do not run the command until the specified file exists.
        #[arg(long = "wait-for-file", value_name = "PATH")]
        wait_for_file: Vec<PathBuf>,

        /// Terminate the command if it's still running at the specified time.
        #[arg(long, value_parser = timespec::parse_time_or_datetime)]
        abort_time: Option<NaiveDateTime>,

        /// Terminate the command if it's still running after the specified
        /// duration has elapsed.
        #[arg(long, value_parser = timespec::parse_duration)]
        abort_duration: Option<Duration>,

        /// Terminate the command if it's still running and the specified file
        /// exists.
        #[arg(long = "abort-for-file", value_name = "PATH")]
        abort_for_file: Vec<PathBuf>,

        /// If the command fails, rerun it up to the specified number of times.
        #[arg(long, default_value_t = 0)]
        retry_attempts: u32,

        /// Wait the specified duration before starting retries.
        #[arg(long, value_parser = timespec::parse_duration)]
        retry_delay: Option<Duration>,

        /// Double the retry delay after every failed attempt.
        #[arg(long)]
        retry_expo_backoff: bool,

        /// Randomize each retry delay by up to a tenth of the base delay.
        #[arg(long)]
        retry_jitter: bool,

        /// Interpret these exit codes as a successful execution.
        #[arg(
            short = 'c',
            long = "success-code",
            value_name = "CODE",
            value_parser = parse_success_code
        )]
        success_code: Vec<i32>,

        /// Send a notification to this callback when any run completes.
        #[arg(long, value_name = "CALLBACK")]
        notify_on_run_completion: Vec<String>,

        /// Send a notification to this callback when any run succeeds.
        #[arg(long, value_name = "CALLBACK")]
        notify_on_run_success: Vec<String>,

        /// Send a notification to this callback when a run fails.
        #[arg(long, value_name = "CALLBACK")]
        notify_on_run_failure: Vec<String>,

        /// Send a notification to this callback when the job completes.
        #[arg(long, value_name = "CALLBACK")]
        notify_on_job_completion: Vec<String>,

        /// Send a notification to this callback when the job succeeds.
        #[arg(long, value_name = "CALLBACK")]
        notify_on_job_success: Vec<String>,

        /// Send a notification to this callback when the job fails.
        #[arg(long, value_name = "CALLBACK")]
        notify_on_job_failure: Vec<String>,

        /// Display a running log of the command's output.
        #[arg(short = 'f', long)]
        follow: bool,

        /// Command to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Display the status of jobs.
    Status {
        #[arg(required = true, value_name = "JOB_ID")]
        job_id: Vec<String>,
    },

    /// Show output from a job.
    Logs {
        #[arg(value_name = "JOB_ID")]
        job_id: String,

        /// Hide the stdout stream.
        #[arg(short = 'o', long)]
        hide_stdout: bool,

        /// Hide the stderr stream.
        #[arg(short = 'e', long)]
        hide_stderr: bool,

        /// Keep tailing until the job completes.
        #[arg(short = 'f', long)]
        follow: bool,

        /// Print log lines without the stream prefix.
        #[arg(short = 'x', long)]
        no_log_prefix: bool,

        /// Show only the last N lines of each stream.
        #[arg(short = 'n', long, value_name = "N")]
        tail: Option<usize>,

        /// Show only runs active since this time.
        #[arg(short = 's', long, value_parser = timespec::parse_time_or_datetime)]
        since: Option<NaiveDateTime>,

        /// Show only runs active until this time.
        #[arg(short = 'u', long, value_parser = timespec::parse_time_or_datetime)]
        until: Option<NaiveDateTime>,
    },

    /// Stop running jobs.
    Kill {
        #[arg(required = true, value_name = "JOB_ID")]
        job_id: Vec<String>,

        /// Signal to deliver, by name or number.
        #[arg(short = 's', long)]
        signal: Option<String>,

        /// Keep the job's retry policy in force after the signal.
        #[arg(short = 'r', long)]
        allow_retries: bool,

        /// Skip the confirmation prompt.
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// View jobs.
    Ls {
        /// Include completed jobs.
        #[arg(short = 'a', long)]
        all: bool,
    },

    /// Delete logs and metadata for historical jobs.
    Purge {
        #[arg(value_name = "JOB_ID")]
        job_id: Vec<String>,

        /// Purge every eligible job instead of naming ids.
        #[arg(short = 'a', long)]
        all: bool,

        /// Also delete the job and run records from the store.
        #[arg(short = 'm', long)]
        metadata: bool,

        /// Only purge jobs started at or after this time.
        #[arg(short = 's', long, value_parser = timespec::parse_time_or_datetime)]
        since: Option<NaiveDateTime>,

        /// Only purge jobs started at or before this time.
        #[arg(short = 'u', long, value_parser = timespec::parse_time_or_datetime)]
        until: Option<NaiveDateTime>,

        /// Skip the confirmation prompt.
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Destroy and recreate the full jobman database.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(short = 'f', long)]
        force: bool,
    },

    /// Install shell completions for jobman.
    InstallCompletions {
        /// bash, zsh, or fish; inferred from $SHELL when omitted.
        shell: Option<String>,
    },

    /// [Internal] Emit the completion script the installed rc line evals.
    #[command(name = "_completions", hide = true)]
    Completions { shell: String },

    /// [Internal] Background log garbage collection sweep.
    #[command(name = "_gc", hide = true)]
    Gc,
}

fn parse_success_code(raw: &str) -> Result<i32, String> {
    let code: i32 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not an integer"))?;
    if !(0..=255).contains(&code) {
        return Err(format!("{code} is not in 0..255"));
    }
    Ok(code)
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_code::OK,
                _ => exit_code::USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Logs always go to stderr so stdout stays renderable output.
    let default_level = if cli.debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env("JOBMAN_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if cli.json && cli.plain {
        let displayer = Displayer::new(OutputMode::Json, cli.quiet);
        displayer.error("The --json and --plain display flags conflict");
        std::process::exit(exit_code::CONFIG);
    }
    let mode = if cli.json {
        OutputMode::Json
    } else if cli.plain {
        OutputMode::Plain
    } else {
        OutputMode::Pretty
    };
    let displayer = Displayer::new(mode, cli.quiet);

    match dispatch(cli, &displayer) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            displayer.error(&format!("{e:#}"));
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn dispatch(cli: Cli, displayer: &Displayer) -> Result<i32> {
    match cli.command {
        Command::Run {
            wait_time,
            wait_duration,
            wait_for_file,
            abort_time,
            abort_duration,
            abort_for_file,
            retry_attempts,
            retry_delay,
            retry_expo_backoff,
            retry_jitter,
            success_code,
            notify_on_run_completion,
            notify_on_run_success,
            notify_on_run_failure,
            notify_on_job_completion,
            notify_on_job_success,
            notify_on_job_failure,
            follow,
            command,
        } => {
            let config = load_config()?;
            run::execute(
                &config,
                displayer,
                SubmitOpts {
                    command,
                    wait_time,
                    wait_duration,
                    wait_for_files: wait_for_file,
                    abort_time,
                    abort_duration,
                    abort_for_files: abort_for_file,
                    retry_attempts,
                    retry_delay,
                    retry_expo_backoff,
                    retry_jitter,
                    success_codes: success_code,
                    notify_on_run_completion,
                    notify_on_run_success,
                    notify_on_run_failure,
                    notify_on_job_completion,
                    notify_on_job_success,
                    notify_on_job_failure,
                    follow,
                },
            )
        }

        Command::Status { job_id } => {
            let config = load_config()?;
            gc::spawn_background_gc();
            status::execute(&config, displayer, status::StatusOpts { job_ids: job_id })
        }

        Command::Logs {
            job_id,
            hide_stdout,
            hide_stderr,
            follow,
            no_log_prefix,
            tail,
            since,
            until,
        } => {
            let config = load_config()?;
            gc::spawn_background_gc();
            logs::execute(
                &config,
                displayer,
                logs::LogsOpts {
                    job_id,
                    hide_stdout,
                    hide_stderr,
                    follow,
                    no_log_prefix,
                    tail,
                    since,
                    until,
                },
            )
        }

        Command::Kill {
            job_id,
            signal,
            allow_retries,
            force,
        } => {
            let config = load_config()?;
            gc::spawn_background_gc();
            kill::execute(
                &config,
                displayer,
                kill::KillOpts {
                    job_ids: job_id,
                    signal,
                    allow_retries,
                    force,
                },
            )
        }

        Command::Ls { all } => {
            let config = load_config()?;
            gc::spawn_background_gc();
            ls::execute(&config, displayer, ls::LsOpts { all })
        }

        Command::Purge {
            job_id,
            all,
            metadata,
            since,
            until,
            force,
        } => {
            let config = load_config()?;
            purge::execute(
                &config,
                displayer,
                purge::PurgeOpts {
                    job_ids: job_id,
                    all,
                    metadata,
                    since,
                    until,
                    force,
                },
            )
        }

        Command::Reset { force } => {
            let config = load_config()?;
            reset::execute(&config, displayer, reset::ResetOpts { force })
        }

        Command::InstallCompletions { shell } => completions::execute(displayer, shell),

        Command::Completions { shell } => {
            completions::print_script(&mut Cli::command(), &shell)
        }

        Command::Gc => {
            // Best-effort by contract: a failed sweep is logged, never surfaced.
            let config = load_config()?;
            if let Err(e) = gc::run_gc(&config) {
                tracing::warn!(error = %format!("{e:#}"), "log GC failed");
            }
            Ok(exit_code::OK)
        }
    }
}
