//! Error taxonomy and exit-code discipline.
//!
//! Every user-visible failure carries one of the kinds below; `main` downcasts
//! the `anyhow` chain to pick the process exit code. Kinds map onto
//! sysexits-style codes so scripts can branch on the class of failure.

use thiserror::Error;

/// Exit codes, sysexits(3) numbering.
pub mod exit_code {
    pub const OK: i32 = 0;
    /// Malformed arguments, mutually exclusive flags, unparseable duration/time.
    pub const USAGE: i32 = 64;
    /// One or more job ids did not match or were not in the expected state.
    pub const DATAERR: i32 = 65;
    /// The parent shell could not be inferred.
    pub const NOTFOUND: i32 = 66;
    /// Unknown job id in `status`; unsupported shell in `install-completions`.
    pub const UNAVAILABLE: i32 = 69;
    /// Internal failure (store I/O and friends).
    pub const SOFTWARE: i32 = 70;
    /// Fork/detach failure, signal delivery failure.
    pub const OSERR: i32 = 71;
    /// Unreadable/invalid config file, conflicting display flags.
    pub const CONFIG: i32 = 78;
}

/// A classified, user-visible failure.
#[derive(Debug, Error)]
pub enum JobmanError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Os(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    DataErr(String),

    #[error("{0}")]
    Unavailable(String),
}

impl JobmanError {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobmanError::Usage(_) => exit_code::USAGE,
            JobmanError::Config(_) => exit_code::CONFIG,
            JobmanError::Os(_) => exit_code::OSERR,
            JobmanError::NotFound(_) => exit_code::NOTFOUND,
            JobmanError::DataErr(_) => exit_code::DATAERR,
            JobmanError::Unavailable(_) => exit_code::UNAVAILABLE,
        }
    }
}

/// Pick the exit code for an error chain: the first `JobmanError` in the
/// chain decides; anything else is an internal failure.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<JobmanError>()
        .map(JobmanError::exit_code)
        .unwrap_or(exit_code::SOFTWARE)
}
