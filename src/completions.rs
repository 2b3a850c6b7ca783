//! Implementation of the `install-completions` sub-command.
//!
//! Appends a single eval line to the shell's rc file, marked with a sentinel
//! comment so repeated installs stay idempotent. The completion script itself
//! is generated on demand by the hidden `_completions` subcommand, which the
//! installed line evals at shell startup.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap_complete::Shell;
use serde_json::json;
use tracing::info;

use crate::config::expand_user;
use crate::display::Displayer;
use crate::error::{exit_code, JobmanError};

/// Marker comment that makes the install idempotent.
pub const SENTINEL: &str = "managed by jobman install-completions";

#[derive(Debug)]
struct ShellSpec {
    shell: Shell,
    rc_path: PathBuf,
    line: String,
}

fn shell_spec(name: &str) -> Result<ShellSpec, JobmanError> {
    let spec = match name {
        "bash" => ShellSpec {
            shell: Shell::Bash,
            rc_path: expand_user("~/.bashrc".as_ref()),
            line: format!("eval \"$(jobman _completions bash)\"  # {SENTINEL}"),
        },
        "zsh" => ShellSpec {
            shell: Shell::Zsh,
            rc_path: expand_user("~/.zshrc".as_ref()),
            line: format!("eval \"$(jobman _completions zsh)\"  # {SENTINEL}"),
        },
        "fish" => ShellSpec {
            shell: Shell::Fish,
            rc_path: expand_user("~/.config/fish/completions/jobman.fish".as_ref()),
            line: format!("jobman _completions fish | source  # {SENTINEL}"),
        },
        other => {
            return Err(JobmanError::Unavailable(format!(
                "Completions are not supported for the {other} shell"
            )));
        }
    };
    Ok(spec)
}

/// Basename of `$SHELL`, the parent shell of this invocation.
fn infer_shell() -> Result<String, JobmanError> {
    let shell_var = std::env::var("SHELL").map_err(|_| {
        JobmanError::NotFound(
            "Can't infer the parent shell. Specify the shell explicitly.".to_string(),
        )
    })?;
    let name = std::path::Path::new(&shell_var)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(JobmanError::NotFound(
            "Can't infer the parent shell. Specify the shell explicitly.".to_string(),
        ));
    }
    Ok(name)
}

/// Execute `install-completions` for the named (or inferred) shell.
pub fn execute(displayer: &Displayer, shell_name: Option<String>) -> Result<i32> {
    let name = match shell_name {
        Some(name) => name,
        None => infer_shell()?,
    };
    let spec = shell_spec(&name)?;

    let installed = ensure_line(&spec.rc_path, &spec.line)?;
    if installed {
        info!(shell = %name, rc = %spec.rc_path.display(), "completions installed");
        displayer.result(
            &format!("Installed completions for the {name} shell"),
            &format!("Installed completions for the {name} shell"),
            json!({ "result": "success", "shell": name, "installed": true }),
        );
    } else {
        displayer.result(
            &format!("Completions already installed for the {name} shell"),
            &format!("Completions already installed for the {name} shell"),
            json!({ "result": "success", "shell": name, "installed": false }),
        );
    }
    Ok(exit_code::OK)
}

/// Print the generated completion script for the hidden `_completions`
/// subcommand; this is what the installed eval line runs.
pub fn print_script(cmd: &mut clap::Command, shell_name: &str) -> Result<i32> {
    let spec = shell_spec(shell_name)?;
    clap_complete::generate(spec.shell, cmd, "jobman", &mut std::io::stdout());
    Ok(exit_code::OK)
}

/// Append `line` to the file unless the sentinel is already present.
/// Returns whether anything was written.
fn ensure_line(path: &std::path::Path, line: &str) -> Result<bool> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    if existing.contains(SENTINEL) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(true)
}
