//! Terminal output in the three render modes.
//!
//! Every operation describes its output once as (pretty, plain, json) and the
//! displayer picks the active form. JSON always goes through a single print
//! point so stdout stays one-object-per-report in that mode. Errors render as
//! a one-line `ERROR!` message on stderr, or a `{result, message}` object in
//! JSON mode.

use std::io::{IsTerminal, Write};

use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Pretty,
    Plain,
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct Displayer {
    pub mode: OutputMode,
    pub quiet: bool,
}

impl Displayer {
    pub fn new(mode: OutputMode, quiet: bool) -> Self {
        Displayer { mode, quiet }
    }

    /// Primary result of an operation, on stdout.
    pub fn result(&self, pretty: &str, plain: &str, json: serde_json::Value) {
        match self.mode {
            OutputMode::Pretty => println!("{pretty}"),
            OutputMode::Plain => println!("{plain}"),
            OutputMode::Json => print_json(&json),
        }
    }

    /// Secondary commentary, on stderr. Suppressed by `--quiet` and in JSON
    /// mode (JSON consumers only want the stdout object).
    pub fn note(&self, message: &str) {
        if self.quiet || self.mode == OutputMode::Json {
            return;
        }
        eprintln!("{message}");
    }

    pub fn error(&self, message: &str) {
        match self.mode {
            OutputMode::Json => print_json(&json!({
                "result": "error",
                "message": message,
            })),
            _ => eprintln!("ERROR! {message}"),
        }
    }

    /// Ask before a destructive operation. `force` skips the prompt, and a
    /// non-interactive stdin proceeds so scripts are never wedged on a read.
    pub fn confirm(&self, prompt: &str, force: bool) -> bool {
        if force || !std::io::stdin().is_terminal() {
            return true;
        }
        eprint!("{prompt} [y/N]: ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes" | "YES")
    }
}

fn print_json(value: &serde_json::Value) {
    println!("{value}");
}
