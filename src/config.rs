//! Configuration loading.
//!
//! The config file lives at `$JOBMAN_CONFIG_HOME/config.yml` (falling back to
//! `~/.config/jobman/config.yml`). A missing file yields the defaults;
//! unknown keys are rejected so typos fail loudly instead of silently doing
//! nothing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use directories::BaseDirs;
use serde::Deserialize;

use crate::error::JobmanError;

pub const CONFIG_HOME_ENV: &str = "JOBMAN_CONFIG_HOME";

/// One named notification sink. Callbacks in a job's `notify_on_*` lists are
/// resolved against these by name.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: SinkKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkKind {
    /// Payload JSON is piped to `sh -c <command>` on stdin.
    Command { command: String },
    /// Payload JSON is appended to the file, one line per event.
    File { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobmanConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_gc_expiry_days")]
    pub gc_expiry_days: f64,
    #[serde(default)]
    pub notification_sinks: Vec<SinkSpec>,
}

impl Default for JobmanConfig {
    fn default() -> Self {
        JobmanConfig {
            storage_path: default_storage_path(),
            gc_expiry_days: default_gc_expiry_days(),
            notification_sinks: Vec::new(),
        }
    }
}

impl JobmanConfig {
    /// The embedded relational store file (plus its WAL/SHM side files).
    pub fn db_path(&self) -> PathBuf {
        self.storage_path.join("db")
    }

    /// Root of the per-job, per-attempt log directories.
    pub fn stdio_path(&self) -> PathBuf {
        self.storage_path.join("stdio")
    }

    pub fn gc_expiry(&self) -> Duration {
        Duration::from_secs_f64((self.gc_expiry_days * 86_400.0).max(0.0))
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("~/.local/share/jobman")
}

fn default_gc_expiry_days() -> f64 {
    7.0
}

/// Directory holding `config.yml`.
pub fn config_home() -> PathBuf {
    match std::env::var(CONFIG_HOME_ENV) {
        Ok(dir) if !dir.is_empty() => expand_user(Path::new(&dir)),
        _ => expand_user(Path::new("~/.config/jobman")),
    }
}

/// Read and validate the config file; a missing file is the default config.
pub fn load_config() -> Result<JobmanConfig> {
    let path = config_home().join("config.yml");
    load_config_file(&path)
}

pub fn load_config_file(path: &Path) -> Result<JobmanConfig> {
    let mut config = if path.is_file() {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            JobmanError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str::<JobmanConfig>(&raw).map_err(|e| {
            JobmanError::Config(format!("Invalid config file at {}: {e}", path.display()))
        })?
    } else {
        JobmanConfig::default()
    };

    config.storage_path = expand_user(&config.storage_path);
    Ok(config)
}

/// Expand a leading `~` to the home directory, the way the caller's shell
/// would have. Stored paths keep the expanded form.
pub fn expand_user(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" || s.starts_with("~/") {
        if let Some(base) = BaseDirs::new() {
            let home = base.home_dir();
            return if s == "~" {
                home.to_path_buf()
            } else {
                home.join(&s[2..])
            };
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_file(&dir.path().join("config.yml")).unwrap();
        assert!(config.storage_path.ends_with(".local/share/jobman"));
        assert_eq!(config.gc_expiry_days, 7.0);
        assert!(config.notification_sinks.is_empty());
    }

    #[test]
    fn recognized_keys_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "storage_path: /tmp/jm\n\
             gc_expiry_days: 3\n\
             notification_sinks:\n\
             - name: audit\n\
             \x20 kind: file\n\
             \x20 path: /tmp/audit.jsonl\n\
             - name: hook\n\
             \x20 kind: command\n\
             \x20 command: cat > /dev/null\n"
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("/tmp/jm"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/jm/db"));
        assert_eq!(config.stdio_path(), PathBuf::from("/tmp/jm/stdio"));
        assert_eq!(config.gc_expiry(), Duration::from_secs(3 * 86_400));
        assert_eq!(config.notification_sinks.len(), 2);
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "storge_path: /tmp/oops\n").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(err.downcast_ref::<JobmanError>().is_some());
    }

    #[test]
    fn tilde_expands() {
        let expanded = expand_user(Path::new("~/x"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("x"));

        let absolute = expand_user(Path::new("/opt/x"));
        assert_eq!(absolute, PathBuf::from("/opt/x"));
    }
}
