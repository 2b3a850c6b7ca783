//! Implementation of the `reset` sub-command.
//!
//! Destroys the store file (including WAL/SHM side files) and every log
//! directory, then recreates an empty schema.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::config::JobmanConfig;
use crate::display::Displayer;
use crate::error::exit_code;
use crate::store::Store;

/// Options for the `reset` sub-command.
#[derive(Debug, Default)]
pub struct ResetOpts {
    pub force: bool,
}

/// Execute `reset`: confirm, wipe, recreate.
pub fn execute(config: &JobmanConfig, displayer: &Displayer, opts: ResetOpts) -> Result<i32> {
    if !displayer.confirm(
        "Resetting will permanently delete all job history and logs. Continue?",
        opts.force,
    ) {
        displayer.note("Reset aborted");
        return Ok(exit_code::OK);
    }

    reset(config)?;

    displayer.result(
        "Reset database to factory settings",
        "Reset database to factory settings",
        json!({
            "result": "success",
            "message": "Reset database to factory settings",
        }),
    );
    Ok(exit_code::OK)
}

/// Delete the store and logs, then recreate the schema.
pub fn reset(config: &JobmanConfig) -> Result<()> {
    let db_path = config.db_path();
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.clone().into_os_string();
        path.push(suffix);
        let path = std::path::PathBuf::from(path);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("delete {}", path.display())),
        }
    }
    warn!(db = %db_path.display(), "store deleted");

    let stdio = config.stdio_path();
    match std::fs::remove_dir_all(&stdio) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("delete log root {}", stdio.display())),
    }
    std::fs::create_dir_all(&stdio)
        .with_context(|| format!("recreate log root {}", stdio.display()))?;
    warn!(stdio = %stdio.display(), "log directories deleted");

    // Reopening recreates the schema.
    drop(Store::open(&db_path)?);
    info!(db = %db_path.display(), "store recreated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host;
    use crate::model::test_job;

    #[test]
    fn reset_wipes_jobs_and_logs_and_recreates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobmanConfig::default();
        config.storage_path = dir.path().to_path_buf();

        {
            let store = Store::open(&config.db_path()).unwrap();
            let mut job = test_job();
            job.host_id = host::host_id();
            store.insert_job(&job).unwrap();
        }
        std::fs::create_dir_all(config.stdio_path().join("a1b2c3d4").join("0")).unwrap();

        reset(&config).unwrap();

        let store = Store::open(&config.db_path()).unwrap();
        assert!(store
            .job(&host::host_id(), "a1b2c3d4")
            .unwrap()
            .is_none());
        assert!(config.stdio_path().exists());
        assert!(!config.stdio_path().join("a1b2c3d4").exists());
    }

    #[test]
    fn reset_on_empty_storage_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JobmanConfig::default();
        config.storage_path = dir.path().join("nested").join("deeper");

        reset(&config).unwrap();
        assert!(config.db_path().exists());
    }
}
