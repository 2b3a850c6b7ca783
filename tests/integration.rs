//! Integration tests for the jobman commands.
//!
//! Each test runs the compiled binary against an isolated storage root
//! (via `JOBMAN_CONFIG_HOME`) and validates the end-to-end contract:
//! stdout in JSON mode is a single object, exit codes follow the taxonomy,
//! and the supervisor drives detached jobs to the expected terminal state.

use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

/// Path to the compiled binary.
fn binary() -> PathBuf {
    // Prefer the current exe's directory (works inside cargo test).
    let mut p = std::env::current_exe().expect("current exe");
    p.pop(); // remove test binary name
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("jobman");
    p
}

/// How long to poll for detached supervisors before declaring a test failure.
const DEADLINE: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(100);

/// Test harness owning an isolated config + storage directory.
struct TestHarness {
    tmp: tempfile::TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let config_home = tmp.path().join("config");
        std::fs::create_dir_all(&config_home).expect("create config home");
        let storage = tmp.path().join("storage");
        std::fs::write(
            config_home.join("config.yml"),
            format!("storage_path: {}\n", storage.display()),
        )
        .expect("write config.yml");
        TestHarness { tmp }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    fn cmd(&self, args: &[&str]) -> Output {
        Command::new(binary())
            .args(args)
            .env("JOBMAN_CONFIG_HOME", self.tmp.path().join("config"))
            .output()
            .expect("run binary")
    }

    /// Run with `-j` appended and parse stdout as a single JSON object.
    fn json(&self, args: &[&str]) -> (serde_json::Value, i32) {
        let mut full: Vec<&str> = args.to_vec();
        full.push("-j");
        let output = self.cmd(&full);
        parse_json(&output, args)
    }

    /// Submit a job and return its id. `-j` goes before the command tokens so
    /// it is not swallowed into the trailing command.
    fn submit(&self, args: &[&str]) -> String {
        let mut full = vec!["run", "-j"];
        full.extend_from_slice(args);
        let output = self.cmd(&full);
        let (value, code) = parse_json(&output, args);
        assert_eq!(code, 0, "run failed: {value}");
        value["job_id"].as_str().expect("job_id in response").to_string()
    }

    /// Fetch the job object (with runs) from `status -j`.
    fn job(&self, id: &str) -> serde_json::Value {
        let (value, _) = self.json(&["status", id]);
        value["jobs"][0].clone()
    }

    /// Poll until the job reaches the given state; panics at the deadline.
    fn wait_state(&self, id: &str, state: &str) -> serde_json::Value {
        let start = Instant::now();
        loop {
            let job = self.job(id);
            if job["state"] == state {
                return job;
            }
            if start.elapsed() > DEADLINE {
                panic!("job {id} never reached {state}; last: {job}");
            }
            std::thread::sleep(POLL);
        }
    }

    /// Poll until some run of the job is Running with a pid.
    fn wait_running_run(&self, id: &str) -> serde_json::Value {
        let start = Instant::now();
        loop {
            let job = self.job(id);
            if let Some(run) = job["runs"]
                .as_array()
                .and_then(|runs| {
                    runs.iter()
                        .find(|r| r["state"] == "Running" && !r["pid"].is_null())
                })
            {
                return run.clone();
            }
            if start.elapsed() > DEADLINE {
                panic!("job {id} never had a running run; last: {job}");
            }
            std::thread::sleep(POLL);
        }
    }
}

fn parse_json(output: &Output, args: &[&str]) -> (serde_json::Value, i32) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout is not a single JSON object: {e}\nstdout: {stdout}\nstderr: {}\nargs: {args:?}",
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (value, output.status.code().expect("exit code"))
}

fn assert_hex_id(id: &str) {
    assert_eq!(id.len(), 8, "job id '{id}' is not 8 chars");
    assert!(
        id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
        "job id '{id}' is not lowercase hex"
    );
}

// ---------- Happy path ----------

#[test]
fn run_prints_hex_id_and_drives_job_to_completion() {
    let h = TestHarness::new();
    let id = h.submit(&["echo", "hi"]);
    assert_hex_id(&id);

    let job = h.wait_state(&id, "Complete");
    assert_eq!(job["exit_code"], 0);

    let runs = job["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1, "expected exactly one run: {job}");
    assert_eq!(runs[0]["state"], "Complete");
    assert_eq!(runs[0]["exit_code"], 0);
    assert_eq!(runs[0]["killed"], false);

    let log_path = PathBuf::from(runs[0]["log_path"].as_str().unwrap());
    let out = std::fs::read_to_string(log_path.join("out.txt")).unwrap();
    assert_eq!(out, "hi\n");
}

#[test]
fn child_sees_job_env_vars() {
    let h = TestHarness::new();
    let id = h.submit(&["echo \"$JOBMAN_JOB_ID:$JOBMAN_ATTEMPT_NUM\""]);
    let job = h.wait_state(&id, "Complete");

    let log_path = PathBuf::from(job["runs"][0]["log_path"].as_str().unwrap());
    let out = std::fs::read_to_string(log_path.join("out.txt")).unwrap();
    assert_eq!(out.trim(), format!("{id}:0"));
}

#[test]
fn plain_mode_prints_bare_id() {
    let h = TestHarness::new();
    let output = h.cmd(&["run", "-p", "true"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_hex_id(stdout.trim());
}

// ---------- Retry policy ----------

#[test]
fn failed_attempts_retry_until_success() {
    let h = TestHarness::new();
    let marker = h.path("marker");
    let cmd = format!(
        "if [ -f {m} ]; then exit 0; else touch {m}; exit 1; fi",
        m = marker.display()
    );
    let id = h.submit(&["--retry-attempts", "2", &cmd]);

    let job = h.wait_state(&id, "Complete");
    assert_eq!(job["exit_code"], 0);

    let runs = job["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 2, "first run fails, second succeeds: {job}");
    assert_eq!(runs[0]["exit_code"], 1);
    assert_eq!(runs[1]["exit_code"], 0);
}

#[test]
fn zero_retry_attempts_means_one_run() {
    let h = TestHarness::new();
    let id = h.submit(&["false"]);
    let job = h.wait_state(&id, "Complete");
    assert_eq!(job["runs"].as_array().unwrap().len(), 1);
    assert_eq!(job["exit_code"], 1);
}

#[test]
fn custom_success_code_stops_retries() {
    let h = TestHarness::new();
    let id = h.submit(&["--retry-attempts", "3", "-c", "7", "exit 7"]);
    let job = h.wait_state(&id, "Complete");
    assert_eq!(job["exit_code"], 7);
    assert_eq!(job["runs"].as_array().unwrap().len(), 1);
}

// ---------- Wait gate ----------

#[test]
fn wait_for_file_gates_the_first_run() {
    let h = TestHarness::new();
    let flag = h.path("go");
    let id = h.submit(&["--wait-for-file", flag.to_str().unwrap(), "echo", "hi"]);

    // While gated the job stays Submitted with no runs.
    std::thread::sleep(Duration::from_millis(600));
    let gated = h.job(&id);
    assert_eq!(gated["state"], "Submitted", "job ran before the gate: {gated}");
    assert!(gated["runs"].as_array().unwrap().is_empty());

    std::fs::write(&flag, b"").unwrap();
    let job = h.wait_state(&id, "Complete");
    assert_eq!(job["exit_code"], 0);
}

// ---------- Abort policy ----------

#[test]
fn abort_duration_signals_the_run_without_marking_it_killed() {
    let h = TestHarness::new();
    let id = h.submit(&["--abort-duration", "1s", "sleep", "30"]);

    let job = h.wait_state(&id, "Complete");
    let run = &job["runs"][0];
    // SIGINT death surfaces as 128 + 2.
    assert_eq!(run["exit_code"], 130, "unexpected exit: {job}");
    assert_eq!(run["killed"], false);
    assert_eq!(job["exit_code"], 130);
}

// ---------- Kill ----------

#[test]
fn kill_marks_the_run_killed_and_blocks_retries() {
    let h = TestHarness::new();
    let id = h.submit(&["--retry-attempts", "5", "sleep", "60"]);
    h.wait_running_run(&id);

    let (report, code) = h.json(&["kill", &id]);
    assert_eq!(code, 0, "kill failed: {report}");
    assert_eq!(report["killed_runs"].as_array().unwrap().len(), 1);

    let job = h.wait_state(&id, "Complete");
    let runs = job["runs"].as_array().unwrap();
    assert_eq!(runs.len(), 1, "retries ran after kill: {job}");
    assert_eq!(runs[0]["killed"], true);
}

#[test]
fn kill_reports_nonexistent_and_nonrunning_jobs() {
    let h = TestHarness::new();
    let done = h.submit(&["true"]);
    h.wait_state(&done, "Complete");

    let (report, code) = h.json(&["kill", &done, "deadbeef"]);
    assert_eq!(code, 65);
    assert_eq!(report["result"], "error");
    assert_eq!(report["nonrunning_job_ids"][0], done);
    assert_eq!(report["nonexistent_job_ids"][0], "deadbeef");
    assert!(report["killed_runs"].as_array().unwrap().is_empty());
}

// ---------- ls ----------

#[test]
fn ls_hides_complete_jobs_unless_all() {
    let h = TestHarness::new();
    let done = h.submit(&["true"]);
    h.wait_state(&done, "Complete");
    let running = h.submit(&["sleep", "60"]);
    h.wait_running_run(&running);

    let (active, _) = h.json(&["ls"]);
    let ids: Vec<&str> = active["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["job_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&running.as_str()));
    assert!(!ids.contains(&done.as_str()));

    let (all, _) = h.json(&["ls", "-a"]);
    let ids: Vec<&str> = all["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["job_id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&running.as_str()));
    assert!(ids.contains(&done.as_str()));

    let _ = h.cmd(&["kill", &running, "-f"]);
}

// ---------- status ----------

#[test]
fn status_unknown_job_exits_unavailable() {
    let h = TestHarness::new();
    let (report, code) = h.json(&["status", "deadbeef"]);
    assert_eq!(code, 69);
    assert_eq!(report["result"], "error");
    assert_eq!(report["missing"][0], "deadbeef");
}

// ---------- logs ----------

#[test]
fn logs_renders_streams_with_prefixes_and_tail() {
    let h = TestHarness::new();
    let id = h.submit(&["printf 'a\\nb\\nc\\n'; echo oops >&2"]);
    h.wait_state(&id, "Complete");

    let (value, code) = h.json(&["logs", &id]);
    assert_eq!(code, 0);
    let run = &value["runs"][0];
    assert_eq!(run["stdout"], serde_json::json!(["a", "b", "c"]));
    assert_eq!(run["stderr"], serde_json::json!(["oops"]));

    let (tailed, _) = h.json(&["logs", &id, "-n", "1", "-e"]);
    assert_eq!(tailed["runs"][0]["stdout"], serde_json::json!(["c"]));
    assert!(tailed["runs"][0]["stderr"].as_array().unwrap().is_empty());

    let plain = h.cmd(&["logs", &id, "-p", "-e"]);
    let stdout = String::from_utf8_lossy(&plain.stdout);
    assert!(stdout.contains("out | a"), "missing prefix: {stdout}");

    let bare = h.cmd(&["logs", &id, "-p", "-e", "-x"]);
    let stdout = String::from_utf8_lossy(&bare.stdout);
    assert!(stdout.starts_with("a\n"), "prefix not suppressed: {stdout}");
}

#[test]
fn logs_unknown_job_exits_unavailable() {
    let h = TestHarness::new();
    let output = h.cmd(&["logs", "deadbeef"]);
    assert_eq!(output.status.code(), Some(69));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR!"), "stderr: {stderr}");
}

#[test]
fn run_follow_tails_output_to_the_terminal() {
    let h = TestHarness::new();
    let output = h.cmd(&["run", "-p", "-f", "echo", "hi"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    assert_hex_id(lines.next().expect("id line"));
    assert!(
        stdout.contains("out | hi"),
        "follow output missing: {stdout}"
    );
}

// ---------- purge ----------

#[test]
fn purge_partial_reports_sets_and_exits_dataerr() {
    let h = TestHarness::new();
    let a = h.submit(&["true"]);
    h.wait_state(&a, "Complete");
    let b = h.submit(&["sleep", "60"]);
    h.wait_running_run(&b);

    let (report, code) = h.json(&["purge", &a, &b, "-m"]);
    assert_eq!(code, 65);
    assert_eq!(report["purged"], serde_json::json!([a.clone()]));
    assert_eq!(report["skipped"], serde_json::json!([b.clone()]));
    assert_eq!(report["nonexistent"], serde_json::json!([]));

    // A's metadata and logs are gone; B is untouched.
    let (missing, code) = h.json(&["status", &a]);
    assert_eq!(code, 69, "purged job still present: {missing}");
    let (still, _) = h.json(&["status", &b]);
    assert_eq!(still["jobs"][0]["job_id"], b);

    let _ = h.cmd(&["kill", &b, "-f"]);
}

#[test]
fn purge_requires_ids_xor_all() {
    let h = TestHarness::new();
    let neither = h.cmd(&["purge"]);
    assert_eq!(neither.status.code(), Some(64));

    let both = h.cmd(&["purge", "deadbeef", "-a"]);
    assert_eq!(both.status.code(), Some(64));
}

// ---------- reset ----------

#[test]
fn reset_wipes_all_jobs() {
    let h = TestHarness::new();
    let id = h.submit(&["true"]);
    h.wait_state(&id, "Complete");

    let output = h.cmd(&["reset", "-f"]);
    assert_eq!(output.status.code(), Some(0));

    let (report, code) = h.json(&["status", &id]);
    assert_eq!(code, 69, "job survived reset: {report}");
}

// ---------- notifications ----------

#[test]
fn file_sink_receives_job_lifecycle_events() {
    let h = TestHarness::new();
    let events = h.path("events.jsonl");
    // Rewrite the config to add the sink (storage_path line is regenerated).
    let storage = h.path("storage");
    std::fs::write(
        h.path("config").join("config.yml"),
        format!(
            "storage_path: {}\n\
             notification_sinks:\n\
             - name: audit\n\
             \x20 kind: file\n\
             \x20 path: {}\n",
            storage.display(),
            events.display()
        ),
    )
    .unwrap();

    let id = h.submit(&[
        "--notify-on-run-completion",
        "audit",
        "--notify-on-job-completion",
        "audit",
        "--notify-on-job-success",
        "audit",
        "true",
    ]);
    h.wait_state(&id, "Complete");

    let start = Instant::now();
    let kinds = loop {
        let raw = std::fs::read_to_string(&events).unwrap_or_default();
        let kinds: Vec<String> = raw
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        if kinds.len() >= 3 || start.elapsed() > DEADLINE {
            break kinds;
        }
        std::thread::sleep(POLL);
    };
    assert_eq!(kinds, vec!["run_completion", "job_completion", "job_success"]);
}

// ---------- CLI discipline ----------

#[test]
fn bad_duration_is_a_usage_error() {
    let h = TestHarness::new();
    let output = h.cmd(&["run", "--retry-delay", "3h4h", "true"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn json_and_plain_conflict_is_a_config_error() {
    let h = TestHarness::new();
    let output = h.cmd(&["ls", "-j", "-p"]);
    assert_eq!(output.status.code(), Some(78));
}

#[test]
fn out_of_range_success_code_is_a_usage_error() {
    let h = TestHarness::new();
    let output = h.cmd(&["run", "-c", "300", "true"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn stdout_is_a_single_json_object_in_json_mode() {
    let h = TestHarness::new();
    let id = h.submit(&["true"]);
    h.wait_state(&id, "Complete");

    for args in [vec!["ls"], vec!["status", id.as_str()], vec!["logs", id.as_str()]] {
        let mut full = args.clone();
        full.push("-j");
        let output = h.cmd(&full);
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str::<serde_json::Value>(stdout.trim()).unwrap_or_else(|e| {
            panic!("{args:?} stdout is not one JSON object: {e}\n{stdout}")
        });
    }
}

// ---------- completions ----------

#[test]
fn install_completions_is_idempotent() {
    let h = TestHarness::new();
    let home = h.path("home");
    std::fs::create_dir_all(&home).unwrap();

    for _ in 0..2 {
        let output = Command::new(binary())
            .args(["install-completions", "bash"])
            .env("JOBMAN_CONFIG_HOME", h.path("config"))
            .env("HOME", &home)
            .output()
            .expect("run binary");
        assert_eq!(output.status.code(), Some(0));
    }

    let rc = std::fs::read_to_string(home.join(".bashrc")).unwrap();
    assert_eq!(
        rc.matches("managed by jobman install-completions").count(),
        1
    );
}

#[test]
fn unsupported_shell_exits_unavailable() {
    let h = TestHarness::new();
    let output = h.cmd(&["install-completions", "tcsh"]);
    assert_eq!(output.status.code(), Some(69));
}
