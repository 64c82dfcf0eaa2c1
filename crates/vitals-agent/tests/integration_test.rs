// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
    thread::sleep,
    time::{Duration, Instant},
};

use mockito::Server;
use serde_json::json;
use vitals_core::{config::channel::CONFIG_ENV_VAR, sample::is_alive};

const AGENT: &str = env!("CARGO_BIN_EXE_vitals-agent");

fn write_config(dir: &Path, values: serde_json::Value) -> PathBuf {
    let path = dir.join(".vitalsrc.json");
    std::fs::write(&path, values.to_string()).expect("failed to write config");
    path
}

fn agent(dir: &Path) -> Command {
    let mut command = Command::new(AGENT);
    command
        .current_dir(dir)
        .env_remove(CONFIG_ENV_VAR)
        .env_remove("__VITALS_AGENT_SUPERVISED");
    command
}

fn run(command: &mut Command) -> Output {
    command.output().expect("failed to run vitals-agent")
}

/// The pid logged as `key=<pid>` on a debug line.
fn logged_pid(line: &str, key: &str) -> Option<u32> {
    line.split(&format!("{key}="))
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|pid| pid.parse().ok())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    done()
}

#[test]
fn test_exit_code_passthrough() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), json!({ "reportingInterval": 50 }));

    let output = run(agent(dir.path()).args(["sh", "-c", "exit 10"]));
    assert_eq!(output.status.code(), Some(10));
}

#[test]
fn test_exit_code_without_config() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(agent(dir.path())
        .env("VITALS_LOG_LEVEL", "warn")
        .args(["sh", "-c", "exit 3"]));
    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Starting without instrumentation"), "{stderr}");
}

#[test]
fn test_signal_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(agent(dir.path()).args(["sh", "-c", "kill -TERM $$"]));
    assert_eq!(output.status.code(), Some(128 + 15));
}

#[test]
fn test_missing_program_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(agent(dir.path()).arg("/nonexistent/program"));
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_no_arguments_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&mut agent(dir.path()));
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_reports_while_child_runs() {
    let mut server = Server::new();
    let mock = server
        .mock("POST", "/v0/bucket/abc/index")
        .match_header("Authorization", "Bearer secret")
        .with_status(200)
        .expect_at_least(2)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        json!({
            "reportingEndpoint": server.url(),
            "bucket": "abc",
            "token": "secret",
            "reportingInterval": 1
        }),
    );

    let output = run(agent(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["sleep", "1"]));
    assert_eq!(output.status.code(), Some(0));
    mock.assert();
}

#[test]
fn test_child_reads_config_channel() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), json!({ "bucket": "from-file", "instrument": false }));

    let output = run(agent(dir.path()).args([
        "sh",
        "-c",
        r#"echo "$__VITALS_AGENT_CONFIG_JSON""#,
    ]));
    assert_eq!(output.status.code(), Some(0));
    let handed_down: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("child prints the config");
    assert_eq!(handed_down["bucket"], json!("from-file"));
    assert_eq!(handed_down["instrument"], json!(false));
}

#[cfg(target_os = "linux")]
#[test]
fn test_detached_reporter_does_not_outlive_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), json!({ "agent": false, "reportingInterval": 1 }));

    let output = run(agent(dir.path())
        .env("VITALS_LOG_LEVEL", "debug")
        .args(["sleep", "1"]));
    assert_eq!(output.status.code(), Some(0));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains('\x1b'), "{stderr:?}");
    let reporter_pid = stderr
        .lines()
        .find_map(|line| logged_pid(line, "reporter_pid"))
        .unwrap_or_else(|| panic!("no reporter pid logged:\n{stderr}"));

    assert!(
        wait_until(Duration::from_secs(10), || !is_alive(reporter_pid)),
        "detached reporter {reporter_pid} is still running"
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_detached_reporter_exits_when_supervisor_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    write_config(dir.path(), json!({ "agent": false, "reportingInterval": 1 }));

    let mut supervisor = agent(dir.path())
        .env("VITALS_LOG_LEVEL", "debug")
        .args(["sleep", "25"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut child_pid = None;
    let mut reporter_pid = None;
    let stderr = BufReader::new(supervisor.stderr.take().unwrap());
    for line in stderr.lines() {
        let line = line.unwrap();
        child_pid = child_pid.or_else(|| logged_pid(&line, "child_pid"));
        reporter_pid = reporter_pid.or_else(|| logged_pid(&line, "reporter_pid"));
        if child_pid.is_some() && reporter_pid.is_some() {
            break;
        }
    }
    let child_pid = child_pid.expect("no child pid logged");
    let reporter_pid = reporter_pid.expect("no reporter pid logged");

    // SIGKILL: the supervisor gets no chance to terminate the reporter
    supervisor.kill().unwrap();
    supervisor.wait().unwrap();

    let reporter_gone = wait_until(Duration::from_secs(10), || !is_alive(reporter_pid));
    let child_alive = is_alive(child_pid);
    let _ = Command::new("kill").arg(child_pid.to_string()).status();

    assert!(child_alive, "the orphaned child should keep running");
    assert!(
        reporter_gone,
        "detached reporter {reporter_pid} outlived its killed supervisor"
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_detached_reporter_exits_with_its_target() {
    let mut target = Command::new("sleep").arg("30").spawn().unwrap();
    let target_pid = target.id();

    let dir = tempfile::tempdir().unwrap();
    let mut reporter = agent(dir.path())
        .env(
            CONFIG_ENV_VAR,
            json!({ "instrument": true, "reportingInterval": 20 }).to_string(),
        )
        .args(["--report-for", &target_pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    sleep(Duration::from_millis(300));
    assert!(
        reporter.try_wait().unwrap().is_none(),
        "reporter exited while its target was alive"
    );

    target.kill().unwrap();
    target.wait().unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || reporter
            .try_wait()
            .unwrap()
            .is_some()),
        "reporter kept running after its target exited"
    );
}
