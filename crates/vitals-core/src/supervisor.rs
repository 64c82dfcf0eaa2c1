// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the instrumented program and the processes reporting on it.
//!
//! # Process Layout
//!
//! ```text
//! agent = true                      agent = false
//!
//! vitals-agent ── reporter task     vitals-agent
//!   └── child                         ├── child
//!                                     └── vitals-agent --report-for <child pid> --parent <agent pid>
//!                                                                                 (own process group)
//! ```
//!
//! The child inherits stdio and receives the resolved config through the
//! environment channel. The supervisor exits with the child's exit code, and
//! kills the detached reporter first. A supervisor that dies without cleaning
//! up (SIGKILL, crash) leaves the reporter running only until it notices the
//! parent pid is gone, within [`PARENT_POLL_INTERVAL`].

use std::{
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    process::Child,
    signal::unix::{signal, SignalKind},
    sync::{watch, OnceCell},
};
use tracing::{debug, warn};

use crate::{
    config::{
        channel::{self, CONFIG_ENV_VAR, SUPERVISED_ENV_VAR},
        Config,
    },
    error::SupervisorError,
    reporter::{self, IntervalReporter, ReporterState},
    sample::{is_alive, liveness_probe},
};

/// Overrides the agent binary spawned as a detached reporter.
pub const AGENT_BIN_ENV_VAR: &str = "VITALS_AGENT_BIN";
pub const DEFAULT_AGENT_BIN: &str = "vitals-agent";

/// Hidden flag selecting the detached reporter entry point of the agent binary.
pub const REPORT_FOR_FLAG: &str = "--report-for";

/// Hidden flag naming the process whose death ends a detached reporter.
pub const PARENT_FLAG: &str = "--parent";

/// How often a detached reporter checks that its parent is still alive.
pub const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exit status base for children terminated by a signal, as shells report them.
const SIGNAL_EXIT_BASE: i32 = 128;

/// The agent binary named by [`AGENT_BIN_ENV_VAR`], else [`DEFAULT_AGENT_BIN`] on `PATH`.
pub fn agent_bin_from_env() -> PathBuf {
    std::env::var_os(AGENT_BIN_ENV_VAR)
        .filter(|bin| !bin.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_AGENT_BIN), PathBuf::from)
}

/// Program and arguments of the instrumented child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Slices the child's argument list out of the agent's own `argv`.
///
/// `command` is the trailing sub-command isolated by the CLI, so the child's
/// arguments are the last `command.len()` entries of `argv` (never the
/// program name). When `argv` does not end with `command` it is used as is.
pub fn child_args(argv: &[String], command: &[String]) -> Result<Vec<String>, SupervisorError> {
    if command.is_empty() {
        return Err(SupervisorError::EmptyCommand);
    }
    let args = match argv.len().checked_sub(command.len()) {
        Some(start) if start > 0 && argv[start..] == *command => argv[start..].to_vec(),
        _ => command.to_vec(),
    };
    Ok(args)
}

/// Builds the child command, running it through `interpreter` when one is set.
///
/// A leading token naming the interpreter itself (`node app.js` with
/// interpreter `node`) is dropped so the interpreter is not passed its own
/// name as a script.
pub fn child_command(args: Vec<String>, interpreter: Option<&str>) -> Result<ChildCommand, SupervisorError> {
    let mut args = args.into_iter();
    match interpreter {
        Some(interpreter) => {
            let mut rest: Vec<String> = args.collect();
            if rest
                .first()
                .is_some_and(|first| same_program(first, interpreter))
            {
                rest.remove(0);
            }
            Ok(ChildCommand {
                program: interpreter.to_string(),
                args: rest,
            })
        }
        None => {
            let program = args.next().ok_or(SupervisorError::EmptyCommand)?;
            Ok(ChildCommand {
                program,
                args: args.collect(),
            })
        }
    }
}

fn same_program(token: &str, interpreter: &str) -> bool {
    fn stem(path: &str) -> &str {
        let name = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(path);
        name.strip_suffix(".exe").unwrap_or(name)
    }
    !token.is_empty() && stem(token) == stem(interpreter)
}

/// The shell convention: the exit code, or `128 + signal` when killed.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => SIGNAL_EXIT_BASE + signal,
        (None, None) => 1,
    }
}

/// Owning guard of a detached reporter process.
///
/// The process is killed and reaped on [`DetachedReporter::terminate`] or drop.
#[derive(Debug)]
pub struct DetachedReporter {
    child: Option<std::process::Child>,
}

impl DetachedReporter {
    pub(crate) fn from_child(child: std::process::Child) -> Self {
        Self { child: Some(child) }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(std::process::Child::id)
    }

    /// Kills and reaps the reporter, blocking until it is gone.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        kill_reporter(&mut child);
        log_reaped(child.id(), child.wait());
    }

    /// Kills the reporter and reaps it on the blocking pool.
    pub async fn shutdown(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        kill_reporter(&mut child);
        let pid = child.id();
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(reaped) => log_reaped(pid, reaped),
            Err(e) => warn!("Unable to reap detached reporter {pid}: {e}"),
        }
    }
}

fn kill_reporter(child: &mut std::process::Child) {
    if let Err(e) = child.kill() {
        debug!("Detached reporter {} already gone: {e}", child.id());
    }
}

fn log_reaped(pid: u32, reaped: std::io::Result<ExitStatus>) {
    match reaped {
        Ok(status) => debug!("Detached reporter {pid} exited: {status}"),
        Err(e) => warn!("Unable to reap detached reporter {pid}: {e}"),
    }
}

impl Drop for DetachedReporter {
    fn drop(&mut self) {
        self.terminate();
    }
}

pub struct ProcessSupervisor {
    config: Arc<Config>,
    agent_bin: PathBuf,
    reporter: &'static IntervalReporter,
    child_spawned: AtomicBool,
    child_exit: OnceCell<i32>,
    reporter_spawned: AtomicBool,
}

impl ProcessSupervisor {
    /// `agent_bin` is the executable started with [`REPORT_FOR_FLAG`] for detached reporting.
    pub fn new(config: Arc<Config>, agent_bin: impl Into<PathBuf>) -> Self {
        Self {
            config,
            agent_bin: agent_bin.into(),
            reporter: reporter::global(),
            child_spawned: AtomicBool::new(false),
            child_exit: OnceCell::new(),
            reporter_spawned: AtomicBool::new(false),
        }
    }

    /// Reports in-process through `reporter` instead of the global one.
    pub fn with_reporter(mut self, reporter: &'static IntervalReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Runs the instrumented child to completion and returns its exit code.
    ///
    /// The child runs once per supervisor: later calls wait for the first run
    /// and return its exit code. A child that failed to spawn is not retried,
    /// later calls get [`SupervisorError::AlreadySpawned`].
    pub async fn spawn_instrumented(
        &self,
        argv: &[String],
        command: &[String],
    ) -> Result<i32, SupervisorError> {
        self.child_exit
            .get_or_try_init(|| self.run_instrumented(argv, command))
            .await
            .copied()
    }

    async fn run_instrumented(
        &self,
        argv: &[String],
        command: &[String],
    ) -> Result<i32, SupervisorError> {
        if self.child_spawned.swap(true, Ordering::AcqRel) {
            return Err(SupervisorError::AlreadySpawned);
        }

        let ChildCommand { program, args } =
            child_command(child_args(argv, command)?, self.config.interpreter())?;
        let payload =
            channel::serialize(&self.config).map_err(|e| SupervisorError::Channel(e.to_string()))?;

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .env(CONFIG_ENV_VAR, payload)
            .env(SUPERVISED_ENV_VAR, "1")
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id().unwrap_or_default();
        debug!(child_pid = pid, "Spawned {program}");

        let mut detached = None;
        let handle = if self.config.agent() {
            self.reporter
                .register(pid, Arc::clone(&self.config), liveness_probe(pid))
        } else {
            detached = self.spawn_detached_reporter(pid);
            None
        };

        let status = wait_forwarding_signals(&mut child).await;

        if let Some(handle) = handle {
            handle.stop();
        }
        if let Some(detached) = detached {
            detached.shutdown().await;
        }

        let code = exit_code(status?);
        debug!("Child process {pid} exited with code {code}");
        Ok(code)
    }

    /// Starts a sibling `vitals-agent --report-for <target_pid> --parent <own pid>`
    /// in its own process group.
    ///
    /// The sibling stops once either pid is gone. Failures are logged and
    /// yield `None`; the monitored program runs on without instrumentation.
    pub fn spawn_detached_reporter(&self, target_pid: u32) -> Option<DetachedReporter> {
        if self.reporter_spawned.swap(true, Ordering::AcqRel) {
            debug!("Detached reporter already spawned, ignoring");
            return None;
        }
        if !self.config.is_instrumented() {
            debug!("Instrumentation disabled, no detached reporter");
            return None;
        }

        let payload = match channel::serialize(&self.config) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unable to hand config to detached reporter: {e}");
                return None;
            }
        };

        let spawned = std::process::Command::new(&self.agent_bin)
            .arg(REPORT_FOR_FLAG)
            .arg(target_pid.to_string())
            .arg(PARENT_FLAG)
            .arg(std::process::id().to_string())
            .env(CONFIG_ENV_VAR, payload)
            .env_remove(SUPERVISED_ENV_VAR)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();

        match spawned {
            Ok(child) => {
                debug!(
                    reporter_pid = child.id(),
                    target_pid, "Spawned detached reporter"
                );
                Some(DetachedReporter::from_child(child))
            }
            Err(e) => {
                warn!(
                    "Unable to spawn detached reporter {}: {e}. Continuing without instrumentation.",
                    self.agent_bin.display()
                );
                None
            }
        }
    }

    /// Reports on an already running process until it exits, or until
    /// `parent_pid` exits when one is given.
    pub async fn monitor(&self, target_pid: u32, parent_pid: Option<u32>) {
        if !is_alive(target_pid) {
            warn!("Process {target_pid} is not running, nothing to monitor");
            return;
        }
        if let Some(parent) = parent_pid.filter(|&parent| !is_alive(parent)) {
            debug!("Parent process {parent} is gone, not monitoring pid {target_pid}");
            return;
        }

        let target_alive = liveness_probe(target_pid);
        let should_continue = move || target_alive() && parent_pid.map_or(true, is_alive);
        let Some(handle) =
            self.reporter
                .register(target_pid, Arc::clone(&self.config), should_continue)
        else {
            debug!("No interval reporting for pid {target_pid}");
            return;
        };

        if let Some(parent) = parent_pid {
            let mut state = handle.state_receiver();
            tokio::select! {
                () = parent_exit(parent) => {
                    debug!("Parent process {parent} exited, stopping reporting on pid {target_pid}");
                    handle.stop();
                }
                () = stopped(&mut state) => {}
            }
        }
        handle.join().await;
    }
}

async fn stopped(state: &mut watch::Receiver<ReporterState>) {
    // a dropped sender means the loop is over as well
    let _ = state
        .wait_for(|state| *state == ReporterState::Stopped)
        .await;
}

/// Resolves once `pid` is no longer alive.
async fn parent_exit(pid: u32) {
    while is_alive(pid) {
        tokio::time::sleep(PARENT_POLL_INTERVAL).await;
    }
}

async fn wait_forwarding_signals(child: &mut Child) -> Result<ExitStatus, SupervisorError> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Wait)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Wait)?;

    loop {
        tokio::select! {
            status = child.wait() => return status.map_err(SupervisorError::Wait),
            Some(()) = sigint.recv() => forward_signal(child, Signal::SIGINT),
            Some(()) = sigterm.recv() => forward_signal(child, Signal::SIGTERM),
        }
    }
}

fn forward_signal(child: &Child, signal: Signal) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    debug!("Forwarding {signal} to child process {pid}");
    if let Err(e) = kill(Pid::from_raw(pid), signal) {
        warn!("Unable to forward {signal} to child process {pid}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ProcfsSource;
    use serde_json::json;
    use std::process::Command;

    fn strings(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    fn supervisor(values: serde_json::Value) -> ProcessSupervisor {
        let config = Arc::new(Config::from_value(values).unwrap());
        let reporter: &'static IntervalReporter = Box::leak(Box::new(IntervalReporter::new(
            Arc::new(ProcfsSource::default()),
        )));
        ProcessSupervisor::new(config, "/nonexistent/vitals-agent").with_reporter(reporter)
    }

    #[test]
    fn test_child_args_from_argv() {
        let argv = strings(&["vitals-agent", "-c", ".vitalsrc", "node", "app.js", "-c", "x"]);
        let command = strings(&["node", "app.js", "-c", "x"]);
        assert_eq!(
            child_args(&argv, &command).unwrap(),
            strings(&["node", "app.js", "-c", "x"])
        );
    }

    #[test]
    fn test_child_args_skips_program_name() {
        let argv = strings(&["sh", "sh", "-c", "exit 0"]);
        let command = strings(&["sh", "-c", "exit 0"]);
        assert_eq!(child_args(&argv, &command).unwrap(), command);
    }

    #[test]
    fn test_child_args_ignores_option_values_naming_the_program() {
        // vitals-agent -c sh sh -c 'exit 3'
        let argv = strings(&["vitals-agent", "-c", "sh", "sh", "-c", "exit 3"]);
        let command = strings(&["sh", "-c", "exit 3"]);
        assert_eq!(child_args(&argv, &command).unwrap(), command);
    }

    #[test]
    fn test_child_args_falls_back_to_command() {
        let argv = strings(&["vitals-agent"]);
        let command = strings(&["echo", "hi"]);
        assert_eq!(child_args(&argv, &command).unwrap(), command);
        assert!(matches!(
            child_args(&argv, &[]),
            Err(SupervisorError::EmptyCommand)
        ));
    }

    #[test]
    fn test_interpreter_token_is_stripped() {
        for token in ["node", "/usr/local/bin/node", "node.exe", "C:/nodejs/node.exe"] {
            let command = child_command(strings(&[token, "app.js", "--port", "3000"]), Some("node"))
                .unwrap();
            assert_eq!(
                command,
                ChildCommand {
                    program: "node".to_string(),
                    args: strings(&["app.js", "--port", "3000"]),
                },
                "{token}"
            );
        }
    }

    #[test]
    fn test_other_binaries_are_kept() {
        let command = child_command(strings(&["nodemon", "app.js"]), Some("node")).unwrap();
        assert_eq!(command.args, strings(&["nodemon", "app.js"]));

        let command = child_command(strings(&["node", "app.js"]), None).unwrap();
        assert_eq!(command.program, "node");
        assert_eq!(command.args, strings(&["app.js"]));
    }

    #[test]
    fn test_exit_code_mapping() {
        let status = Command::new("sh").args(["-c", "exit 10"]).status().unwrap();
        assert_eq!(exit_code(status), 10);

        let status = Command::new("sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }

    #[test]
    fn test_detached_reporter_guard_kills_on_drop() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let guard = DetachedReporter::from_child(child);
        assert_eq!(guard.id(), Some(pid));
        assert!(is_alive(pid));
        drop(guard);
        assert!(!is_alive(pid));
    }

    #[test]
    fn test_detached_reporter_terminate_is_idempotent() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut guard = DetachedReporter::from_child(child);
        guard.terminate();
        assert_eq!(guard.id(), None);
        guard.terminate();
    }

    #[tokio::test]
    async fn test_detached_reporter_shutdown_reaps() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        DetachedReporter::from_child(child).shutdown().await;
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_spawn_instrumented_passes_exit_code() {
        let supervisor = supervisor(json!({ "instrument": false }));
        let command = strings(&["sh", "-c", "exit 7"]);
        assert_eq!(supervisor.spawn_instrumented(&[], &command).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_spawn_instrumented_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let supervisor = supervisor(json!({ "instrument": false }));
        let command = strings(&[
            "sh",
            "-c",
            &format!("echo run >> '{}'; exit 7", runs.display()),
        ]);

        assert_eq!(supervisor.spawn_instrumented(&[], &command).await.unwrap(), 7);
        assert_eq!(supervisor.spawn_instrumented(&[], &command).await.unwrap(), 7);
        assert_eq!(std::fs::read_to_string(&runs).unwrap(), "run\n");
    }

    #[tokio::test]
    async fn test_failed_spawn_is_not_retried() {
        let supervisor = supervisor(json!({ "instrument": false }));
        let command = strings(&["/nonexistent/program"]);
        assert!(matches!(
            supervisor.spawn_instrumented(&[], &command).await,
            Err(SupervisorError::Spawn { .. })
        ));
        assert!(matches!(
            supervisor.spawn_instrumented(&[], &command).await,
            Err(SupervisorError::AlreadySpawned)
        ));
    }

    #[tokio::test]
    async fn test_child_receives_config_channel() {
        let supervisor = supervisor(json!({ "instrument": false, "bucket": "abc" }));
        let command = strings(&[
            "sh",
            "-c",
            r#"test "$__VITALS_AGENT_SUPERVISED" = 1 && echo "$__VITALS_AGENT_CONFIG_JSON" | grep -q '"bucket":"abc"'"#,
        ]);
        assert_eq!(supervisor.spawn_instrumented(&[], &command).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let supervisor = supervisor(json!({ "instrument": false }));
        let command = strings(&["/nonexistent/program"]);
        assert!(matches!(
            supervisor.spawn_instrumented(&[], &command).await,
            Err(SupervisorError::Spawn { .. })
        ));
    }

    #[test]
    fn test_detached_spawn_failure_is_graceful() {
        let supervisor = supervisor(json!({ "agent": false }));
        assert!(supervisor.spawn_detached_reporter(std::process::id()).is_none());
        // latched even though the first attempt failed
        assert!(supervisor.spawn_detached_reporter(std::process::id()).is_none());
    }

    #[tokio::test]
    async fn test_monitor_dead_process_returns() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let supervisor = supervisor(json!({ "reportingInterval": 1 }));
        tokio::time::timeout(std::time::Duration::from_secs(5), supervisor.monitor(pid, None))
            .await
            .expect("monitor of a dead pid returns");
    }

    #[tokio::test]
    async fn test_monitor_returns_when_target_exits() {
        let mut child = Command::new("sleep").arg("0.3").spawn().unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());
        let supervisor = supervisor(json!({ "reportingInterval": 10 }));
        tokio::time::timeout(std::time::Duration::from_secs(10), supervisor.monitor(pid, None))
            .await
            .expect("monitor stops once the target exits");
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_monitor_stops_when_parent_exits() {
        let mut parent = Command::new("sleep").arg("0.3").spawn().unwrap();
        let parent_pid = parent.id();
        let reaper = std::thread::spawn(move || parent.wait());
        // the target outlives the test; only the parent going away ends monitoring
        let supervisor = supervisor(json!({ "reportingInterval": 60_000 }));
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervisor.monitor(std::process::id(), Some(parent_pid)),
        )
        .await
        .expect("monitor stops once the parent exits");
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_monitor_with_dead_parent_returns() {
        let mut parent = Command::new("true").spawn().unwrap();
        let parent_pid = parent.id();
        parent.wait().unwrap();
        let supervisor = supervisor(json!({ "reportingInterval": 60_000 }));
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervisor.monitor(std::process::id(), Some(parent_pid)),
        )
        .await
        .expect("monitor with a dead parent returns");
    }
}
