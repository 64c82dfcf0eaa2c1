// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::PathBuf, sync::Arc};

use clap::{error::ErrorKind, CommandFactory, Parser};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use vitals_core::{
    config::{channel, ConfigResolver},
    logger::{env_filter_directives, Formatter, DEFAULT_LOG_LEVEL, LOG_LEVEL_ENV_VAR},
    supervisor::{agent_bin_from_env, ProcessSupervisor},
};

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Exit code when the instrumented program cannot be started.
const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "vitals-agent",
    about = "Runs a program and reports its CPU and memory usage",
    version
)]
struct Args {
    /// Config file, instead of the first .vitalsrc[.js|.json|.yaml|.yml] in the working directory
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Report on an already running process until it exits
    #[arg(long, value_name = "PID", conflicts_with = "command")]
    pid: Option<u32>,

    /// Detached reporter entry point, started by the agent itself
    #[arg(long = "report-for", value_name = "PID", hide = true, conflicts_with_all = ["command", "pid"])]
    report_for: Option<u32>,

    /// Process whose exit also ends the detached reporter
    #[arg(long, value_name = "PID", hide = true, requires = "report_for")]
    parent: Option<u32>,

    /// Program to run, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();
    if args.command.is_empty() && args.pid.is_none() && args.report_for.is_none() {
        Args::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "a COMMAND to run or a --pid to monitor is required",
            )
            .exit();
    }

    init_logging();
    debug!("Logging subsystem enabled");

    let code = run(args).await;
    std::process::exit(code);
}

fn init_logging() {
    let requested = env::var(LOG_LEVEL_ENV_VAR)
        .map(|val| val.to_lowercase())
        .ok();
    let log_level = match requested.as_deref() {
        Some(level) if LOG_LEVELS.contains(&level) => level,
        _ => DEFAULT_LOG_LEVEL,
    };

    let env_filter = EnvFilter::try_new(env_filter_directives(log_level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .event_format(Formatter::default())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("vitals-agent: unable to install logger: {e}");
        return;
    }

    if let Some(level) = requested.filter(|level| !LOG_LEVELS.contains(&level.as_str())) {
        warn!(
            "Invalid {LOG_LEVEL_ENV_VAR} '{level}'. Must be one of: {}",
            LOG_LEVELS.join(", ")
        );
    }
}

async fn run(args: Args) -> i32 {
    let resolver = ConfigResolver::from_current_dir();

    if let Some(target_pid) = args.report_for {
        // detached reporters get the supervisor's config through the environment
        let config = channel::from_env().unwrap_or_else(|| resolver.resolve(args.config.as_deref()));
        debug!(parent_pid = ?args.parent, "Detached reporter started for pid {target_pid}");
        ProcessSupervisor::new(Arc::new(config), agent_bin_from_env())
            .monitor(target_pid, args.parent)
            .await;
        return 0;
    }

    let config = Arc::new(resolver.resolve(args.config.as_deref()));
    let agent_bin = env::current_exe().unwrap_or_else(|_| agent_bin_from_env());
    let supervisor = ProcessSupervisor::new(config, agent_bin);

    if args.command.is_empty() {
        if let Some(pid) = args.pid {
            supervisor.monitor(pid, None).await;
        }
        return 0;
    }

    let argv: Vec<String> = env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    match supervisor.spawn_instrumented(&argv, &args.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            SPAWN_FAILURE_EXIT_CODE
        }
    }
}
