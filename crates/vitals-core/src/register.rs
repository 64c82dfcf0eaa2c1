// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-instrumentation for applications embedding the library.
//!
//! ```rust,ignore
//! fn main() {
//!     let _vitals = vitals_core::register::register();
//!     // ... the application; the detached reporter is killed when `_vitals` drops
//! }
//! ```
//!
//! When the application already runs under `vitals-agent` the supervisor
//! reports on it, and registering only picks up the handed-down config.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{debug, warn};

use crate::{
    config::{channel, ConfigResolver},
    supervisor::{agent_bin_from_env, DetachedReporter, ProcessSupervisor},
};

/// Outcome of a registration.
#[derive(Debug)]
pub enum Registration {
    /// A detached reporter monitors this process until the value is dropped.
    Reporting(DetachedReporter),
    /// The supervising `vitals-agent` reports on this process.
    Supervised,
    /// Instrumentation is off, or the reporter could not be started.
    Disabled,
    /// An earlier registration in this process already took effect.
    AlreadyRegistered,
}

impl Registration {
    pub fn reporter_pid(&self) -> Option<u32> {
        match self {
            Registration::Reporting(reporter) => reporter.id(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registrar {
    registered: AtomicBool,
}

impl Registrar {
    pub const fn new() -> Self {
        Self {
            registered: AtomicBool::new(false),
        }
    }

    pub fn register(&self, resolver: &ConfigResolver, agent_bin: PathBuf) -> Registration {
        if self.registered.swap(true, Ordering::AcqRel) {
            debug!("vitals already registered in this process");
            return Registration::AlreadyRegistered;
        }

        let config = match channel::from_env() {
            Some(handed_down) => handed_down,
            None => {
                let config = resolver.resolve(None);
                if let Err(e) = channel::export(&config) {
                    warn!("Unable to expose vitals config: {e}");
                }
                config
            }
        };

        if channel::is_supervised() {
            debug!("Running under vitals-agent, reporting is handled by the supervisor");
            return Registration::Supervised;
        }
        if !config.is_instrumented() {
            return Registration::Disabled;
        }

        let supervisor = ProcessSupervisor::new(Arc::new(config), agent_bin);
        match supervisor.spawn_detached_reporter(std::process::id()) {
            Some(reporter) => Registration::Reporting(reporter),
            None => Registration::Disabled,
        }
    }
}

static REGISTRAR: Registrar = Registrar::new();

/// Instruments the current process, at most once.
///
/// The detached reporter binary comes from `VITALS_AGENT_BIN`, defaulting to
/// `vitals-agent` on `PATH`.
///
/// Call it first thing in `main`, before any other thread starts: without a
/// handed-down config it writes the resolved one to the process environment,
/// and environment writes race with reads from other threads.
pub fn register() -> Registration {
    REGISTRAR.register(&ConfigResolver::from_current_dir(), agent_bin_from_env())
}
