// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # vitals core
//!
//! Config resolution, process sampling and interval reporting for the
//! `vitals-agent` process wrapper.
//!
//! ## Overview
//!
//! ```text
//! CLI args ─▶ ConfigResolver ─▶ IntervalReporter ─▶ SampleSource ─▶ flatten + filter ─▶ MetricsSink
//!                                      ▲
//!               ProcessSupervisor ─────┘  (child pid, or a detached reporter process)
//! ```
//!
//! - [`config`]: `.vitalsrc` discovery, formats, `extends` chains, defaults
//! - [`sample`]: CPU and memory samples of a pid, and pid liveness
//! - [`flatten`]: metric trees to dotted keys and back, inclusion filtering
//! - [`reporter`]: the once-only, cancellable reporting loop
//! - [`sink`]: where flattened metrics go
//! - [`supervisor`]: the instrumented child and the detached reporter
//! - [`register`]: self-instrumentation for embedding applications

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod error;
pub mod flatten;
pub mod logger;
pub mod register;
pub mod reporter;
pub mod sample;
pub mod sink;
pub mod supervisor;
pub mod util;

pub use config::{Config, ConfigResolver};
pub use error::{ConfigError, SampleError, SupervisorError};
pub use reporter::{IntervalReporter, ReporterHandle, ReporterState};
pub use supervisor::ProcessSupervisor;
