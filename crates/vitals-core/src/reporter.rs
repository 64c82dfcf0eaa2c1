// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The recurring sample-and-report loop.
//!
//! # State Machine
//!
//! ```text
//! Unregistered ──register──▶ Scheduled ──▶ Sampling ──▶ Reporting ──▶ Scheduled ...
//!                                │             │
//!                                └─────────────┴──▶ Stopped   (stop(), or should_continue() == false)
//! ```
//!
//! A reporter accepts exactly one registration. Every later call to
//! [`IntervalReporter::register`] is a no-op, whatever its arguments, so
//! code paths that may run more than once in a process never produce two
//! report streams.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::Config,
    flatten::{filter_instrumented, flatten, DEFAULT_DELIMITER},
    sample::{ProcfsSource, SampleSource},
    sink::{sink_for, MetricsSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterState {
    Unregistered,
    /// Waiting for the next tick.
    Scheduled,
    Sampling,
    Reporting,
    Stopped,
}

/// The default `should_continue` predicate.
pub fn always() -> bool {
    true
}

pub struct IntervalReporter {
    registered: AtomicBool,
    source: Arc<dyn SampleSource>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl IntervalReporter {
    pub fn new(source: Arc<dyn SampleSource>) -> Self {
        Self {
            registered: AtomicBool::new(false),
            source,
            sink: None,
        }
    }

    /// Reports to `sink` instead of the sink described by the registered config.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Starts reporting on `pid` every `reportingInterval`.
    ///
    /// Returns `None` when this reporter was already registered, when the
    /// config disables instrumentation, or outside a tokio runtime. The first
    /// call consumes the registration in all cases.
    pub fn register<F>(&self, pid: u32, config: Arc<Config>, should_continue: F) -> Option<ReporterHandle>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Interval reporting already registered, ignoring");
            return None;
        }

        if !config.is_instrumented() {
            debug!("Instrumentation disabled, not reporting");
            return None;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Unable to schedule interval reporting: {e}");
                return None;
            }
        };

        let sink = self.sink.clone().unwrap_or_else(|| sink_for(&config));
        let (state_tx, state_rx) = watch::channel(ReporterState::Scheduled);
        let cancel = CancellationToken::new();

        debug!(
            "Reporting on pid {pid} every {}ms",
            config.reporting_interval().as_millis()
        );
        let task = runtime.spawn(run(
            ReportLoop {
                pid,
                config,
                source: Arc::clone(&self.source),
                sink,
                state: state_tx,
                cancel: cancel.clone(),
            },
            should_continue,
        ));

        Some(ReporterHandle {
            state: state_rx,
            cancel,
            task,
        })
    }
}

/// The process-wide reporter, sampling from `/proc`.
pub fn global() -> &'static IntervalReporter {
    static GLOBAL: OnceLock<IntervalReporter> = OnceLock::new();
    GLOBAL.get_or_init(|| IntervalReporter::new(Arc::new(ProcfsSource::default())))
}

struct ReportLoop {
    pid: u32,
    config: Arc<Config>,
    source: Arc<dyn SampleSource>,
    sink: Arc<dyn MetricsSink>,
    state: watch::Sender<ReporterState>,
    cancel: CancellationToken,
}

async fn run<F>(ctx: ReportLoop, should_continue: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let interval = ctx.config.reporting_interval();

    loop {
        ctx.state.send_replace(ReporterState::Sampling);
        let sample = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            sample = ctx.source.sample(ctx.pid) => sample,
        };

        match sample {
            Ok(sample) => {
                let metrics = filter_instrumented(
                    flatten(&sample.to_tree(), DEFAULT_DELIMITER),
                    ctx.config.instrument(),
                    DEFAULT_DELIMITER,
                );
                ctx.state.send_replace(ReporterState::Reporting);
                ctx.sink.report(metrics);
            }
            Err(e) => warn!("Skipping report for pid {}: {e}", ctx.pid),
        }

        ctx.state.send_replace(ReporterState::Scheduled);
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        if !should_continue() {
            debug!("Stopping interval reporting on pid {}", ctx.pid);
            break;
        }
    }

    ctx.state.send_replace(ReporterState::Stopped);
}

/// Control over a registered reporting loop.
#[derive(Debug)]
pub struct ReporterHandle {
    state: watch::Receiver<ReporterState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    pub fn state(&self) -> ReporterState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ReporterState> {
        self.state.clone()
    }

    /// Stops the loop, interrupting a pending suspension or sample.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the loop to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Interval reporting task failed: {e}");
        }
    }
}
