// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Custom tracing formatter for agent logs.
//!
//! Agent output shares stderr with the wrapped program, so every line carries
//! a clock time and the agent label:
//!
//! ```text
//! [HH:MM:SS] vitals-agent | LEVEL | [span{fields}: ]message fields
//! ```
//!
//! ```text
//! [14:02:11] vitals-agent | WARN | No config file found in /srv/app. Starting without instrumentation.
//! [14:02:11] vitals-agent | DEBUG | Spawned detached reporter reporter_pid=4312 target_pid=4311
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    time::{FormatTime, SystemTime},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const DEFAULT_LABEL: &str = "vitals-agent";

/// Log level used when `VITALS_LOG_LEVEL` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

pub const LOG_LEVEL_ENV_VAR: &str = "VITALS_LOG_LEVEL";

/// Filter directives for a log level, with chatty HTTP internals silenced.
pub fn env_filter_directives(log_level: &str) -> String {
    format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}")
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    label: &'static str,
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(DEFAULT_LABEL)
    }
}

impl Formatter {
    pub fn new(label: &'static str) -> Self {
        Self { label }
    }
}

/// `HH:MM:SS` (UTC) out of the RFC 3339 system time.
fn clock_time() -> String {
    let mut rfc3339 = String::new();
    if SystemTime
        .format_time(&mut format::Writer::new(&mut rfc3339))
        .is_err()
    {
        return "--:--:--".to_string();
    }
    rfc3339
        .get(11..19)
        .map_or_else(|| "--:--:--".to_string(), str::to_string)
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            &mut writer,
            "[{}] {} | {} | ",
            clock_time(),
            self.label,
            metadata.level()
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
