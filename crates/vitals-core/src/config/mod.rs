// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolved agent configuration.
//!
//! A [`Config`] is a JSON mapping with the static defaults merged underneath
//! whatever the config files provided. Once built it is never mutated; the
//! reporter and the supervisor share it behind an `Arc`.

pub mod channel;
pub mod resolver;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::{
    error::ConfigError,
    util::{deep_merge, is_truthy},
};

pub use resolver::{ConfigChain, ConfigResolver, CONFIG_FILE_NAMES};

pub const INSTRUMENT: &str = "instrument";
pub const REPORTING_INTERVAL: &str = "reportingInterval";
pub const AGENT: &str = "agent";
pub const EXTENDS: &str = "extends";
pub const INTERPRETER: &str = "interpreter";
pub const REPORTING_ENDPOINT: &str = "reportingEndpoint";
pub const REPORTING_API_VERSION: &str = "reportingAPIVersion";
pub const BUCKET: &str = "bucket";
pub const TOKEN: &str = "token";

pub const DEFAULT_REPORTING_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_REPORTING_API_VERSION: &str = "v0";

/// Baseline tree merged under every resolved config.
///
/// `instrument` enables every metric the sampler produces, so a partial
/// inclusion tree only has to name what it turns off.
pub fn defaults() -> Value {
    json!({
        INSTRUMENT: {
            "cpu": {
                "system": {
                    "count": true,
                    "load": { "1m": true, "5m": true, "15m": true }
                },
                "process": { "utilization": true }
            },
            "memory": {
                "system": { "total": true, "free": true, "utilization": true },
                "process": { "bytes": true, "utilization": true }
            }
        },
        REPORTING_INTERVAL: DEFAULT_REPORTING_INTERVAL_MS,
        AGENT: true,
        REPORTING_API_VERSION: DEFAULT_REPORTING_API_VERSION
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    values: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_defaults(Map::new())
    }
}

impl Config {
    /// Merges `values` over [`defaults`] and validates the result.
    pub fn with_defaults(values: Map<String, Value>) -> Self {
        let mut merged = defaults();
        deep_merge(&mut merged, Value::Object(values));
        let values = match merged {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut config = Self { values };
        config.validate();
        config
    }

    /// The config used when no usable config file exists.
    pub fn disabled() -> Self {
        let mut values = Map::new();
        values.insert(INSTRUMENT.to_string(), Value::Bool(false));
        Self::with_defaults(values)
    }

    /// Builds a config from an arbitrary JSON value, which must be a mapping.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(values) => Ok(Self::with_defaults(values)),
            other => Err(ConfigError::Channel(format!(
                "expected a mapping, found {}",
                type_name(&other)
            ))),
        }
    }

    fn validate(&mut self) {
        let interval = self.values.get(REPORTING_INTERVAL);
        let valid = interval
            .and_then(Value::as_u64)
            .is_some_and(|ms| ms > 0);
        if !valid {
            warn!(
                "Invalid {REPORTING_INTERVAL} {}, using {DEFAULT_REPORTING_INTERVAL_MS}ms",
                interval.map(|v| v.to_string()).unwrap_or_default()
            );
            self.values.insert(
                REPORTING_INTERVAL.to_string(),
                Value::from(DEFAULT_REPORTING_INTERVAL_MS),
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// The inclusion selector: a boolean or a tree of booleans.
    pub fn instrument(&self) -> &Value {
        self.values.get(INSTRUMENT).unwrap_or(&Value::Bool(false))
    }

    pub fn is_instrumented(&self) -> bool {
        is_truthy(self.instrument())
    }

    pub fn reporting_interval(&self) -> Duration {
        Duration::from_millis(
            self.values
                .get(REPORTING_INTERVAL)
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_REPORTING_INTERVAL_MS),
        )
    }

    /// `true` reports from inside the supervisor, `false` from a detached sibling.
    pub fn agent(&self) -> bool {
        self.values.get(AGENT).map_or(true, is_truthy)
    }

    pub fn extends(&self) -> Option<&str> {
        self.str_value(EXTENDS)
    }

    pub fn interpreter(&self) -> Option<&str> {
        self.str_value(INTERPRETER)
    }

    pub fn reporting_endpoint(&self) -> Option<&str> {
        self.str_value(REPORTING_ENDPOINT)
    }

    pub fn reporting_api_version(&self) -> &str {
        self.str_value(REPORTING_API_VERSION)
            .unwrap_or(DEFAULT_REPORTING_API_VERSION)
    }

    pub fn bucket(&self) -> Option<&str> {
        self.str_value(BUCKET)
    }

    pub fn token(&self) -> Option<&str> {
        self.str_value(TOKEN)
    }

    fn str_value(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}
