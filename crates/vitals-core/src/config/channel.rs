// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hands the resolved config to processes spawned by the agent.
//!
//! The payload is the JSON form of [`Config`]. It is private to a single
//! installation of the agent: both ends are always the same build, so the
//! format is not versioned.

use std::env;

use tracing::warn;

use super::Config;
use crate::error::ConfigError;

/// Carries the JSON-serialized config.
pub const CONFIG_ENV_VAR: &str = "__VITALS_AGENT_CONFIG_JSON";

/// Set to `1` in the environment of an instrumented child.
pub const SUPERVISED_ENV_VAR: &str = "__VITALS_AGENT_SUPERVISED";

pub fn serialize(config: &Config) -> Result<String, ConfigError> {
    serde_json::to_string(config).map_err(|e| ConfigError::Channel(e.to_string()))
}

pub fn deserialize(payload: &str) -> Result<Config, ConfigError> {
    let value = serde_json::from_str(payload).map_err(|e| ConfigError::Channel(e.to_string()))?;
    Config::from_value(value)
}

/// The config handed down by a parent process, if any.
///
/// A present but corrupt payload is logged and ignored.
pub fn from_env() -> Option<Config> {
    let payload = env::var(CONFIG_ENV_VAR).ok()?;
    match deserialize(&payload) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Ignoring {CONFIG_ENV_VAR}: {e}");
            None
        }
    }
}

/// Exposes `config` to this process and everything it spawns later.
///
/// This writes the process environment, so it must run before other threads
/// start: `std::env::set_var` races with concurrent environment reads.
pub fn export(config: &Config) -> Result<(), ConfigError> {
    let payload = serialize(config)?;
    env::set_var(CONFIG_ENV_VAR, payload);
    Ok(())
}

pub fn is_supervised() -> bool {
    env::var(SUPERVISED_ENV_VAR).is_ok_and(|v| v == "1")
}
