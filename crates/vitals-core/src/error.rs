// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors that can occur while loading a config file or one of its `extends` parents
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No config file found in {0}")]
    NotFound(PathBuf),

    #[error("Unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Config file {0} must contain a mapping at the top level")]
    NotAMapping(PathBuf),

    #[error("Config file {0} extends itself")]
    SelfExtension(PathBuf),

    #[error("Config file {target} is already part of the extends chain: {chain}")]
    Cycle { target: PathBuf, chain: String },

    #[error("Unable to locate extended config {reference:?} from {from}")]
    ExtendsNotFound { reference: String, from: PathBuf },

    #[error("Invalid config channel payload: {0}")]
    Channel(String),
}

/// Errors returned by a [`crate::sample::SampleSource`]
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("Missing pid")]
    MissingPid,

    #[error("Process {0} not found")]
    ProcessNotFound(u32),

    #[error("Unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Errors that can occur when supervising the instrumented process
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("No command given to instrument")]
    EmptyCommand,

    #[error("Instrumented process already spawned")]
    AlreadySpawned,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for instrumented process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Failed to serialize config for child process: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SampleError::MissingPid;
        assert_eq!(error.to_string(), "Missing pid");

        let error = ConfigError::SelfExtension(PathBuf::from("/tmp/.vitalsrc"));
        assert_eq!(error.to_string(), "Config file /tmp/.vitalsrc extends itself");
    }

    #[test]
    fn test_error_debug() {
        let error = SupervisorError::EmptyCommand;
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("EmptyCommand"));
    }

    #[test]
    fn test_source_is_preserved() {
        let error = SupervisorError::Spawn {
            program: "does-not-exist".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let source = std::error::Error::source(&error).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("no such file"));
        assert!(error.to_string().starts_with("Failed to spawn does-not-exist"));
    }
}
