// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Point-in-time CPU and memory samples for a process.
//!
//! The [`SampleSource`] trait is the only thing the reporter depends on;
//! [`procfs::ProcfsSource`] is the Linux implementation reading `/proc`.
//!
//! # Sample Shape
//!
//! ```text
//! cpu:
//!   system:  { count, load: { 1m, 5m, 15m } }
//!   process: { utilization }
//! memory:
//!   system:  { total, free, utilization }
//!   process: { bytes, utilization }
//! ```
//!
//! Utilizations are ratios in `[0, 1]` rounded to four digits. Process CPU
//! utilization is relative to the capacity of every core on the host.

pub mod clock;
pub mod liveness;
pub mod procfs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SampleError;

pub use liveness::{is_alive, liveness_probe};
pub use procfs::ProcfsSource;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    #[serde(rename = "1m")]
    pub one: f64,
    #[serde(rename = "5m")]
    pub five: f64,
    #[serde(rename = "15m")]
    pub fifteen: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuSystem {
    pub count: usize,
    pub load: LoadAverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuProcess {
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuSample {
    pub system: CpuSystem,
    pub process: CpuProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySystem {
    pub total: u64,
    pub free: u64,
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryProcess {
    pub bytes: u64,
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub system: MemorySystem,
    pub process: MemoryProcess,
}

/// Everything sampled in one reporting tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub cpu: CpuSample,
    pub memory: MemorySample,
}

impl SampleResult {
    /// The sample as a nested JSON tree, ready to be flattened.
    pub fn to_tree(&self) -> Value {
        // numeric-only structs; non-finite floats serialize as null
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Capability to sample a process by pid.
///
/// Implementations must reject pid `0` with [`SampleError::MissingPid`].
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn cpu(&self, pid: u32) -> Result<CpuSample, SampleError>;

    async fn memory(&self, pid: u32) -> Result<MemorySample, SampleError>;

    async fn sample(&self, pid: u32) -> Result<SampleResult, SampleError> {
        let cpu = self.cpu(pid).await?;
        let memory = self.memory(pid).await?;
        Ok(SampleResult { cpu, memory })
    }
}
