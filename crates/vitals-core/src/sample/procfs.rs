// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `/proc` backed [`SampleSource`].
//!
//! # Files Read
//!
//! ```text
//! /proc/
//!   ├── loadavg             # 1, 5 and 15 minute load averages
//!   ├── meminfo             # MemTotal / MemAvailable (kB)
//!   └── <pid>/
//!       ├── stat            # utime / stime in clock ticks (fields 14, 15)
//!       └── status          # VmRSS (kB)
//! ```
//!
//! The root is configurable so tests can point it at a fixture directory.

use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::trace;

use super::{
    clock, CpuProcess, CpuSample, CpuSystem, LoadAverage, MemoryProcess, MemorySample,
    MemorySystem, SampleSource,
};
use crate::{error::SampleError, util::round};

pub const PROC_PATH: &str = "/proc";

/// Width of the window between the two CPU time readings of a sample.
pub const DEFAULT_CPU_WINDOW: Duration = Duration::from_millis(100);

const UTILIZATION_PRECISION: u32 = 4;

#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
    cpu_window: Duration,
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::new(PROC_PATH, DEFAULT_CPU_WINDOW)
    }
}

impl ProcfsSource {
    pub fn new(root: impl Into<PathBuf>, cpu_window: Duration) -> Self {
        Self {
            root: root.into(),
            cpu_window,
        }
    }

    fn read(&self, path: &Path) -> Result<String, SampleError> {
        std::fs::read_to_string(path).map_err(|source| SampleError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_process_file(&self, pid: u32, name: &str) -> Result<String, SampleError> {
        let path = self.root.join(pid.to_string()).join(name);
        std::fs::read_to_string(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SampleError::ProcessNotFound(pid),
            _ => SampleError::Io { path, source },
        })
    }

    fn load_average(&self) -> Result<LoadAverage, SampleError> {
        let path = self.root.join("loadavg");
        let contents = self.read(&path)?;
        let mut values = contents
            .split_whitespace()
            .map(|v| v.parse::<f64>().ok());
        match (values.next(), values.next(), values.next()) {
            (Some(Some(one)), Some(Some(five)), Some(Some(fifteen))) => Ok(LoadAverage {
                one: round(one, UTILIZATION_PRECISION),
                five: round(five, UTILIZATION_PRECISION),
                fifteen: round(fifteen, UTILIZATION_PRECISION),
            }),
            _ => Err(SampleError::Malformed {
                path,
                reason: "expected three load averages".to_string(),
            }),
        }
    }

    /// Returns `(total, available)` in bytes.
    fn system_memory(&self) -> Result<(u64, u64), SampleError> {
        let path = self.root.join("meminfo");
        let contents = self.read(&path)?;

        let total = kilobyte_field(&contents, "MemTotal:");
        // MemAvailable is missing on kernels older than 3.14
        let available =
            kilobyte_field(&contents, "MemAvailable:").or_else(|| kilobyte_field(&contents, "MemFree:"));

        match (total, available) {
            (Some(total), Some(available)) if total > 0 => Ok((total, available)),
            _ => Err(SampleError::Malformed {
                path,
                reason: "missing MemTotal or MemAvailable".to_string(),
            }),
        }
    }

    fn process_rss(&self, pid: u32) -> Result<u64, SampleError> {
        let contents = self.read_process_file(pid, "status")?;
        // kernel threads have no VmRSS line
        Ok(kilobyte_field(&contents, "VmRSS:").unwrap_or(0))
    }

    /// Total user + system CPU time of a process, in clock ticks.
    fn process_ticks(&self, pid: u32) -> Result<u64, SampleError> {
        let contents = self.read_process_file(pid, "stat")?;
        let malformed = || SampleError::Malformed {
            path: self.root.join(pid.to_string()).join("stat"),
            reason: "unexpected stat layout".to_string(),
        };

        // the command name can contain spaces and parentheses, fields start after the last ')'
        let fields_start = contents.rfind(')').ok_or_else(malformed)? + 1;
        let fields: Vec<&str> = contents[fields_start..].split_whitespace().collect();

        // fields[0] is field 3 (state); utime and stime are fields 14 and 15
        let utime = fields.get(11).and_then(|v| v.parse::<u64>().ok());
        let stime = fields.get(12).and_then(|v| v.parse::<u64>().ok());
        match (utime, stime) {
            (Some(utime), Some(stime)) => Ok(utime + stime),
            _ => Err(malformed()),
        }
    }
}

fn kilobyte_field(contents: &str, label: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(label))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn check_pid(pid: u32) -> Result<(), SampleError> {
    if pid == 0 {
        return Err(SampleError::MissingPid);
    }
    Ok(())
}

#[async_trait]
impl SampleSource for ProcfsSource {
    async fn cpu(&self, pid: u32) -> Result<CpuSample, SampleError> {
        check_pid(pid)?;

        let count = num_cpus::get();
        let load = self.load_average()?;

        let start_ticks = self.process_ticks(pid)?;
        let started = Instant::now();
        tokio::time::sleep(self.cpu_window).await;
        let end_ticks = self.process_ticks(pid)?;
        let elapsed = started.elapsed().as_secs_f64();

        let busy_secs =
            clock::ticks_to_secs(start_ticks, end_ticks, clock::clock_ticks_per_second()?);
        let capacity_secs = elapsed * count as f64;
        let utilization = if capacity_secs > 0.0 {
            round((busy_secs / capacity_secs).min(1.0), UTILIZATION_PRECISION)
        } else {
            0.0
        };
        trace!("pid {pid}: {busy_secs}s busy over {elapsed}s on {count} cpus");

        Ok(CpuSample {
            system: CpuSystem { count, load },
            process: CpuProcess { utilization },
        })
    }

    async fn memory(&self, pid: u32) -> Result<MemorySample, SampleError> {
        check_pid(pid)?;

        let (total, free) = self.system_memory()?;
        let bytes = self.process_rss(pid)?;

        Ok(MemorySample {
            system: MemorySystem {
                total,
                free,
                utilization: round(1.0 - free as f64 / total as f64, UTILIZATION_PRECISION),
            },
            process: MemoryProcess {
                bytes,
                utilization: round(bytes as f64 / total as f64, UTILIZATION_PRECISION),
            },
        })
    }
}
