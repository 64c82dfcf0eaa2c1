// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CPU time accounting in clock ticks.
//!
//! `/proc/<pid>/stat` counts the CPU time of a process in clock ticks
//! (USER_HZ), usually 100 per second. Process utilization is the tick delta
//! between two reads of that file, converted to CPU seconds:
//!
//! ```text
//! cpu_seconds = (end_ticks - start_ticks) / CLK_TCK
//! ```

use std::path::PathBuf;

use nix::unistd::{sysconf, SysconfVar};

use crate::error::SampleError;

const CLK_TCK_SOURCE: &str = "sysconf(CLK_TCK)";

/// Clock ticks per second of this host.
#[allow(clippy::cast_sign_loss)]
pub fn clock_ticks_per_second() -> Result<u64, SampleError> {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => Ok(ticks as u64),
        Ok(_) => Err(SampleError::Malformed {
            path: PathBuf::from(CLK_TCK_SOURCE),
            reason: "no positive clock tick rate".to_string(),
        }),
        Err(errno) => Err(SampleError::Io {
            path: PathBuf::from(CLK_TCK_SOURCE),
            source: errno.into(),
        }),
    }
}

/// CPU seconds between two tick counters. A counter that went backwards counts as idle.
pub fn ticks_to_secs(start: u64, end: u64, ticks_per_second: u64) -> f64 {
    end.saturating_sub(start) as f64 / ticks_per_second.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_ticks_per_second_is_positive() {
        assert!(clock_ticks_per_second().unwrap() > 0);
    }

    #[test]
    fn test_ticks_to_secs() {
        assert_eq!(ticks_to_secs(100, 350, 100), 2.5);
        assert_eq!(ticks_to_secs(350, 100, 100), 0.0);
        assert_eq!(ticks_to_secs(0, 0, 250), 0.0);
    }
}
