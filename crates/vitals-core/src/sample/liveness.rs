// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use tracing::trace;

/// Whether `pid` names a running process.
///
/// Sends the null signal, which performs the permission and existence checks
/// without delivering anything. A process owned by another user (`EPERM`)
/// still counts as alive. Zombies have exited and do not.
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // 0 and negative pids address process groups
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(errno) => {
            trace!("pid {pid} is not alive: {errno}");
            false
        }
    }
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].split_whitespace().next())
        .is_some_and(|state| matches!(state, "Z" | "X"))
}

/// A `shouldContinue` predicate for the reporter that holds while `pid` lives.
pub fn liveness_probe(pid: u32) -> impl Fn() -> bool + Send + Sync + 'static {
    move || is_alive(pid)
}
