// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process statistics for supervision and status snapshots.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::{Error, Result};
use crate::worker::WorkerProcess;

/// Resource usage of one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    pub pid: u32,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Source of per-process resource usage.
///
/// Failures are not fatal for the pool: the supervisor skips the worker for
/// the current tick.
pub trait StatsProvider: Send + Sync {
    fn stats(&self, pid: u32) -> Result<ProcessStats>;
}

/// [`StatsProvider`] backed by the operating system.
pub struct SystemStats {
    system: Mutex<System>,
}

impl SystemStats {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsProvider for SystemStats {
    fn stats(&self, pid: u32) -> Result<ProcessStats> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| Error::StatsUnavailable(pid))?;
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let process = system
            .process(sys_pid)
            .ok_or(Error::StatsUnavailable(pid))?;
        Ok(ProcessStats {
            pid,
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

/// Serializable worker snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessState {
    pub pid: u32,
    pub status: String,
    pub num_execs: u64,
    pub created: DateTime<Utc>,
    pub memory_usage: u64,
    pub cpu_percent: f32,
}

impl ProcessState {
    /// Snapshot a worker. Missing stats are reported as zero.
    pub fn capture(worker: &WorkerProcess, stats: &dyn StatsProvider) -> Self {
        let pid = worker.pid().unwrap_or_default();
        let usage = worker.pid().and_then(|pid| stats.stats(pid).ok());
        Self {
            pid,
            status: worker.status().to_string(),
            num_execs: worker.num_execs(),
            created: worker.created(),
            memory_usage: usage.map(|s| s.memory_bytes).unwrap_or_default(),
            cpu_percent: usage.map(|s| s.cpu_percent).unwrap_or_default(),
        }
    }
}
