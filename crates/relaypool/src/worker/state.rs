// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker status and lock-free state tracking.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Worker status.
///
/// ```text
/// Inactive ──start──► Ready ⇄ Working
///                       │        │
///                       │        ├──► Errored        (relay/process failure)
///                       │        ├──► Remove         (evicted while checked out)
///                       │        └──► MaxJobsReached (rotation)
///                       ▼
///                    Stopping / Killing ──► Stopped
///
/// Invalid: evicted or refused work, Destroyed: torn down with the pool
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerStatus {
    /// Created but not yet connected.
    Inactive = 0,
    /// Idle and able to accept work.
    Ready = 1,
    /// Executing a request.
    Working = 2,
    /// Must not be used anymore; waiting for teardown.
    Invalid = 3,
    /// Graceful stop in progress.
    Stopping = 4,
    /// Kill signal sent.
    Killing = 5,
    /// Torn down together with the pool; never replaced.
    Destroyed = 6,
    /// Reached the execution limit.
    MaxJobsReached = 7,
    /// Process exited cleanly or on request.
    Stopped = 8,
    /// Process or relay failed.
    Errored = 9,
    /// Evicted while checked out; destroyed when released.
    Remove = 10,
}

impl WorkerStatus {
    /// Lowercase status name.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Inactive => "inactive",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Working => "working",
            WorkerStatus::Invalid => "invalid",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Killing => "killing",
            WorkerStatus::Destroyed => "destroyed",
            WorkerStatus::MaxJobsReached => "max_jobs_reached",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Errored => "errored",
            WorkerStatus::Remove => "remove",
        }
    }

    /// True while the process is expected to be alive and usable.
    pub fn is_active(self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Working)
    }

    /// True when the process exit was requested by the pool.
    pub fn is_induced_exit(self) -> bool {
        matches!(
            self,
            WorkerStatus::Invalid
                | WorkerStatus::Stopping
                | WorkerStatus::Killing
                | WorkerStatus::Destroyed
                | WorkerStatus::MaxJobsReached
                | WorkerStatus::Remove
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerStatus::Inactive,
            1 => WorkerStatus::Ready,
            2 => WorkerStatus::Working,
            3 => WorkerStatus::Invalid,
            4 => WorkerStatus::Stopping,
            5 => WorkerStatus::Killing,
            6 => WorkerStatus::Destroyed,
            7 => WorkerStatus::MaxJobsReached,
            8 => WorkerStatus::Stopped,
            9 => WorkerStatus::Errored,
            _ => WorkerStatus::Remove,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic worker state: status, execution counter and timestamps.
#[derive(Debug)]
pub struct WorkerState {
    status: AtomicU8,
    num_execs: AtomicU64,
    last_used: AtomicI64,
    changed_at: AtomicI64,
}

impl WorkerState {
    /// New state with the given status.
    pub fn new(status: WorkerStatus) -> Self {
        let now = now_micros();
        Self {
            status: AtomicU8::new(status as u8),
            num_execs: AtomicU64::new(0),
            last_used: AtomicI64::new(now),
            changed_at: AtomicI64::new(now),
        }
    }

    /// Current status.
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Set the status unconditionally.
    pub fn set(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
        self.changed_at.store(now_micros(), Ordering::Release);
    }

    /// Set the status unless the worker is already `Destroyed`.
    pub fn set_unless_destroyed(&self, status: WorkerStatus) {
        let updated = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != WorkerStatus::Destroyed as u8).then_some(status as u8)
            });
        if updated.is_ok() {
            self.changed_at.store(now_micros(), Ordering::Release);
        }
    }

    /// Move from `from` to `to`; returns false if the status was not `from`.
    pub fn transition(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        let swapped = self
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.changed_at.store(now_micros(), Ordering::Release);
        }
        swapped
    }

    /// Number of completed executions.
    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::Acquire)
    }

    /// Count one execution and refresh the last-used timestamp.
    pub fn register_exec(&self) -> u64 {
        self.last_used.store(now_micros(), Ordering::Release);
        self.num_execs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// When the worker last finished a request (creation time if never).
    pub fn last_used(&self) -> DateTime<Utc> {
        from_micros(self.last_used.load(Ordering::Acquire))
    }

    /// When the status last changed.
    pub fn changed_at(&self) -> DateTime<Utc> {
        from_micros(self.changed_at.load(Ordering::Acquire))
    }
}

pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}
