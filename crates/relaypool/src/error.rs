// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for relaypool.

use std::time::Duration;

use relaypool_protocol::FrameError;
use thiserror::Error;

use crate::worker::WorkerStatus;

/// Pool errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Pool configuration is invalid.
    #[error("invalid pool configuration: {field} {reason}")]
    InvalidConfig {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No worker became free within the allocate timeout.
    #[error("no free worker within allocate timeout ({0:?})")]
    AllocateTimeout(Duration),

    /// The worker watcher is being destroyed.
    #[error("worker watcher is stopped")]
    WatcherStopped,

    /// The stack stayed empty for the whole safety ceiling.
    #[error("no free workers in the stack after {0:?}")]
    NoFreeWorkers(Duration),

    /// Every attempt hit a worker asking to be replaced.
    #[error("request refused by {0} workers asking to stop")]
    StopRetriesExhausted(usize),

    /// Job-level error reported by the worker.
    #[error("{0}")]
    Job(String),

    /// Empty request payload.
    #[error("payload can not be empty")]
    EmptyPayload,

    /// Worker is not in the `ready` state.
    #[error("worker is not ready: {0}")]
    NotReady(WorkerStatus),

    /// Worker process was started twice.
    #[error("worker process already started")]
    AlreadyStarted,

    /// Worker process was never started.
    #[error("worker process not started")]
    NotStarted,

    /// Spawning the worker process failed.
    #[error("failed to start worker process: {0}")]
    ProcessStart(#[source] std::io::Error),

    /// The worker did not connect its relay in time.
    #[error("worker relay not connected within {0:?}")]
    RelayTimeout(Duration),

    /// The worker answered the handshake with someone else's pid.
    #[error("worker reported pid {actual}, expected {expected}")]
    PidMismatch {
        /// Pid of the spawned process.
        expected: u32,
        /// Pid reported over the relay.
        actual: u32,
    },

    /// Relay or framing failure.
    #[error("relay error: {0}")]
    Protocol(#[from] FrameError),

    /// The worker process exited unexpectedly.
    #[error("worker process exited with {}: {stderr}", describe_exit(.code))]
    ProcessExit {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// The execution took longer than the configured exec TTL.
    #[error("execution exceeded exec TTL ({0:?})")]
    ExecTtl(Duration),

    /// Sending a signal to the worker failed.
    #[error("failed to signal worker process: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// Process stats could not be read.
    #[error("process stats unavailable for pid {0}")]
    StatsUnavailable(u32),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad error category, used by callers to tell request failures from
/// infrastructure failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing configuration.
    Config,
    /// No worker could be acquired.
    Allocation,
    /// The request failed; the worker is healthy.
    Job,
    /// The worker failed and is being replaced.
    Worker,
    /// Supervisor-side failure.
    Supervisor,
}

impl Error {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig { .. } | Error::Config(_) => ErrorKind::Config,
            Error::AllocateTimeout(_)
            | Error::WatcherStopped
            | Error::NoFreeWorkers(_)
            | Error::StopRetriesExhausted(_) => ErrorKind::Allocation,
            Error::Job(_) | Error::EmptyPayload => ErrorKind::Job,
            Error::StatsUnavailable(_) => ErrorKind::Supervisor,
            Error::NotReady(_)
            | Error::AlreadyStarted
            | Error::NotStarted
            | Error::ProcessStart(_)
            | Error::RelayTimeout(_)
            | Error::PidMismatch { .. }
            | Error::Protocol(_)
            | Error::ProcessExit { .. }
            | Error::ExecTtl(_)
            | Error::Signal(_)
            | Error::Io(_) => ErrorKind::Worker,
        }
    }

    /// True for payload-scoped failures that leave the worker usable.
    pub fn is_job_error(&self) -> bool {
        self.kind() == ErrorKind::Job
    }

    /// True for failures that require the worker to be replaced.
    pub fn is_worker_error(&self) -> bool {
        self.kind() == ErrorKind::Worker
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "signal".to_string(),
    }
}

/// Result type using relaypool Error.
pub type Result<T> = std::result::Result<T, Error>;
