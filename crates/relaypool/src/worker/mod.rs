// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker processes: lifecycle, state and request execution.

mod process;
mod state;

pub use process::{MAX_STDERR_BYTES, WorkerProcess};
pub use state::{WorkerState, WorkerStatus};

use relaypool_protocol::Payload;

/// Result of a successful round trip with a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The worker answered the request.
    Payload(Payload),
    /// The worker refused the request and asked to be replaced.
    StopRequested,
}
