// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relaypool Protocol - framed relay between the pool and its workers
//!
//! This crate provides both ends of the worker relay:
//! - the pool side, used by `relaypool` to talk to spawned workers
//! - the worker side ([`WorkerEndpoint`]), used by worker processes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    relaypool-protocol                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Control: pid handshake, stop, response classification      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: version + flags + context/body lengths            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: pipes (stdin/stdout), TCP, Unix sockets         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Request flow
//!
//! 1. The pool spawns a worker and sends `{"pid": <pool pid>}` as a control frame.
//! 2. The worker answers with its own pid; the pool checks it against the spawned process.
//! 3. Each request is one data frame; the worker answers with one data frame,
//!    one error frame (job-level failure) or the stop sentinel.
//! 4. On shutdown the pool sends `{"stop": true}` and the worker exits.

pub mod addr;
pub mod control;
pub mod endpoint;
pub mod frame;
pub mod payload;
pub mod relay;

pub use addr::{RELAY_ENV, RelayAddr, RelayAddrError};
pub use control::{PidCommand, Response, StopCommand, fetch_pid, is_stop_request, send_control};
pub use endpoint::WorkerEndpoint;
pub use frame::{Flags, Frame, FrameError, read_frame, write_frame};
pub use payload::Payload;
pub use relay::{Relay, StreamRelay, TcpRelay};

#[cfg(unix)]
pub use relay::UnixRelay;
