// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relaypool - supervised pool of long-lived worker processes
//!
//! This crate keeps a fixed number of external worker processes running,
//! hands requests to them over a framed relay and keeps the pool healthy
//! when workers crash, leak memory or overstay their welcome.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         PoolRuntime                               │
//! │   ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │   │  StaticPool  │◄──│  Supervisor  │   │   Restart watchdog   │  │
//! │   │    exec      │   │ ttl / memory │   │ PoolRestart → reset  │  │
//! │   └──────┬───────┘   └──────────────┘   └──────────────────────┘  │
//! │          │ take / release                       ▲                 │
//! │   ┌──────▼───────┐        events (broadcast)    │                 │
//! │   │WorkerWatcher │──────────────────────────────┘                 │
//! │   └──────┬───────┘                                                │
//! │          │ allocate                                               │
//! │   ┌──────▼───────┐                                                │
//! │   │   Factory    │  pipes │ tcp:// │ unix://                      │
//! │   └──────┬───────┘                                                │
//! └──────────┼────────────────────────────────────────────────────────┘
//!            ▼
//!   ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//!   │  worker process │ │  worker process │ │  worker process │
//!   └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```
//!
//! # Worker lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `Inactive` | Spawned, relay not connected yet |
//! | `Ready` | Idle, may be handed a request |
//! | `Working` | Executing a request |
//! | `Invalid` | Asked to be replaced; never reused |
//! | `MaxJobsReached` | Rotated after `max_jobs` executions |
//! | `Remove` | Flagged by the supervisor while busy |
//! | `Stopping` / `Killing` | Being terminated |
//! | `Stopped` / `Errored` | Exited, induced or not |
//! | `Destroyed` | Pool teardown, never replaced |
//!
//! # Configuration
//!
//! The `relaypool` binary is configured through environment variables; see
//! [`config::Config`].

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod pool;
pub mod runtime;
pub mod stats;
pub mod supervisor;
pub mod watcher;
pub mod worker;

pub use command::WorkerCommand;
pub use config::{Config, ConfigError};
pub use error::{Error, ErrorKind, Result};
pub use events::{
    Event, EventBus, PoolEvent, PoolEventKind, ServerEvent, ServerEventKind, WorkerEvent,
    WorkerEventKind,
};
pub use factory::{Factory, PipeFactory, SocketFactory};
pub use pool::{PoolConfig, StaticPool};
pub use runtime::{PoolRuntime, PoolRuntimeBuilder};
pub use stats::{ProcessState, ProcessStats, StatsProvider, SystemStats};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use watcher::WorkerWatcher;
pub use worker::{ExecOutcome, WorkerProcess, WorkerStatus};

pub use relaypool_protocol::{Payload, RelayAddr};
