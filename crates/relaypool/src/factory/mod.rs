// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker factories - spawn a process and connect its relay.
//!
//! A factory returns workers that are started, connected, past the pid
//! handshake and `Ready`. Nobody waits on them yet: the caller registers them
//! with a [`WorkerWatcher`](crate::watcher::WorkerWatcher) or waits itself.

mod pipe;
mod socket;

pub use pipe::PipeFactory;
pub use socket::SocketFactory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relaypool_protocol::RelayAddr;

use crate::command::WorkerCommand;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::worker::WorkerProcess;

/// Spawns connected workers over one transport.
#[async_trait]
pub trait Factory: Send + Sync {
    /// Short transport name for logs.
    fn factory_type(&self) -> &'static str;

    /// Spawn a worker and wait until it is ready.
    async fn spawn_worker(&self, command: &WorkerCommand, events: &EventBus)
    -> Result<WorkerProcess>;

    /// Like [`spawn_worker`](Self::spawn_worker), failing with
    /// [`Error::RelayTimeout`] when the worker is not ready within `timeout`.
    ///
    /// A worker abandoned on timeout is dropped, which kills its process.
    async fn spawn_worker_with_timeout(
        &self,
        command: &WorkerCommand,
        events: &EventBus,
        timeout: Duration,
    ) -> Result<WorkerProcess> {
        tokio::time::timeout(timeout, self.spawn_worker(command, events))
            .await
            .map_err(|_| Error::RelayTimeout(timeout))?
    }

    /// Release transport resources (listeners, socket files).
    async fn close(&self) -> Result<()>;
}

/// Build the factory serving `addr`.
pub async fn for_relay(addr: &RelayAddr, relay_timeout: Duration) -> Result<Arc<dyn Factory>> {
    match addr {
        RelayAddr::Pipes => Ok(Arc::new(PipeFactory::new(relay_timeout))),
        _ => Ok(Arc::new(SocketFactory::bind(addr, relay_timeout).await?)),
    }
}
