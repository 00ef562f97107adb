// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workers talking over their stdin/stdout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use relaypool_protocol::{RELAY_ENV, StreamRelay};
use tracing::{debug, warn};

use super::Factory;
use crate::command::WorkerCommand;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::worker::{WorkerProcess, WorkerStatus};

/// Factory for workers relaying over process pipes.
#[derive(Debug, Clone)]
pub struct PipeFactory {
    relay_timeout: Duration,
}

impl PipeFactory {
    /// `relay_timeout` bounds the pid handshake.
    pub fn new(relay_timeout: Duration) -> Self {
        Self { relay_timeout }
    }
}

#[async_trait]
impl Factory for PipeFactory {
    fn factory_type(&self) -> &'static str {
        "pipes"
    }

    async fn spawn_worker(
        &self,
        command: &WorkerCommand,
        events: &EventBus,
    ) -> Result<WorkerProcess> {
        let mut process = command.build();
        process
            .env(RELAY_ENV, "pipes")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let worker = WorkerProcess::new(process, events.clone());
        worker.start()?;
        let (stdout, stdin) = worker.take_pipes()?;
        worker
            .attach_relay(Box::new(StreamRelay::new(stdout, stdin)))
            .await;

        let handshake = tokio::time::timeout(self.relay_timeout, worker.handshake()).await;
        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(Error::RelayTimeout(self.relay_timeout)),
        };
        if let Some(e) = failure {
            warn!(command = %command, error = %e, "worker handshake failed");
            let _ = worker.kill();
            return Err(e);
        }

        worker.state().set(WorkerStatus::Ready);
        debug!(pid = ?worker.pid(), "pipe worker ready");
        Ok(worker)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
