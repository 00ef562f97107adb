// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for relaypool.
//!
//! [`PoolRuntime`] wires a factory, a [`StaticPool`], an optional
//! [`Supervisor`] and a restart watchdog together, so relaypool can run
//! inside an existing tokio application instead of as a standalone server.
//!
//! # Example
//!
//! ```rust,ignore
//! use relaypool::command::WorkerCommand;
//! use relaypool::runtime::PoolRuntime;
//! use relaypool_protocol::Payload;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = PoolRuntime::builder()
//!         .command(WorkerCommand::new("php").arg("worker.php"))
//!         .relay("tcp://127.0.0.1:0".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let reply = runtime.exec(&Payload::from_body("hello")).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! The watchdog rebuilds the pool when the watcher reports it could not
//! replace a worker (`PoolRestart`) or the supervisor destroyed the pool
//! over its memory limit (`MaxPoolMemory`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use relaypool_protocol::{Payload, RelayAddr};
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::command::WorkerCommand;
use crate::config::{Config, DEFAULT_RELAY_TIMEOUT};
use crate::events::{Event, EventBus, PoolEventKind, ServerEventKind};
use crate::factory::{self, Factory};
use crate::pool::{PoolConfig, StaticPool};
use crate::stats::{StatsProvider, SystemStats};
use crate::supervisor::{Supervisor, SupervisorConfig};

/// Builder for creating a [`PoolRuntime`].
#[derive(Default)]
pub struct PoolRuntimeBuilder {
    command: Option<WorkerCommand>,
    relay: Option<RelayAddr>,
    relay_timeout: Option<Duration>,
    pool_config: PoolConfig,
    supervisor_config: Option<SupervisorConfig>,
    events: Option<EventBus>,
    stats: Option<Arc<dyn StatsProvider>>,
}

impl PoolRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a configuration loaded with [`Config::from_env`].
    pub fn from_config(config: Config) -> Self {
        Self {
            command: Some(config.command),
            relay: Some(config.relay),
            relay_timeout: Some(config.relay_timeout),
            pool_config: config.pool,
            supervisor_config: config.supervisor,
            ..Default::default()
        }
    }

    /// Set the worker command line (required).
    pub fn command(mut self, command: WorkerCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Set the transport between the pool and its workers.
    ///
    /// Default: pipes
    pub fn relay(mut self, relay: RelayAddr) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Set how long a spawned worker has to connect its relay.
    ///
    /// Default: 60 seconds
    pub fn relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = Some(timeout);
        self
    }

    /// Set pool sizing and timeouts.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Enable the supervisor with the given limits.
    ///
    /// Default: no supervisor
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = Some(config);
        self
    }

    /// Publish events on an existing bus, e.g. one with listeners attached.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the process stats source used by the pool and the supervisor.
    ///
    /// Default: [`SystemStats`]
    pub fn stats(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the pool
    /// configuration is invalid.
    pub fn build(self) -> Result<PoolRuntimeConfig> {
        let command = self
            .command
            .ok_or_else(|| anyhow::anyhow!("command is required"))?;
        self.pool_config.validate()?;
        if let Some(config) = &self.supervisor_config {
            config.validate()?;
        }

        Ok(PoolRuntimeConfig {
            command,
            relay: self.relay.unwrap_or(RelayAddr::Pipes),
            relay_timeout: self.relay_timeout.unwrap_or(DEFAULT_RELAY_TIMEOUT),
            pool_config: self.pool_config,
            supervisor_config: self.supervisor_config,
            events: self.events.unwrap_or_default(),
            stats: self
                .stats
                .unwrap_or_else(|| Arc::new(SystemStats::new())),
        })
    }
}

/// Configuration for a [`PoolRuntime`].
pub struct PoolRuntimeConfig {
    command: WorkerCommand,
    relay: RelayAddr,
    relay_timeout: Duration,
    pool_config: PoolConfig,
    supervisor_config: Option<SupervisorConfig>,
    events: EventBus,
    stats: Arc<dyn StatsProvider>,
}

impl PoolRuntimeConfig {
    /// Start the runtime: bind the relay, spawn the workers, then the
    /// supervisor and the restart watchdog.
    pub async fn start(self) -> Result<PoolRuntime> {
        let factory = factory::for_relay(&self.relay, self.relay_timeout).await?;

        let pool = match StaticPool::new(
            self.command.clone(),
            factory.clone(),
            self.pool_config,
            self.events.clone(),
        )
        .await
        {
            Ok(pool) => Arc::new(pool.with_stats(self.stats.clone())),
            Err(e) => {
                if let Err(close_err) = factory.close().await {
                    warn!(error = %close_err, "Failed to close worker factory");
                }
                return Err(e.into());
            }
        };

        // Create supervisor (only when limits are configured)
        let (supervisor_shutdown, supervisor_handle) = match self.supervisor_config {
            Some(config) => {
                let supervisor = Supervisor::new(pool.clone(), self.stats.clone(), config);
                let shutdown = supervisor.shutdown_handle();
                let handle = tokio::spawn(async move {
                    supervisor.run().await;
                });
                (Some(shutdown), Some(handle))
            }
            None => (None, None),
        };

        let watchdog_shutdown = Arc::new(Notify::new());
        let watchdog_handle = tokio::spawn(run_watchdog(
            pool.clone(),
            self.events.clone(),
            watchdog_shutdown.clone(),
        ));

        info!(
            command = %self.command,
            relay = %self.relay,
            factory = factory.factory_type(),
            supervised = supervisor_handle.is_some(),
            "PoolRuntime started"
        );
        self.events
            .publish(Event::server(ServerEventKind::Started, None));

        Ok(PoolRuntime {
            pool,
            factory,
            events: self.events,
            supervisor_handle,
            supervisor_shutdown,
            watchdog_handle,
            watchdog_shutdown,
        })
    }
}

/// A running relaypool instance that can be embedded in an application.
///
/// The runtime manages:
/// - the worker pool and the factory feeding it
/// - the supervisor enforcing worker limits (optional)
/// - the restart watchdog rebuilding the pool
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PoolRuntime {
    pool: Arc<StaticPool>,
    factory: Arc<dyn Factory>,
    events: EventBus,
    supervisor_handle: Option<JoinHandle<()>>,
    supervisor_shutdown: Option<Arc<Notify>>,
    watchdog_handle: JoinHandle<()>,
    watchdog_shutdown: Arc<Notify>,
}

impl PoolRuntime {
    /// Create a new builder.
    pub fn builder() -> PoolRuntimeBuilder {
        PoolRuntimeBuilder::new()
    }

    /// The pool served by this runtime.
    pub fn pool(&self) -> &Arc<StaticPool> {
        &self.pool
    }

    /// Event bus shared by the pool, the supervisor and the runtime.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Execute one request on the pool.
    pub async fn exec(&self, payload: &Payload) -> crate::error::Result<Payload> {
        self.pool.exec(payload).await
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.watchdog_handle.is_finished()
            && self
                .supervisor_handle
                .as_ref()
                .is_none_or(|handle| !handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the supervisor and the restart watchdog to stop, waits for
    /// them, then destroys the pool and closes the factory.
    pub async fn shutdown(self) -> Result<()> {
        info!("PoolRuntime shutting down...");

        // Signal background tasks
        self.watchdog_shutdown.notify_one();
        if let Some(shutdown) = &self.supervisor_shutdown {
            shutdown.notify_one();
        }

        if let Err(e) = self.watchdog_handle.await {
            error!("Restart watchdog task panicked: {}", e);
        }
        if let Some(handle) = self.supervisor_handle
            && let Err(e) = handle.await
        {
            error!("Supervisor task panicked: {}", e);
        }

        self.pool.destroy().await;
        self.factory.close().await?;

        self.events
            .publish(Event::server(ServerEventKind::Stopped, None));
        info!("PoolRuntime shutdown complete");
        Ok(())
    }
}

/// Reset the pool whenever it lost the ability to keep itself populated.
async fn run_watchdog(pool: Arc<StaticPool>, events: EventBus, shutdown: Arc<Notify>) {
    let mut rx = events.subscribe();

    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Restart watchdog lagged behind events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let Some(kind @ (PoolEventKind::PoolRestart | PoolEventKind::MaxPoolMemory)) =
            event.pool_kind()
        else {
            continue;
        };

        warn!(reason = ?kind, "Rebuilding worker pool");
        if let Err(e) = pool.reset().await {
            error!(error = %e, "Failed to rebuild worker pool");
            events.publish(Event::server(
                ServerEventKind::Failure,
                Some(format!("pool reset failed: {}", e)),
            ));
        }
    }
}
