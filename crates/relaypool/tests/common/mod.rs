// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for relaypool integration tests.
//!
//! Pools in these tests run the `relaypool-echo-worker` binary built
//! alongside the tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaypool::command::WorkerCommand;
use relaypool::error::{Error, Result};
use relaypool::events::{Event, EventBus};
use relaypool::factory::{Factory, PipeFactory};
use relaypool::pool::{PoolConfig, StaticPool};
use relaypool::stats::{ProcessStats, StatsProvider};
use tokio::sync::broadcast;

/// Relay timeout used by test factories.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Command running the echo worker in `mode`.
pub fn echo_worker(mode: &str) -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_relaypool-echo-worker")).arg(mode)
}

/// Pool configuration with test-friendly timeouts.
pub fn pool_config(num_workers: usize) -> PoolConfig {
    PoolConfig {
        num_workers,
        allocate_timeout: Duration::from_secs(10),
        destroy_timeout: Duration::from_secs(5),
        no_free_workers_timeout: Duration::from_secs(30),
        ..Default::default()
    }
}

/// Pipe factory with the test relay timeout.
pub fn pipe_factory() -> Arc<dyn Factory> {
    Arc::new(PipeFactory::new(RELAY_TIMEOUT))
}

/// Start a pipe pool, returning it with its event bus.
pub async fn start_pool(command: WorkerCommand, config: PoolConfig) -> (Arc<StaticPool>, EventBus) {
    let events = EventBus::new();
    let pool = StaticPool::new(command, pipe_factory(), config, events.clone())
        .await
        .expect("Failed to start pool");
    (Arc::new(pool), events)
}

/// Wait for the first event matching `predicate`.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    predicate: F,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Every event already buffered in `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Poll the pool's pids until `predicate` holds or `timeout` passes.
pub async fn wait_for_pids<F>(pool: &StaticPool, timeout: Duration, predicate: F) -> bool
where
    F: Fn(&[u32]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate(&pids(pool).await) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Pids of the pool's workers, in registration order.
pub async fn pids(pool: &StaticPool) -> Vec<u32> {
    pool.workers()
        .await
        .iter()
        .filter_map(|worker| worker.pid())
        .collect()
}

/// Stats provider reporting configured memory figures.
#[derive(Default)]
pub struct FixedStats {
    memory: Mutex<HashMap<u32, u64>>,
    default_memory: Mutex<Option<u64>>,
}

impl FixedStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report `bytes` for every pid without an explicit figure.
    pub fn set_default(&self, bytes: u64) {
        *self.default_memory.lock().unwrap() = Some(bytes);
    }

    /// Report `bytes` for `pid`.
    pub fn set(&self, pid: u32, bytes: u64) {
        self.memory.lock().unwrap().insert(pid, bytes);
    }
}

impl StatsProvider for FixedStats {
    fn stats(&self, pid: u32) -> Result<ProcessStats> {
        let memory = self.memory.lock().unwrap().get(&pid).copied();
        let memory_bytes = memory
            .or(*self.default_memory.lock().unwrap())
            .ok_or(Error::StatsUnavailable(pid))?;
        Ok(ProcessStats {
            pid,
            memory_bytes,
            cpu_percent: 0.0,
        })
    }
}
