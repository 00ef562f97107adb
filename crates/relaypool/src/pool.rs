// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static pool - a fixed set of workers behind a synchronous `exec`.
//!
//! ```text
//! exec ──acquire (allocate_timeout)──► worker.exec ──► release / retire
//!            │                              │
//!            └── WorkerWatcher::take         └── stop requested: retry on another worker
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use relaypool_protocol::Payload;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::command::WorkerCommand;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, WorkerEventKind};
use crate::factory::Factory;
use crate::stats::{ProcessState, StatsProvider, SystemStats};
use crate::watcher::{Allocator, DEFAULT_NO_FREE_WORKERS_TIMEOUT, WatcherTimeouts, WorkerWatcher};
use crate::worker::{ExecOutcome, WorkerProcess, WorkerStatus};

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers kept running.
    pub num_workers: usize,
    /// Executions after which a worker is rotated, `0` for no limit.
    pub max_jobs: u64,
    /// How long `exec` waits for a free worker.
    pub allocate_timeout: Duration,
    /// Graceful stop budget before workers are killed.
    pub destroy_timeout: Duration,
    /// Upper bound for a single execution.
    pub exec_ttl: Option<Duration>,
    /// Safety ceiling for waiting on an empty stack; larger than `allocate_timeout`.
    pub no_free_workers_timeout: Duration,
    /// Spawn a fresh worker for every request instead of keeping a pool.
    pub debug: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_jobs: 0,
            allocate_timeout: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(60),
            exec_ttl: None,
            no_free_workers_timeout: DEFAULT_NO_FREE_WORKERS_TIMEOUT,
            debug: false,
        }
    }
}

impl PoolConfig {
    /// Check the configuration before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 && !self.debug {
            return Err(invalid("num_workers", "must be greater than zero"));
        }
        if self.allocate_timeout.is_zero() {
            return Err(invalid("allocate_timeout", "must be greater than zero"));
        }
        if self.destroy_timeout.is_zero() {
            return Err(invalid("destroy_timeout", "must be greater than zero"));
        }
        if self.exec_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(invalid("exec_ttl", "must be greater than zero"));
        }
        if self.no_free_workers_timeout <= self.allocate_timeout {
            return Err(invalid(
                "no_free_workers_timeout",
                "must be larger than allocate_timeout",
            ));
        }
        Ok(())
    }

    fn watcher_timeouts(&self) -> WatcherTimeouts {
        WatcherTimeouts {
            allocate: self.allocate_timeout,
            destroy: self.destroy_timeout,
            no_free_workers: self.no_free_workers_timeout,
        }
    }
}

fn invalid(field: &'static str, reason: &'static str) -> Error {
    Error::InvalidConfig { field, reason }
}

/// Spawns pool workers through the factory.
struct PoolAllocator {
    factory: Arc<dyn Factory>,
    command: WorkerCommand,
    events: EventBus,
}

impl PoolAllocator {
    /// Spawn one worker. Without `timeout` only the factory's relay timeout
    /// bounds the startup.
    async fn spawn(&self, timeout: Option<Duration>) -> Result<Arc<WorkerProcess>> {
        let worker = match timeout {
            Some(timeout) => {
                self.factory
                    .spawn_worker_with_timeout(&self.command, &self.events, timeout)
                    .await?
            }
            None => self.factory.spawn_worker(&self.command, &self.events).await?,
        };
        let pid = worker.pid().unwrap_or_default();
        debug!(pid = pid, factory = self.factory.factory_type(), "worker constructed");
        self.events
            .publish(Event::worker(WorkerEventKind::WorkerConstruct, pid));
        Ok(Arc::new(worker))
    }
}

#[async_trait]
impl Allocator for PoolAllocator {
    async fn allocate(&self) -> Result<Arc<WorkerProcess>> {
        self.spawn(None).await
    }
}

/// A worker taken off the stack for one request.
///
/// Dropped without [`release`](Self::release) means the request future was
/// cancelled mid exec. The relay may still carry an unread response, so the
/// worker is killed and the watcher replaces it.
struct CheckedOut {
    worker: Arc<WorkerProcess>,
    armed: bool,
}

impl CheckedOut {
    fn new(worker: Arc<WorkerProcess>) -> Self {
        Self {
            worker,
            armed: true,
        }
    }

    fn worker(&self) -> &WorkerProcess {
        &self.worker
    }

    /// Hand the worker back to the normal release path.
    fn release(mut self) -> Arc<WorkerProcess> {
        self.armed = false;
        self.worker.clone()
    }
}

impl Drop for CheckedOut {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pid = self.worker.pid().unwrap_or_default();
        warn!(pid = pid, "request cancelled during exec, retiring worker");
        self.worker.state().set_unless_destroyed(WorkerStatus::Invalid);
        if let Err(e) = self.worker.kill() {
            warn!(pid = pid, error = %e, "failed to kill worker");
        }
    }
}

/// Fixed-size worker pool.
pub struct StaticPool {
    config: PoolConfig,
    allocator: Arc<PoolAllocator>,
    watcher: Arc<WorkerWatcher>,
    events: EventBus,
    stats: Arc<dyn StatsProvider>,
    exec_gate: RwLock<()>,
}

impl StaticPool {
    /// Validate `config` and spawn `num_workers` workers.
    ///
    /// If any worker fails to start, the ones already running are killed
    /// and the error is returned. In debug mode nothing is pre-spawned.
    pub async fn new(
        command: WorkerCommand,
        factory: Arc<dyn Factory>,
        config: PoolConfig,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;

        let allocator = Arc::new(PoolAllocator {
            factory,
            command,
            events: events.clone(),
        });
        let watcher = Arc::new(WorkerWatcher::new(
            allocator.clone(),
            events.clone(),
            config.watcher_timeouts(),
        ));

        let pool = Self {
            config,
            allocator,
            watcher,
            events,
            stats: Arc::new(SystemStats::new()),
            exec_gate: RwLock::new(()),
        };

        if !pool.config.debug {
            let workers = pool.spawn_workers(pool.config.num_workers).await?;
            pool.watcher.watch(workers).await;
        }

        info!(
            command = %pool.allocator.command,
            num_workers = pool.config.num_workers,
            debug = pool.config.debug,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Replace the stats provider used by [`states`](Self::states).
    pub fn with_stats(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = stats;
        self
    }

    async fn spawn_workers(&self, count: usize) -> Result<Vec<Arc<WorkerProcess>>> {
        let results = join_all((0..count).map(|_| self.allocator.allocate())).await;

        let mut workers = Vec::with_capacity(count);
        let mut failure = None;
        for result in results {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            warn!(error = %e, spawned = workers.len(), "failed to spawn workers");
            for worker in &workers {
                worker.state().set(WorkerStatus::Destroyed);
                let _ = worker.kill();
            }
            return Err(e);
        }
        Ok(workers)
    }

    /// Execute one request on a free worker.
    ///
    /// Job errors are returned as reported by the worker and leave it in the
    /// pool. Worker errors retire the worker; it is replaced in the
    /// background. A worker asking to be replaced gets the request retried on
    /// another one, at most `num_workers + 1` times. Dropping the future
    /// while a worker runs the request kills that worker.
    pub async fn exec(&self, payload: &Payload) -> Result<Payload> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if self.config.debug {
            return self.exec_debug(payload).await;
        }

        let attempts = self.config.num_workers + 1;
        for attempt in 1..=attempts {
            let (_gate, worker) = self.acquire().await?;
            let checked_out = CheckedOut::new(worker);
            let outcome = self.exec_worker(checked_out.worker(), payload).await;
            let worker = checked_out.release();

            match outcome {
                Ok(ExecOutcome::Payload(result)) => {
                    self.finish(worker).await;
                    return Ok(result);
                }
                Ok(ExecOutcome::StopRequested) => {
                    debug!(pid = ?worker.pid(), attempt = attempt, "worker asked to stop, retrying");
                    self.watcher.release(worker).await;
                }
                Err(Error::NotReady(status)) => {
                    debug!(pid = ?worker.pid(), status = %status, "worker not ready, retrying");
                    self.watcher.release(worker).await;
                }
                Err(e) if e.is_job_error() => {
                    self.finish(worker).await;
                    return Err(e);
                }
                Err(e) => {
                    let pid = worker.pid().unwrap_or_default();
                    warn!(pid = pid, error = %e, "worker failed during exec");
                    if !matches!(e, Error::ExecTtl(_)) {
                        self.events.publish(Event::worker_detail(
                            WorkerEventKind::WorkerError,
                            pid,
                            e.to_string(),
                        ));
                    }
                    self.watcher.release(worker).await;
                    return Err(e);
                }
            }
        }

        Err(Error::StopRetriesExhausted(attempts))
    }

    /// Wait for a free worker within the allocate timeout.
    ///
    /// The returned guard keeps [`reset`](Self::reset) from recycling
    /// workers under a running request.
    async fn acquire(&self) -> Result<(RwLockReadGuard<'_, ()>, Arc<WorkerProcess>)> {
        let timeout = self.config.allocate_timeout;
        tokio::time::timeout(timeout, async {
            let gate = self.exec_gate.read().await;
            let worker = self.watcher.take().await?;
            Ok::<_, Error>((gate, worker))
        })
        .await
        .map_err(|_| Error::AllocateTimeout(timeout))?
    }

    async fn exec_worker(
        &self,
        worker: &WorkerProcess,
        payload: &Payload,
    ) -> Result<ExecOutcome> {
        let Some(ttl) = self.config.exec_ttl else {
            return worker.exec(payload).await;
        };

        match tokio::time::timeout(ttl, worker.exec(payload)).await {
            Ok(result) => result,
            Err(_) => {
                let pid = worker.pid().unwrap_or_default();
                warn!(pid = pid, ttl = ?ttl, "execution exceeded exec TTL, killing worker");
                if let Err(e) = worker.kill() {
                    warn!(pid = pid, error = %e, "failed to kill worker");
                }
                self.events.publish(Event::worker_detail(
                    WorkerEventKind::ExecTtl,
                    pid,
                    format!("execution exceeded {:?}", ttl),
                ));
                Err(Error::ExecTtl(ttl))
            }
        }
    }

    /// Rotate the worker once it reached `max_jobs`, then hand it back.
    async fn finish(&self, worker: Arc<WorkerProcess>) {
        let max_jobs = self.config.max_jobs;
        if max_jobs > 0
            && worker.num_execs() >= max_jobs
            && worker
                .state()
                .transition(WorkerStatus::Ready, WorkerStatus::MaxJobsReached)
        {
            debug!(pid = ?worker.pid(), max_jobs = max_jobs, "worker reached max jobs");
        }
        self.watcher.release(worker).await;
    }

    async fn exec_debug(&self, payload: &Payload) -> Result<Payload> {
        let worker = self
            .allocator
            .spawn(Some(self.config.allocate_timeout))
            .await?;
        let pid = worker.pid().unwrap_or_default();
        let waiter = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.wait().await })
        };

        let checked_out = CheckedOut::new(worker);
        let result = self.exec_worker(checked_out.worker(), payload).await;
        let worker = checked_out.release();

        if let Err(e) = worker.stop(self.config.destroy_timeout).await {
            warn!(pid = pid, error = %e, "failed to stop debug worker");
        }
        if let Ok(Err(e)) = waiter.await {
            warn!(pid = pid, error = %e, "debug worker exited with error");
        }
        self.events
            .publish(Event::worker(WorkerEventKind::WorkerDestruct, pid));

        match result? {
            ExecOutcome::Payload(payload) => Ok(payload),
            ExecOutcome::StopRequested => Err(Error::StopRetriesExhausted(1)),
        }
    }

    /// All tracked workers, idle and busy.
    pub async fn workers(&self) -> Vec<Arc<WorkerProcess>> {
        self.watcher.workers().await
    }

    /// Status snapshot of every worker.
    pub async fn states(&self) -> Vec<ProcessState> {
        self.workers()
            .await
            .iter()
            .map(|worker| ProcessState::capture(worker, self.stats.as_ref()))
            .collect()
    }

    /// Evict one worker; see [`WorkerWatcher::remove_worker`].
    pub async fn remove_worker(&self, worker: &WorkerProcess) -> Result<bool> {
        self.watcher.remove_worker(worker).await
    }

    /// Stop every worker. The pool refuses work afterwards until reset.
    pub async fn destroy(&self) {
        info!("destroying worker pool");
        self.watcher.destroy(self.config.destroy_timeout).await;
    }

    /// Recycle every worker.
    ///
    /// Waits for running requests (up to the destroy timeout), destroys the
    /// current workers and spawns a fresh set.
    pub async fn reset(&self) -> Result<()> {
        info!("resetting worker pool");
        let timeout = self.config.destroy_timeout;
        let _gate = match tokio::time::timeout(timeout, self.exec_gate.write()).await {
            Ok(gate) => Some(gate),
            Err(_) => {
                warn!(timeout = ?timeout, "requests still running, resetting anyway");
                None
            }
        };

        self.watcher.reset(timeout).await;
        if !self.config.debug {
            let workers = self.spawn_workers(self.config.num_workers).await?;
            self.watcher.watch(workers).await;
        }
        info!(num_workers = self.config.num_workers, "worker pool reset");
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
