// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker watcher - the idle stack and dead-worker replacement.
//!
//! Every tracked worker lives in a registry keyed by worker id. Idle workers
//! are additionally referenced from a LIFO of ids; removing an idle worker
//! only flips its slot, and the stale id is skipped on the next pop.
//!
//! Each watched worker has a waiter task. When the process exits, the waiter
//! unregisters it and allocates a replacement unless the worker was
//! destroyed or the watcher is shutting down.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus, PoolEventKind, WorkerEventKind};
use crate::worker::{WorkerProcess, WorkerStatus};

/// Default safety ceiling for [`WorkerWatcher::take`].
pub const DEFAULT_NO_FREE_WORKERS_TIMEOUT: Duration = Duration::from_secs(600);

/// Recheck interval while waiting for a free worker.
const RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Pause between replacement attempts.
const REPLACE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Poll interval while destroy waits for checked-out workers.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Source of new, ready workers.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn allocate(&self) -> Result<Arc<WorkerProcess>>;
}

/// Timeouts used by the watcher.
#[derive(Debug, Clone, Copy)]
pub struct WatcherTimeouts {
    /// Total time spent retrying a replacement.
    pub allocate: Duration,
    /// Graceful stop budget for retired workers.
    pub destroy: Duration,
    /// Ceiling for `take` on an empty stack.
    pub no_free_workers: Duration,
}

struct Slot {
    worker: Arc<WorkerProcess>,
    idle: bool,
}

#[derive(Default)]
struct Stack {
    idle: Vec<u64>,
    idle_count: usize,
    workers: HashMap<u64, Slot>,
    destroy: bool,
    /// Bumped by every destroy; workers allocated across a bump are stale.
    generation: u64,
}

impl Stack {
    fn register(&mut self, worker: Arc<WorkerProcess>) {
        self.workers.insert(
            worker.id(),
            Slot {
                worker,
                idle: false,
            },
        );
    }

    /// Mark a tracked, checked-out worker idle. False if it is unknown.
    fn push(&mut self, id: u64) -> bool {
        let Some(slot) = self.workers.get_mut(&id) else {
            return false;
        };
        if !slot.idle {
            slot.idle = true;
            self.idle_count += 1;
            self.idle.push(id);
        }
        true
    }

    fn pop(&mut self) -> Option<Arc<WorkerProcess>> {
        while let Some(id) = self.idle.pop() {
            if let Some(slot) = self.workers.get_mut(&id)
                && slot.idle
            {
                slot.idle = false;
                self.idle_count -= 1;
                return Some(slot.worker.clone());
            }
        }
        None
    }

    /// Drop the idle flag without touching the LIFO.
    fn unmark_idle(&mut self, id: u64) -> bool {
        match self.workers.get_mut(&id) {
            Some(slot) if slot.idle => {
                slot.idle = false;
                self.idle_count -= 1;
                self.compact();
                true
            }
            _ => false,
        }
    }

    fn unregister(&mut self, id: u64) {
        if let Some(slot) = self.workers.remove(&id)
            && slot.idle
        {
            self.idle_count -= 1;
        }
        self.compact();
    }

    /// Bound the LIFO when stale ids pile up.
    fn compact(&mut self) {
        if self.idle.len() > 2 * self.idle_count + 16 {
            let workers = &self.workers;
            self.idle
                .retain(|id| workers.get(id).is_some_and(|slot| slot.idle));
        }
    }

    fn clear(&mut self) -> Vec<Arc<WorkerProcess>> {
        self.idle.clear();
        self.idle_count = 0;
        self.workers.drain().map(|(_, slot)| slot.worker).collect()
    }
}

/// Idle stack plus replacement machinery for one pool.
pub struct WorkerWatcher {
    stack: Mutex<Stack>,
    available: Notify,
    allocator: Arc<dyn Allocator>,
    events: EventBus,
    timeouts: WatcherTimeouts,
}

impl WorkerWatcher {
    pub fn new(
        allocator: Arc<dyn Allocator>,
        events: EventBus,
        timeouts: WatcherTimeouts,
    ) -> Self {
        Self {
            stack: Mutex::new(Stack::default()),
            available: Notify::new(),
            allocator,
            events,
            timeouts,
        }
    }

    /// Register ready workers, push them idle and wait on their exit.
    pub async fn watch(self: &Arc<Self>, workers: Vec<Arc<WorkerProcess>>) {
        {
            let mut stack = self.stack.lock().await;
            for worker in &workers {
                stack.register(worker.clone());
                stack.push(worker.id());
            }
        }
        for worker in workers {
            self.spawn_waiter(worker);
            self.available.notify_one();
        }
    }

    /// Pop the most recently used idle worker, waiting while none is free.
    ///
    /// Fails with [`Error::WatcherStopped`] once destroy started and with
    /// [`Error::NoFreeWorkers`] after the safety ceiling. Cancelling the
    /// returned future never loses a worker.
    pub async fn take(&self) -> Result<Arc<WorkerProcess>> {
        let ceiling = self.timeouts.no_free_workers;
        let deadline = Instant::now() + ceiling;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut stack = self.stack.lock().await;
                if stack.destroy {
                    return Err(Error::WatcherStopped);
                }
                while let Some(worker) = stack.pop() {
                    if worker.status() == WorkerStatus::Ready {
                        return Ok(worker);
                    }
                    debug!(
                        pid = ?worker.pid(),
                        status = %worker.status(),
                        "dropping unusable idle worker"
                    );
                    worker.state().set_unless_destroyed(WorkerStatus::Invalid);
                    if let Err(e) = worker.kill() {
                        warn!(pid = ?worker.pid(), error = %e, "failed to kill removed worker");
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!(timeout = ?ceiling, "no free workers in the stack");
                self.events.publish(Event::pool(
                    PoolEventKind::NoFreeWorkers,
                    format!("no free workers after {:?}", ceiling),
                ));
                return Err(Error::NoFreeWorkers(ceiling));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(RECHECK_INTERVAL) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Return a worker taken with [`take`](Self::take).
    ///
    /// `Ready` workers go back on the stack; anything else is retired and
    /// replaced by its waiter once the process is gone.
    pub async fn release(&self, worker: Arc<WorkerProcess>) {
        {
            let mut stack = self.stack.lock().await;
            if worker.status() == WorkerStatus::Ready {
                if stack.push(worker.id()) {
                    drop(stack);
                    self.available.notify_one();
                }
                return;
            }
        }
        self.retire(worker);
    }

    fn retire(&self, worker: Arc<WorkerProcess>) {
        match worker.status() {
            WorkerStatus::MaxJobsReached | WorkerStatus::Invalid => {
                let timeout = self.timeouts.destroy;
                tokio::spawn(async move {
                    if let Err(e) = worker.stop(timeout).await {
                        warn!(pid = ?worker.pid(), error = %e, "failed to stop retired worker");
                    }
                });
            }
            WorkerStatus::Stopping
            | WorkerStatus::Killing
            | WorkerStatus::Stopped
            | WorkerStatus::Destroyed => {}
            status => {
                debug!(pid = ?worker.pid(), status = %status, "killing retired worker");
                if let Err(e) = worker.kill() {
                    warn!(pid = ?worker.pid(), error = %e, "failed to kill retired worker");
                }
            }
        }
    }

    /// Allocate one worker and add it to the stack, retrying until the
    /// allocate timeout.
    ///
    /// A worker that finishes starting after a destroy or reset began is
    /// killed instead of joining the next generation of the pool.
    pub async fn allocate_new(self: &Arc<Self>) -> Result<Arc<WorkerProcess>> {
        let deadline = Instant::now() + self.timeouts.allocate;
        let generation = {
            let stack = self.stack.lock().await;
            if stack.destroy {
                return Err(Error::WatcherStopped);
            }
            stack.generation
        };

        loop {
            {
                let stack = self.stack.lock().await;
                if stack.destroy || stack.generation != generation {
                    return Err(Error::WatcherStopped);
                }
            }

            match self.allocator.allocate().await {
                Ok(worker) => {
                    {
                        let mut stack = self.stack.lock().await;
                        if stack.destroy || stack.generation != generation {
                            drop(stack);
                            debug!(pid = ?worker.pid(), "dropping worker allocated before destroy");
                            worker.state().set(WorkerStatus::Destroyed);
                            let _ = worker.kill();
                            return Err(Error::WatcherStopped);
                        }
                        stack.register(worker.clone());
                        stack.push(worker.id());
                    }
                    self.spawn_waiter(worker.clone());
                    self.available.notify_one();
                    return Ok(worker);
                }
                Err(e) if Instant::now() + REPLACE_RETRY_INTERVAL < deadline => {
                    warn!(error = %e, "worker allocation failed, retrying");
                    tokio::time::sleep(REPLACE_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evict a worker.
    ///
    /// An idle worker is killed right away. A checked-out worker is marked
    /// `Remove` and destroyed when released. Returns false when the worker is
    /// unknown or already being removed.
    pub async fn remove_worker(&self, worker: &WorkerProcess) -> Result<bool> {
        let mut stack = self.stack.lock().await;
        if !stack.workers.contains_key(&worker.id()) {
            return Ok(false);
        }

        if stack.unmark_idle(worker.id()) {
            drop(stack);
            worker.state().set_unless_destroyed(WorkerStatus::Invalid);
            worker.kill()?;
            return Ok(true);
        }

        let state = worker.state();
        let flagged = state.transition(WorkerStatus::Working, WorkerStatus::Remove)
            || state.transition(WorkerStatus::Ready, WorkerStatus::Remove);
        Ok(flagged)
    }

    /// Stop handing out workers, wait up to `timeout` for checked-out ones,
    /// then kill every worker and forget it.
    pub async fn destroy(&self, timeout: Duration) {
        {
            let mut stack = self.stack.lock().await;
            stack.destroy = true;
            stack.generation += 1;
        }
        self.available.notify_waiters();

        let deadline = Instant::now() + timeout;
        loop {
            {
                let stack = self.stack.lock().await;
                if stack.idle_count >= stack.workers.len() {
                    break;
                }
            }
            if Instant::now() >= deadline {
                warn!(timeout = ?timeout, "workers still busy, destroying anyway");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let workers = self.stack.lock().await.clear();
        for worker in &workers {
            worker.state().set(WorkerStatus::Destroyed);
            if let Err(e) = worker.kill() {
                warn!(pid = ?worker.pid(), error = %e, "failed to kill worker");
            }
        }

        let exited = join_all(workers.iter().map(|worker| worker.exited()));
        if tokio::time::timeout(timeout, exited).await.is_err() {
            error!(timeout = ?timeout, "workers did not exit after SIGKILL");
        }
        info!(count = workers.len(), "worker watcher destroyed");
    }

    /// Destroy every worker, then accept new ones again.
    pub async fn reset(&self, timeout: Duration) {
        self.destroy(timeout).await;
        self.stack.lock().await.destroy = false;
    }

    /// All tracked workers, idle and checked out, ordered by id.
    pub async fn workers(&self) -> Vec<Arc<WorkerProcess>> {
        let stack = self.stack.lock().await;
        let mut workers: Vec<_> = stack.workers.values().map(|s| s.worker.clone()).collect();
        workers.sort_by_key(|w| w.id());
        workers
    }

    pub async fn len(&self) -> usize {
        self.stack.lock().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_destroyed(&self) -> bool {
        self.stack.lock().await.destroy
    }

    fn spawn_waiter(self: &Arc<Self>, worker: Arc<WorkerProcess>) {
        let watcher = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = worker.wait().await;
            on_exit(watcher, worker, result).await;
        });
    }
}

async fn on_exit(watcher: Weak<WorkerWatcher>, worker: Arc<WorkerProcess>, result: Result<()>) {
    let Some(watcher) = watcher.upgrade() else {
        return;
    };
    let pid = worker.pid().unwrap_or_default();

    if let Err(e) = &result {
        warn!(pid = pid, error = %e, "worker exited with error");
        watcher
            .events
            .publish(Event::worker_detail(WorkerEventKind::WorkerError, pid, e.to_string()));
    }

    let destroying = {
        let mut stack = watcher.stack.lock().await;
        stack.unregister(worker.id());
        stack.destroy
    };
    watcher
        .events
        .publish(Event::worker(WorkerEventKind::WorkerDestruct, pid));

    if destroying || worker.status() == WorkerStatus::Destroyed {
        return;
    }

    debug!(pid = pid, "replacing exited worker");
    if let Err(e) = watcher.allocate_new().await {
        if matches!(e, Error::WatcherStopped) {
            return;
        }
        error!(error = %e, "failed to replace worker");
        watcher
            .events
            .publish(Event::pool(PoolEventKind::PoolError, e.to_string()));
        if watcher.is_empty().await {
            error!("no workers left in the pool");
            watcher.events.publish(Event::pool(
                PoolEventKind::PoolRestart,
                format!("all workers are gone: {}", e),
            ));
        }
    }
}

impl Drop for WorkerWatcher {
    fn drop(&mut self) {
        for slot in self.stack.get_mut().workers.values() {
            let _ = slot.worker.kill();
        }
    }
}
