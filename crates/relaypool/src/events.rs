// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool events and their non-blocking delivery.
//!
//! Events are published on a broadcast channel. Publishing never waits for
//! listeners: a listener that falls behind skips the oldest events and gets
//! a lag warning instead of stalling the pool or the supervisor.

use std::fmt;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of events buffered per listener.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Worker-scoped event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerEventKind {
    /// A worker was spawned and connected.
    WorkerConstruct,
    /// A worker process is gone.
    WorkerDestruct,
    /// A worker failed (crash, relay error).
    WorkerError,
    /// A line written by the worker to stderr.
    WorkerStderr,
    /// Evicted for exceeding its time to live.
    Ttl,
    /// Evicted for being idle too long.
    IdleTtl,
    /// Evicted for exceeding the per-worker memory limit.
    MaxMemory,
    /// Killed for exceeding the per-request execution limit.
    ExecTtl,
}

/// Pool-scoped event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    /// Replacement allocation failed.
    PoolError,
    /// Every worker is gone and could not be replaced; the pool needs a rebuild.
    PoolRestart,
    /// The stack stayed empty for the whole safety ceiling.
    NoFreeWorkers,
    /// The pool was destroyed for exceeding the total memory limit.
    MaxPoolMemory,
    /// A supervisor tick was aborted.
    SupervisorError,
}

/// Runtime-level event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    /// The runtime started its pool.
    Started,
    /// The runtime shut down.
    Stopped,
    /// The pool could not be rebuilt.
    Failure,
}

/// Event about one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub kind: WorkerEventKind,
    pub pid: u32,
    pub detail: Option<String>,
}

/// Event about the pool as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub detail: String,
}

/// Event about the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub kind: ServerEventKind,
    pub detail: Option<String>,
}

/// Any event published by the pool, the supervisor or the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Worker(WorkerEvent),
    Pool(PoolEvent),
    Server(ServerEvent),
}

impl Event {
    /// Worker event without detail.
    pub fn worker(kind: WorkerEventKind, pid: u32) -> Self {
        Event::Worker(WorkerEvent {
            kind,
            pid,
            detail: None,
        })
    }

    /// Worker event with a detail message.
    pub fn worker_detail(kind: WorkerEventKind, pid: u32, detail: impl Into<String>) -> Self {
        Event::Worker(WorkerEvent {
            kind,
            pid,
            detail: Some(detail.into()),
        })
    }

    /// Pool event.
    pub fn pool(kind: PoolEventKind, detail: impl Into<String>) -> Self {
        Event::Pool(PoolEvent {
            kind,
            detail: detail.into(),
        })
    }

    /// Runtime event.
    pub fn server(kind: ServerEventKind, detail: Option<String>) -> Self {
        Event::Server(ServerEvent { kind, detail })
    }

    /// Worker event kind, if this is a worker event.
    pub fn worker_kind(&self) -> Option<WorkerEventKind> {
        match self {
            Event::Worker(event) => Some(event.kind),
            _ => None,
        }
    }

    /// Pool event kind, if this is a pool event.
    pub fn pool_kind(&self) -> Option<PoolEventKind> {
        match self {
            Event::Pool(event) => Some(event.kind),
            _ => None,
        }
    }

    /// Pid of the worker, for worker events.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Event::Worker(event) => Some(event.pid),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Worker(e) => match &e.detail {
                Some(detail) => write!(f, "{:?} (pid {}): {}", e.kind, e.pid, detail),
                None => write!(f, "{:?} (pid {})", e.kind, e.pid),
            },
            Event::Pool(e) => write!(f, "{:?}: {}", e.kind, e.detail),
            Event::Server(e) => match &e.detail {
                Some(detail) => write!(f, "{:?}: {}", e.kind, detail),
                None => write!(f, "{:?}", e.kind),
            },
        }
    }
}

/// Cloneable handle for publishing and subscribing to events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per listener.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Never blocks; dropped when nobody listens.
    pub fn publish(&self, event: Event) {
        debug!(event = %event, "pool event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Run `listener` for every event on a dedicated task.
    ///
    /// The task ends when every publisher is dropped; abort the returned
    /// handle to detach earlier.
    pub fn add_listener<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "event listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
