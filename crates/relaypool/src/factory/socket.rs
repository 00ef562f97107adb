// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workers connecting back over TCP or a Unix socket.
//!
//! The factory owns the listener. Every accepted connection goes through the
//! pid handshake on its own task and is parked under the pid the worker
//! reported; `spawn_worker` picks up the relay whose pid matches the process
//! it just started.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use relaypool_protocol::{RELAY_ENV, Relay, RelayAddr, TcpRelay, UnixRelay, fetch_pid};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Factory;
use crate::command::WorkerCommand;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::worker::{WorkerProcess, WorkerStatus};

struct Parked {
    relay: Box<dyn Relay>,
    since: Instant,
}

/// Connections past the handshake, waiting for their worker.
///
/// A relay nobody claims within `max_age` (its spawn gave up, or the worker
/// reported a pid the pool never started) is dropped on the next arrival.
struct Pending {
    relays: Mutex<HashMap<u32, Parked>>,
    arrived: Notify,
    max_age: Duration,
}

impl Pending {
    fn new(max_age: Duration) -> Self {
        Self {
            relays: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            max_age,
        }
    }

    fn relays(&self) -> MutexGuard<'_, HashMap<u32, Parked>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, pid: u32, relay: Box<dyn Relay>) {
        let now = Instant::now();
        {
            let mut relays = self.relays();
            let before = relays.len();
            relays.retain(|_, parked| now.duration_since(parked.since) < self.max_age);
            let evicted = before - relays.len();
            if evicted > 0 {
                debug!(count = evicted, "dropped unclaimed worker connections");
            }
            relays.insert(pid, Parked { relay, since: now });
        }
        self.arrived.notify_waiters();
    }

    fn take(&self, pid: u32) -> Option<Box<dyn Relay>> {
        self.relays().remove(&pid).map(|parked| parked.relay)
    }
}

/// Factory for workers that connect to a listener owned by the pool.
pub struct SocketFactory {
    addr: RelayAddr,
    relay_timeout: Duration,
    pending: Arc<Pending>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketFactory {
    /// Bind the listener for `addr` and start accepting workers.
    ///
    /// TCP port `0` binds an ephemeral port; [`relay_addr`](Self::relay_addr)
    /// returns the address actually bound. A stale Unix socket file is
    /// replaced.
    pub async fn bind(addr: &RelayAddr, relay_timeout: Duration) -> Result<Self> {
        let pending = Arc::new(Pending::new(relay_timeout));

        let (addr, accept_task) = match addr {
            RelayAddr::Tcp(host) => {
                let listener = TcpListener::bind(host.as_str()).await?;
                let local = listener.local_addr()?;
                let task = tokio::spawn(accept_tcp(listener, pending.clone(), relay_timeout));
                (RelayAddr::Tcp(local.to_string()), task)
            }
            RelayAddr::Unix(path) => {
                remove_socket_file(path);
                let listener = UnixListener::bind(path)?;
                let task = tokio::spawn(accept_unix(listener, pending.clone(), relay_timeout));
                (RelayAddr::Unix(path.clone()), task)
            }
            RelayAddr::Pipes => {
                return Err(Error::InvalidConfig {
                    field: "relay",
                    reason: "socket factory needs a tcp:// or unix:// address",
                });
            }
        };

        info!(relay = %addr, "worker relay listening");
        Ok(Self {
            addr,
            relay_timeout,
            pending,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address workers connect to.
    pub fn relay_addr(&self) -> &RelayAddr {
        &self.addr
    }

    /// Wait until the relay of `pid` arrives or the deadline passes.
    async fn wait_relay(&self, pid: u32, deadline: Instant) -> Option<Box<dyn Relay>> {
        loop {
            let notified = self.pending.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(relay) = self.pending.take(pid) {
                return Some(relay);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pending.take(pid);
            }
        }
    }

    fn stop_accepting(&self) {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl Factory for SocketFactory {
    fn factory_type(&self) -> &'static str {
        match self.addr {
            RelayAddr::Unix(_) => "unix",
            _ => "tcp",
        }
    }

    async fn spawn_worker(
        &self,
        command: &WorkerCommand,
        events: &EventBus,
    ) -> Result<WorkerProcess> {
        let mut process = command.build();
        process
            .env(RELAY_ENV, self.addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let worker = WorkerProcess::new(process, events.clone());
        worker.start()?;
        let pid = worker.pid().ok_or(Error::NotStarted)?;

        let deadline = Instant::now() + self.relay_timeout;
        let Some(relay) = self.wait_relay(pid, deadline).await else {
            warn!(pid = pid, timeout = ?self.relay_timeout, "worker did not connect in time");
            let _ = worker.kill();
            return Err(Error::RelayTimeout(self.relay_timeout));
        };

        worker.attach_relay(relay).await;
        worker.state().set(WorkerStatus::Ready);
        debug!(pid = pid, relay = %self.addr, "socket worker ready");
        Ok(worker)
    }

    async fn close(&self) -> Result<()> {
        self.stop_accepting();
        self.pending.relays().clear();
        if let RelayAddr::Unix(path) = &self.addr {
            remove_socket_file(path);
        }
        Ok(())
    }
}

impl Drop for SocketFactory {
    fn drop(&mut self) {
        self.stop_accepting();
    }
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove socket file"),
    }
}

async fn accept_tcp(listener: TcpListener, pending: Arc<Pending>, timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "worker connected");
                let relay = Box::new(TcpRelay::from_tcp(stream));
                tokio::spawn(register(relay, pending.clone(), timeout));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept worker connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_unix(listener: UnixListener, pending: Arc<Pending>, timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                debug!("worker connected");
                let relay = Box::new(UnixRelay::from_unix(stream));
                tokio::spawn(register(relay, pending.clone(), timeout));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept worker connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn register(mut relay: Box<dyn Relay>, pending: Arc<Pending>, timeout: Duration) {
    match tokio::time::timeout(timeout, fetch_pid(relay.as_mut())).await {
        Ok(Ok(pid)) => pending.insert(pid, relay),
        Ok(Err(e)) => warn!(error = %e, "worker handshake failed"),
        Err(_) => warn!(timeout = ?timeout, "worker handshake timed out"),
    }
}
