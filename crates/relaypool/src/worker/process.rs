// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A single supervised worker process and its relay.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use relaypool_protocol::{
    Frame, FrameError, Payload, Relay, Response, StopCommand, fetch_pid, send_control,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ExecOutcome;
use super::state::{WorkerState, WorkerStatus, from_micros, now_micros};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, WorkerEventKind};

/// Upper bound of the stderr kept per worker.
pub const MAX_STDERR_BYTES: usize = 10 * 1024;

/// How long `wait` keeps draining stderr after the process exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One external worker process.
///
/// Created by a [`Factory`](crate::factory::Factory): the factory starts the
/// process, attaches the relay and performs the pid handshake before the
/// worker is marked `Ready`. Exactly one task is expected to call
/// [`wait`](Self::wait); [`stop`](Self::stop) relies on it to observe the exit.
pub struct WorkerProcess {
    id: u64,
    state: WorkerState,
    created: AtomicI64,
    command: Mutex<Option<Command>>,
    child: Mutex<Option<Child>>,
    pid: OnceLock<u32>,
    relay: tokio::sync::Mutex<Option<Box<dyn Relay>>>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    exited: watch::Sender<bool>,
    kill_requested: Notify,
    events: EventBus,
}

impl WorkerProcess {
    /// Wrap a command that has not been spawned yet.
    pub fn new(mut command: Command, events: EventBus) -> Self {
        command.kill_on_drop(true);
        let (exited, _) = watch::channel(false);
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            state: WorkerState::new(WorkerStatus::Inactive),
            created: AtomicI64::new(now_micros()),
            command: Mutex::new(Some(command)),
            child: Mutex::new(None),
            pid: OnceLock::new(),
            relay: tokio::sync::Mutex::new(None),
            stderr: Arc::new(Mutex::new(String::new())),
            stderr_task: Mutex::new(None),
            exited,
            kill_requested: Notify::new(),
            events,
        }
    }

    /// Spawn the process and start collecting its stderr.
    pub fn start(&self) -> Result<()> {
        let mut command = lock(&self.command).take().ok_or(Error::AlreadyStarted)?;
        let mut child = command.spawn().map_err(Error::ProcessStart)?;
        let pid = child.id().ok_or(Error::NotStarted)?;
        let _ = self.pid.set(pid);
        self.created.store(now_micros(), Ordering::Release);

        if let Some(stderr) = child.stderr.take() {
            let task = spawn_stderr_reader(stderr, pid, self.stderr.clone(), self.events.clone());
            *lock(&self.stderr_task) = Some(task);
        }
        *lock(&self.child) = Some(child);

        debug!(worker_id = self.id, pid = pid, "worker process started");
        Ok(())
    }

    /// Take the piped stdout and stdin of the process.
    pub fn take_pipes(&self) -> Result<(ChildStdout, ChildStdin)> {
        let mut guard = lock(&self.child);
        let child = guard.as_mut().ok_or(Error::NotStarted)?;
        match (child.stdout.take(), child.stdin.take()) {
            (Some(stdout), Some(stdin)) => Ok((stdout, stdin)),
            _ => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdio is not piped",
            ))),
        }
    }

    /// Attach the relay used by [`exec`](Self::exec).
    pub async fn attach_relay(&self, relay: Box<dyn Relay>) {
        *self.relay.lock().await = Some(relay);
    }

    /// Run the pid handshake over the attached relay.
    pub async fn handshake(&self) -> Result<()> {
        let expected = self.pid().ok_or(Error::NotStarted)?;
        let mut guard = self.relay.lock().await;
        let relay = guard.as_mut().ok_or(FrameError::ConnectionClosed)?;
        let actual = fetch_pid(relay.as_mut()).await?;
        if actual != expected {
            return Err(Error::PidMismatch { expected, actual });
        }
        Ok(())
    }

    /// Send one request and read its response.
    ///
    /// Only valid while `Ready`. Job errors leave the worker usable; relay
    /// failures mark it `Errored`.
    pub async fn exec(&self, payload: &Payload) -> Result<ExecOutcome> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if !self.state.transition(WorkerStatus::Ready, WorkerStatus::Working) {
            return Err(Error::NotReady(self.state.status()));
        }

        let response = {
            let mut guard = self.relay.lock().await;
            match guard.as_mut() {
                Some(relay) => round_trip(relay.as_mut(), payload).await,
                None => Err(FrameError::ConnectionClosed),
            }
        };

        match response {
            Ok(Response::Payload(result)) => {
                self.state.register_exec();
                self.state.transition(WorkerStatus::Working, WorkerStatus::Ready);
                Ok(ExecOutcome::Payload(result))
            }
            Ok(Response::Error(message)) => {
                self.state.register_exec();
                self.state.transition(WorkerStatus::Working, WorkerStatus::Ready);
                Err(Error::Job(message))
            }
            Ok(Response::StopRequested) => {
                debug!(pid = ?self.pid(), "worker asked to be replaced");
                self.state.transition(WorkerStatus::Working, WorkerStatus::Invalid);
                Ok(ExecOutcome::StopRequested)
            }
            Err(e) => {
                self.state.transition(WorkerStatus::Working, WorkerStatus::Errored);
                Err(Error::Protocol(e))
            }
        }
    }

    /// Wait for the process to exit and record its terminal status.
    ///
    /// An exit the pool did not ask for, with a non-zero code or a signal,
    /// is returned as [`Error::ProcessExit`] with the captured stderr.
    pub async fn wait(&self) -> Result<()> {
        let mut child = lock(&self.child).take().ok_or(Error::NotStarted)?;
        // Kill requests are delivered here while the child is not reaped yet,
        // so the signal can never reach a recycled pid.
        let exit = tokio::select! {
            exit = child.wait() => exit,
            _ = self.kill_requested.notified() => {
                if let Some(pid) = child.id()
                    && let Err(e) = send_sigkill(pid)
                {
                    warn!(pid = pid, error = %e, "failed to kill worker");
                }
                child.wait().await
            }
        };
        drop(child);
        self.exited.send_replace(true);

        let task = lock(&self.stderr_task).take();
        if let Some(task) = task
            && tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err()
        {
            debug!(pid = ?self.pid(), "stderr reader still open after exit");
        }

        if let Ok(mut guard) = self.relay.try_lock()
            && let Some(mut relay) = guard.take()
        {
            let _ = relay.close().await;
        }

        let induced = self.state.status().is_induced_exit();
        let result = match exit {
            Ok(status) if status.success() || induced => Ok(()),
            Ok(status) => Err(Error::ProcessExit {
                code: status.code(),
                stderr: self.stderr_output(),
            }),
            Err(e) => Err(Error::Io(e)),
        };

        let terminal = if result.is_ok() {
            WorkerStatus::Stopped
        } else {
            WorkerStatus::Errored
        };
        self.state.set_unless_destroyed(terminal);
        result
    }

    /// Ask the worker to exit, killing it if it has not exited in `timeout`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.state.set_unless_destroyed(WorkerStatus::Stopping);

        // A relay busy with an exec can't carry the stop; the timeout covers it.
        if let Ok(mut guard) = self.relay.try_lock()
            && let Some(relay) = guard.as_mut()
            && let Err(e) = send_control(relay.as_mut(), &StopCommand::new()).await
        {
            debug!(pid = ?self.pid(), error = %e, "failed to send stop command");
        }

        if tokio::time::timeout(timeout, self.exited()).await.is_ok() {
            return Ok(());
        }
        warn!(pid = ?self.pid(), timeout = ?timeout, "worker did not stop in time, killing");
        self.kill()
    }

    /// Send SIGKILL without waiting for the exit.
    ///
    /// The signal is only sent through a child handle that has not been
    /// reaped: directly while the handle is parked here, or by
    /// [`wait`](Self::wait) once it owns the handle.
    pub fn kill(&self) -> Result<()> {
        if self.pid().is_none() || self.has_exited() {
            return Ok(());
        }
        self.state.set_unless_destroyed(WorkerStatus::Killing);

        let guard = lock(&self.child);
        if let Some(pid) = guard.as_ref().and_then(|child| child.id()) {
            return send_sigkill(pid);
        }
        drop(guard);

        self.kill_requested.notify_one();
        Ok(())
    }

    /// Resolves once the process has exited and been reaped.
    pub async fn exited(&self) {
        let mut rx = self.exited.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    /// True once the process has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Stderr captured so far (at most [`MAX_STDERR_BYTES`]).
    pub fn stderr_output(&self) -> String {
        lock(&self.stderr).clone()
    }

    /// Watcher-local identifier, unique per process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS pid, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// When the process was started.
    pub fn created(&self) -> DateTime<Utc> {
        from_micros(self.created.load(Ordering::Acquire))
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.status()
    }

    pub fn num_execs(&self) -> u64 {
        self.state.num_execs()
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.state.last_used()
    }

    /// Lock-free state shared with the watcher and the supervisor.
    pub fn state(&self) -> &WorkerState {
        &self.state
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("pid", &self.pid())
            .field("status", &self.status())
            .field("num_execs", &self.num_execs())
            .finish()
    }
}

fn send_sigkill(pid: u32) -> Result<()> {
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {
            info!(pid = pid, "sent SIGKILL to worker");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid = pid, "worker already dead (ESRCH)");
            Ok(())
        }
        Err(e) => Err(Error::Signal(e)),
    }
}

async fn round_trip(
    relay: &mut dyn Relay,
    payload: &Payload,
) -> std::result::Result<Response, FrameError> {
    relay.send(&Frame::data(payload)).await?;
    let frame = relay.receive().await?;
    Response::from_frame(frame)
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    pid: u32,
    buffer: Arc<Mutex<String>>,
    events: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    append_capped(&mut lock(&buffer), &line);
                    let line = line.trim_end();
                    debug!(pid = pid, line = %line, "worker stderr");
                    events.publish(Event::worker_detail(
                        WorkerEventKind::WorkerStderr,
                        pid,
                        line,
                    ));
                }
                Err(e) => {
                    debug!(pid = pid, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

/// Append `text`, dropping the oldest bytes beyond [`MAX_STDERR_BYTES`].
fn append_capped(buffer: &mut String, text: &str) {
    buffer.push_str(text);
    if buffer.len() <= MAX_STDERR_BYTES {
        return;
    }
    let mut cut = buffer.len() - MAX_STDERR_BYTES;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}
