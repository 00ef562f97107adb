// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side end of a relay.
//!
//! A worker process creates a [`WorkerEndpoint`], then loops over
//! [`WorkerEndpoint::next_request`] answering each request with exactly one
//! of [`respond`](WorkerEndpoint::respond),
//! [`respond_error`](WorkerEndpoint::respond_error) or
//! [`request_stop`](WorkerEndpoint::request_stop). Handshakes and stop
//! commands are handled by the endpoint.
//!
//! ```ignore
//! let mut endpoint = WorkerEndpoint::from_env().await?;
//! while let Some(request) = endpoint.next_request().await? {
//!     endpoint.respond(&request).await?;
//! }
//! ```

use tokio::net::TcpStream;
use tracing::debug;

use crate::addr::{RELAY_ENV, RelayAddr};
use crate::control::{PidCommand, STOP_CONTEXT, StopCommand, send_control};
use crate::frame::{Frame, FrameError};
use crate::payload::Payload;
use crate::relay::{Relay, StreamRelay, TcpRelay};

/// Worker-side relay endpoint.
pub struct WorkerEndpoint {
    relay: Box<dyn Relay>,
    pid: u32,
}

impl WorkerEndpoint {
    /// Wrap an existing relay.
    pub fn new(relay: impl Relay + 'static) -> Self {
        Self {
            relay: Box::new(relay),
            pid: std::process::id(),
        }
    }

    /// Endpoint over the process stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(StreamRelay::new(tokio::io::stdin(), tokio::io::stdout()))
    }

    /// Connect to the pool at the given address.
    ///
    /// Socket endpoints answer the pool's pid handshake once the pool
    /// sends it, as part of the first [`next_request`](Self::next_request).
    pub async fn connect(addr: &RelayAddr) -> Result<Self, FrameError> {
        match addr {
            RelayAddr::Pipes => Ok(Self::stdio()),
            RelayAddr::Tcp(host) => {
                let stream = TcpStream::connect(host.as_str()).await?;
                Ok(Self::new(TcpRelay::from_tcp(stream)))
            }
            #[cfg(unix)]
            RelayAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Self::new(crate::relay::UnixRelay::from_unix(stream)))
            }
            #[cfg(not(unix))]
            RelayAddr::Unix(_) => Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ))),
        }
    }

    /// Connect using the address in `RELAYPOOL_RELAY` (pipes when unset).
    pub async fn from_env() -> Result<Self, FrameError> {
        let addr = match std::env::var(RELAY_ENV) {
            Ok(raw) => raw.parse().map_err(|e: crate::addr::RelayAddrError| {
                FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e.to_string(),
                ))
            })?,
            Err(_) => RelayAddr::Pipes,
        };
        Self::connect(&addr).await
    }

    /// Override the pid reported during the handshake.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Wait for the next request.
    ///
    /// Returns `Ok(None)` when the pool asks the worker to stop or closes
    /// the relay.
    pub async fn next_request(&mut self) -> Result<Option<Payload>, FrameError> {
        loop {
            let frame = match self.relay.receive().await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e),
            };

            if !frame.is_control() {
                return Ok(Some(frame.into_payload()));
            }

            if let Ok(stop) = frame.decode_control::<StopCommand>() {
                if stop.stop {
                    debug!("stop command received");
                    return Ok(None);
                }
                continue;
            }

            let handshake: PidCommand = frame.decode_control()?;
            debug!(pool_pid = handshake.pid, "answering pid handshake");
            send_control(self.relay.as_mut(), &PidCommand { pid: self.pid }).await?;
        }
    }

    /// Answer the current request.
    pub async fn respond(&mut self, payload: &Payload) -> Result<(), FrameError> {
        self.relay.send(&Frame::data(payload)).await
    }

    /// Report a job-level error for the current request.
    pub async fn respond_error(&mut self, message: &str) -> Result<(), FrameError> {
        self.relay.send(&Frame::error(message)).await
    }

    /// Refuse the current request and ask the pool for a replacement.
    ///
    /// The pool retries the request on another worker.
    pub async fn request_stop(&mut self) -> Result<(), FrameError> {
        let sentinel = Payload::new(STOP_CONTEXT, "");
        self.relay.send(&Frame::data(&sentinel)).await
    }

    /// Close the relay.
    pub async fn close(mut self) -> Result<(), FrameError> {
        self.relay.close().await
    }
}
