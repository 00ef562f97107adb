// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control commands and response classification.
//!
//! Control messages travel as JSON in the context of a `CONTROL` frame:
//!
//! | Direction | Message | Meaning |
//! |-----------|---------|---------|
//! | pool → worker | `{"pid": <pool pid>}` | handshake, worker must answer with its own pid |
//! | worker → pool | `{"pid": <worker pid>}` | handshake reply |
//! | pool → worker | `{"stop": true}` | graceful shutdown |
//! | worker → pool | `{"stop": true}` | worker asks to be replaced (also accepted as a data frame with an empty body) |

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::{Frame, FrameError};
use crate::payload::Payload;
use crate::relay::Relay;

/// Raw context of the stop sentinel.
pub const STOP_CONTEXT: &[u8] = br#"{"stop":true}"#;

/// Pid handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidCommand {
    pub pid: u32,
}

/// Stop message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub stop: bool,
}

impl StopCommand {
    pub fn new() -> Self {
        Self { stop: true }
    }
}

impl Default for StopCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a control command over a relay.
pub async fn send_control<R, T>(relay: &mut R, command: &T) -> Result<(), FrameError>
where
    R: Relay + ?Sized,
    T: Serialize + Sync,
{
    relay.send(&Frame::control(command)?).await
}

/// Run the pid handshake and return the pid reported by the worker.
pub async fn fetch_pid<R: Relay + ?Sized>(relay: &mut R) -> Result<u32, FrameError> {
    let ours = PidCommand {
        pid: std::process::id(),
    };
    send_control(relay, &ours).await?;

    let reply = relay.receive().await?;
    if !reply.is_control() {
        return Err(FrameError::UnexpectedFrame(
            "expected a control frame with the worker pid",
        ));
    }
    let theirs: PidCommand = reply.decode_control()?;
    debug!(worker_pid = theirs.pid, "relay handshake completed");
    Ok(theirs.pid)
}

/// True when the frame is a stop request: a `CONTROL` frame with
/// `{"stop":true}`, or a data frame with an empty body and that context.
pub fn is_stop_request(frame: &Frame) -> bool {
    if frame.is_error() || !frame.body.is_empty() || frame.context.is_empty() {
        return false;
    }
    serde_json::from_slice::<StopCommand>(&frame.context)
        .map(|command| command.stop)
        .unwrap_or(false)
}

/// A worker's answer to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Regular result.
    Payload(Payload),
    /// Job-level failure; the worker remains usable.
    Error(String),
    /// The worker wants to be replaced; the request was not handled.
    StopRequested,
}

impl Response {
    /// Classify a response frame.
    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        if is_stop_request(&frame) {
            return Ok(Response::StopRequested);
        }
        if frame.is_error() {
            return Ok(Response::Error(
                String::from_utf8_lossy(&frame.body).into_owned(),
            ));
        }
        if frame.is_control() {
            return Err(FrameError::UnexpectedFrame(
                "control frame received in place of a response",
            ));
        }
        Ok(Response::Payload(frame.into_payload()))
    }
}
