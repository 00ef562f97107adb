// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for relay framing.
//!
//! Every message exchanged with a worker is a single frame:
//! - 1 byte: protocol version
//! - 1 byte: flags (`CONTROL`, `ERROR`)
//! - 4 bytes: context length (big-endian)
//! - 4 bytes: body length (big-endian)
//! - N bytes: context, followed by the body

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::payload::Payload;

/// Maximum combined context + body size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (1 byte version + 1 byte flags + 4 bytes context length + 4 bytes body length)
pub const HEADER_SIZE: usize = 10;

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame flags.
///
/// A frame without flags carries a regular payload.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    /// Regular data frame
    pub const DATA: Flags = Flags(0x00);
    /// Control message (pid handshake, stop)
    pub const CONTROL: Flags = Flags(0x01);
    /// Job-level error reported by the worker
    pub const ERROR: Flags = Flags(0x02);

    const KNOWN: u8 = Self::CONTROL.0 | Self::ERROR.0;

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Parse flag bits, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Result<Self, FrameError> {
        if bits & !Self::KNOWN != 0 {
            return Err(FrameError::InvalidFlags(bits));
        }
        Ok(Flags(bits))
    }

    /// True when every bit of `other` is set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Flags::CONTROL) {
            names.push("CONTROL");
        }
        if self.contains(Flags::ERROR) {
            names.push("ERROR");
        }
        if names.is_empty() {
            names.push("DATA");
        }
        write!(f, "Flags({})", names.join(" | "))
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid frame flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control message error: {0}")]
    Control(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with flags, context and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: Flags,
    pub context: Bytes,
    pub body: Bytes,
}

impl Frame {
    /// Create a data frame carrying a payload
    pub fn data(payload: &Payload) -> Self {
        Self {
            flags: Flags::DATA,
            context: payload.context.clone(),
            body: payload.body.clone(),
        }
    }

    /// Create an error frame; the message travels in the body
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            flags: Flags::ERROR,
            context: Bytes::new(),
            body: Bytes::from(message.into()),
        }
    }

    /// Create a control frame with a JSON-encoded command in the context
    pub fn control<T: Serialize>(command: &T) -> Result<Self, FrameError> {
        let context = serde_json::to_vec(command)?;
        Ok(Self {
            flags: Flags::CONTROL,
            context: Bytes::from(context),
            body: Bytes::new(),
        })
    }

    /// True for control frames
    pub fn is_control(&self) -> bool {
        self.flags.contains(Flags::CONTROL)
    }

    /// True for frames reporting a job-level error
    pub fn is_error(&self) -> bool {
        self.flags.contains(Flags::ERROR)
    }

    /// Decode the context of a control frame
    pub fn decode_control<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        if !self.is_control() {
            return Err(FrameError::UnexpectedFrame("expected a control frame"));
        }
        Ok(serde_json::from_slice(&self.context)?)
    }

    /// Combined size of context and body
    pub fn payload_len(&self) -> usize {
        self.context.len() + self.body.len()
    }

    /// Convert into a payload, dropping the flags
    pub fn into_payload(self) -> Payload {
        Payload {
            context: self.context,
            body: self.body,
        }
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        if self.payload_len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(self.payload_len()));
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload_len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.context.len() as u32);
        buf.put_u32(self.body.len() as u32);
        buf.put(self.context.clone());
        buf.put(self.body.clone());
        Ok(buf.freeze())
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let header = Header::parse(&bytes[..HEADER_SIZE])?;
        bytes.advance(HEADER_SIZE);

        if bytes.len() < header.context_len + header.body_len {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let context = bytes.split_to(header.context_len);
        let body = bytes.split_to(header.body_len);
        Ok(Self {
            flags: header.flags,
            context,
            body,
        })
    }
}

struct Header {
    flags: Flags,
    context_len: usize,
    body_len: usize,
}

impl Header {
    fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if raw[0] != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(raw[0]));
        }
        let flags = Flags::from_bits(raw[1])?;
        let context_len = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]) as usize;
        let body_len = u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]) as usize;

        let total = context_len.saturating_add(body_len);
        if total > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(total));
        }

        Ok(Self {
            flags,
            context_len,
            body_len,
        })
    }
}

/// Write a frame to an async writer and flush it
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read header
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let header = Header::parse(&header)?;

    let mut context = vec![0u8; header.context_len];
    reader.read_exact(&mut context).await?;
    let mut body = vec![0u8; header.body_len];
    reader.read_exact(&mut body).await?;

    Ok(Frame {
        flags: header.flags,
        context: Bytes::from(context),
        body: Bytes::from(body),
    })
}
