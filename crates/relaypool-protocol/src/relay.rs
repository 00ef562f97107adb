// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relay abstraction: a framed, bidirectional channel to one worker.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp;

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Framed send/receive over some byte stream.
///
/// The pool owns exactly one relay per worker and never uses it from two
/// tasks at once, so the methods take `&mut self`.
#[async_trait]
pub trait Relay: Send {
    /// Send one frame.
    async fn send(&mut self, frame: &Frame) -> Result<(), FrameError>;

    /// Receive the next frame.
    async fn receive(&mut self) -> Result<Frame, FrameError>;

    /// Shut down the write side.
    async fn close(&mut self) -> Result<(), FrameError>;
}

/// Relay over a reader/writer pair (process pipes, socket halves, stdio).
pub struct StreamRelay<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R: AsyncRead, W> StreamRelay<R, W> {
    /// Create a relay from the read and write halves of a stream.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

/// Relay over a TCP connection.
pub type TcpRelay = StreamRelay<tcp::OwnedReadHalf, tcp::OwnedWriteHalf>;

impl TcpRelay {
    /// Wrap an established TCP connection.
    pub fn from_tcp(stream: TcpStream) -> Self {
        // Frames are small and latency-sensitive.
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

#[cfg(unix)]
pub use unix::UnixRelay;

#[cfg(unix)]
mod unix {
    use tokio::net::UnixStream;
    use tokio::net::unix;

    use super::StreamRelay;

    /// Relay over a Unix domain socket.
    pub type UnixRelay = StreamRelay<unix::OwnedReadHalf, unix::OwnedWriteHalf>;

    impl UnixRelay {
        /// Wrap an established Unix socket connection.
        pub fn from_unix(stream: UnixStream) -> Self {
            let (reader, writer) = stream.into_split();
            Self::new(reader, writer)
        }
    }
}

#[async_trait]
impl<R, W> Relay for StreamRelay<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.writer, frame).await
    }

    async fn receive(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.reader).await
    }

    async fn close(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
