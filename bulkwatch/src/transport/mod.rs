//! Provides abstraction for frame transports.
//!
//! A session only needs to pull inbound frames and push outbound frames.
//! Frames are already-delimited byte messages; their content is handled by
//! the [codec](crate::codec) layer.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::future::Future;
use tokio::sync::mpsc;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// The inbound half of a connection.
pub trait FrameSource: Send + 'static {
    /// Receive the next frame from the client.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a frame.
    /// - `Ok(None)` - The client closed the stream.
    /// - `Err(_)` - The transport failed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}

/// The outbound half of a connection.
pub trait FrameSink: Send + 'static {
    /// Send one frame to the client.
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<()>> + Send;
}

impl FrameSource for mpsc::Receiver<Bytes> {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(mpsc::Receiver::recv(self).await)
    }
}

impl FrameSink for mpsc::Sender<Bytes> {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| Error::StreamClosed)
    }
}
