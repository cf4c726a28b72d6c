//! Transport seam between the connection manager and the wire.
//!
//! The manager only ever sees [`Frame`]s; ping/pong plumbing stays inside the
//! transport implementation. Tests drive the manager through an in-memory
//! implementation of these traits.

use crate::error::Result;
use async_trait::async_trait;
use url::Url;

/// Frames the connection manager cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Close with the server-supplied close code, if any.
    Close(Option<u16>),
}

/// Factory for physical connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn FeedSocket>>;
}

/// One open socket to a session stream.
#[async_trait]
pub trait FeedSocket: Send {
    /// Next frame, `None` when the stream has ended without a close frame.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    /// Close the socket with a normal-closure code.
    async fn close(&mut self) -> Result<()>;
}
