//! tokio-tungstenite implementation of the transport seam.

use crate::error::{FeedError, Result};
use crate::transport::{FeedSocket, Frame, Transport};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

/// WebSocket transport with a bounded connect timeout.
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn FeedSocket>> {
        info!(host = url.host_str().unwrap_or("?"), "connecting to session stream");

        let (stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Transport("WebSocket connection timeout".to_string()))?
            .map_err(FeedError::WebSocket)?;

        Ok(Box::new(WsSocket { inner: stream }))
    }
}

struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedSocket for WsSocket {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.inner.send(Message::Pong(data)).await {
                        return Some(Err(FeedError::WebSocket(e)));
                    }
                    debug!("answered ping");
                }
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| u16::from(f.code));
                    return Some(Ok(Frame::Close(code)));
                }
                Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(FeedError::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.inner.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(FeedError::WebSocket(e)),
        }
    }
}
