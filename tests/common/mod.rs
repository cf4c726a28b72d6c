//! Shared test plumbing: a scripted in-memory transport and token providers.

#![allow(dead_code)]

use async_trait::async_trait;
use livefeed::{
    DomainEvent, FeedConfig, FeedError, FeedSocket, Frame, Result, StreamEvent, Subscription,
    TokenProvider, Transport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

pub fn test_config() -> FeedConfig {
    FeedConfig::for_endpoint("wss://feeds.test")
}

/// Scripted transport. Each `connect` pops the next outcome (default:
/// accept) and parks a [`SocketHandle`] the test drives frames through.
pub struct MockTransport {
    connects: AtomicUsize,
    normal_closes: Arc<AtomicUsize>,
    script: Mutex<VecDeque<bool>>,
    handles: Mutex<Vec<SocketHandle>>,
    urls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            normal_closes: Arc::new(AtomicUsize::new(0)),
            script: Mutex::new(VecDeque::new()),
            handles: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
        })
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(false);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sockets closed with a normal-closure code by the manager.
    pub fn normal_close_count(&self) -> usize {
        self.normal_closes.load(Ordering::SeqCst)
    }

    pub fn socket(&self, index: usize) -> SocketHandle {
        self.handles.lock().unwrap()[index].clone()
    }

    pub fn latest_socket(&self) -> SocketHandle {
        self.handles
            .lock()
            .unwrap()
            .last()
            .expect("no socket opened yet")
            .clone()
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// Spin (without advancing the clock) until `n` connects happened.
    pub async fn wait_for_connects(&self, n: usize) {
        for _ in 0..10_000 {
            if self.connect_count() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("transport never reached {n} connects");
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn FeedSocket>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let accept = self.script.lock().unwrap().pop_front().unwrap_or(true);
        if !accept {
            return Err(FeedError::Transport("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.handles.lock().unwrap().push(SocketHandle { tx });
        Ok(Box::new(MockSocket {
            rx,
            normal_closes: Arc::clone(&self.normal_closes),
        }))
    }
}

#[derive(Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

impl SocketHandle {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(Frame::Text(text.into()));
    }

    /// Send a well-formed wire frame with a millisecond timestamp.
    pub fn send_event(&self, kind: &str, data: &str, ts_millis: i64) {
        let ts = chrono::DateTime::from_timestamp_millis(ts_millis)
            .expect("valid millis")
            .to_rfc3339();
        self.send_text(format!(
            r#"{{"type":"{kind}","data":{data},"timestamp":"{ts}"}}"#
        ));
    }

    pub fn close(&self, code: u16) {
        let _ = self.tx.send(Frame::Close(Some(code)));
    }
}

struct MockSocket {
    rx: mpsc::UnboundedReceiver<Frame>,
    normal_closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FeedSocket for MockSocket {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.normal_closes.fetch_add(1, Ordering::SeqCst);
        self.rx.close();
        Ok(())
    }
}

/// Provider with no credential; first subscribe must fail.
pub struct NoToken;

#[async_trait]
impl TokenProvider for NoToken {
    async fn bearer_token(&self) -> Option<String> {
        None
    }
}

/// Yields a token for a fixed number of resolutions, then `None` (expiry).
pub struct ExpiringToken {
    remaining: AtomicUsize,
}

impl ExpiringToken {
    pub fn new(valid_uses: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(valid_uses),
        })
    }
}

#[async_trait]
impl TokenProvider for ExpiringToken {
    async fn bearer_token(&self) -> Option<String> {
        // Yield first so concurrent subscribers genuinely interleave here.
        tokio::task::yield_now().await;
        let before = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        debug_assert!(before > 0);
        Some("token".to_string())
    }
}

pub async fn expect_connected(sub: &mut Subscription) {
    match sub.recv().await {
        Some(StreamEvent::Connected) => {}
        other => panic!("expected Connected, got {other:?}"),
    }
}

pub async fn next_domain(sub: &mut Subscription) -> DomainEvent {
    loop {
        match sub.recv().await {
            Some(StreamEvent::Domain(event)) => return (*event).clone(),
            Some(StreamEvent::Connected) => continue,
            other => panic!("expected a domain event, got {other:?}"),
        }
    }
}
