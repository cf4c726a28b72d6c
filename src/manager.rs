//! Connection manager: one physical connection per session, shared by all
//! interested subscribers.
//!
//! Each live [`SessionKey`] owns exactly one spawned connection task. The
//! task drives the socket, decodes and deduplicates inbound frames, fans
//! events out to every current subscriber, and reconnects with capped
//! exponential backoff on abnormal closes. Subscribers are reference-counted;
//! when the last one leaves, the connection lingers for a short grace window
//! before teardown so a quick resubscribe reuses the live socket.

use crate::auth::TokenProvider;
use crate::backoff::{CloseReason, ReconnectPolicy};
use crate::config::FeedConfig;
use crate::dedup::{dedup_key, DedupWindow};
use crate::error::{FeedError, Result};
use crate::protocol::{decode_frame, DomainEvent, EventKind};
use crate::session::SessionKey;
use crate::transport::{Frame, Transport};
use crate::ws::WsTransport;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

const STATUS_CONNECTING: u8 = 0;
const STATUS_OPEN: u8 = 1;
const STATUS_CLOSING: u8 = 2;
const STATUS_CLOSED: u8 = 3;

/// What a subscriber receives from the stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A deduplicated domain event, in transport order.
    Domain(Arc<DomainEvent>),
    /// The physical connection (re)opened.
    Connected,
    /// The physical connection dropped. `retrying` distinguishes a backoff
    /// cycle in progress from a permanent stop (normal close, exhausted
    /// attempts, forced disconnect).
    Disconnected { retrying: bool },
}

/// Point-in-time connection snapshot for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub subscriber_count: usize,
}

/// A poisoned lock only means another thread panicked mid-update of a map we
/// fully rewrite anyway; recover the guard instead of propagating.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Registry {
    subs: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamEvent>>>,
}

impl Registry {
    fn count(&self) -> usize {
        lock(&self.subs).len()
    }

    /// Fan one event out to every currently registered subscriber.
    /// Membership is re-read under the lock on every dispatch, so an
    /// unsubscribe that raced a reconnect can never receive another event.
    fn broadcast(&self, event: StreamEvent) {
        let subs = lock(&self.subs);
        for tx in subs.values() {
            // A closed receiver just means that consumer is gone.
            let _ = tx.send(event.clone());
        }
    }
}

struct ConnectionHandle {
    epoch: u64,
    registry: Arc<Registry>,
    status: Arc<AtomicU8>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    grace: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    fn cancel_grace(&mut self) {
        if let Some(timer) = self.grace.take() {
            timer.abort();
        }
    }

    /// Register a subscriber on this connection. A late joiner on an
    /// already-open socket still has to observe the current connectivity,
    /// so it gets a direct `Connected` before entering the fan-out set.
    fn register(&mut self, id: u64, tx: mpsc::UnboundedSender<StreamEvent>) {
        self.cancel_grace();
        let mut subs = lock(&self.registry.subs);
        if self.status.load(Ordering::SeqCst) == STATUS_OPEN {
            let _ = tx.send(StreamEvent::Connected);
        }
        subs.insert(id, tx);
    }
}

enum ConnCommand {
    Shutdown,
}

/// Owns every physical connection; injected at the composition root rather
/// than living in process-global state.
pub struct ConnectionManager {
    endpoint: Url,
    policy: ReconnectPolicy,
    dedup_window: usize,
    grace_period: Duration,
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<SessionKey, ConnectionHandle>>,
    next_sub_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: FeedConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        if let Err(problems) = config.validate() {
            return Err(FeedError::Internal(format!(
                "invalid configuration: {}",
                problems.join("; ")
            )));
        }
        let endpoint = Url::parse(&config.ws_base_url)?;

        Ok(Arc::new(Self {
            endpoint,
            policy: config.policy(),
            dedup_window: config.dedup.window,
            grace_period: config.grace_period(),
            transport,
            connections: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
        }))
    }

    /// Manager backed by the real WebSocket transport.
    pub fn with_websocket(config: FeedConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(WsTransport::new(config.connect_timeout()));
        Self::new(config, transport)
    }

    /// Subscribe to a session's event stream, opening the physical connection
    /// if this is the first subscriber for the key.
    ///
    /// Fails with [`FeedError::Auth`] when no token is available; no
    /// connection is attempted in that case.
    pub async fn subscribe(
        self: &Arc<Self>,
        key: SessionKey,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Subscription> {
        if key.session_id.trim().is_empty() {
            return Err(FeedError::InvalidSession(
                "session id must not be empty".to_string(),
            ));
        }

        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        if self.attach(&key, id, tx.clone()) {
            return Ok(self.subscription(key, id, rx));
        }

        // First subscriber for this key: a missing token must fail before
        // any socket work happens.
        if tokens.bearer_token().await.is_none() {
            return Err(FeedError::Auth("authentication required".to_string()));
        }

        let mut connections = lock(&self.connections);
        // The token await yielded; another subscriber may have opened the
        // connection in the meantime. At most one per key, always.
        if let Some(handle) = connections.get_mut(&key) {
            handle.register(id, tx);
            return Ok(self.subscription(key, id, rx));
        }

        let registry = Arc::new(Registry::default());
        lock(&registry.subs).insert(id, tx);
        let status = Arc::new(AtomicU8::new(STATUS_CONNECTING));
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = ConnDriver {
            manager: Arc::downgrade(self),
            key: key.clone(),
            epoch,
            endpoint: self.endpoint.clone(),
            registry: Arc::clone(&registry),
            status: Arc::clone(&status),
            tokens,
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            dedup: DedupWindow::new(self.dedup_window),
        };
        tokio::spawn(drive_connection(driver, cmd_rx));

        connections.insert(
            key.clone(),
            ConnectionHandle {
                epoch,
                registry,
                status,
                cmd_tx,
                grace: None,
            },
        );
        info!(session = %key, "opening session connection");
        Ok(self.subscription(key, id, rx))
    }

    /// Force immediate teardown regardless of subscriber count.
    pub fn disconnect(&self, key: &SessionKey) {
        let handle = lock(&self.connections).remove(key);
        if let Some(mut handle) = handle {
            info!(session = %key, "forced disconnect");
            handle.cancel_grace();
            let _ = handle.cmd_tx.send(ConnCommand::Shutdown);
        }
    }

    /// Tear down every tracked connection.
    pub fn disconnect_all(&self) {
        let drained: Vec<_> = lock(&self.connections).drain().collect();
        for (key, mut handle) in drained {
            info!(session = %key, "forced disconnect");
            handle.cancel_grace();
            let _ = handle.cmd_tx.send(ConnCommand::Shutdown);
        }
    }

    /// Snapshot of one session's connection; `None` when no connection is
    /// tracked for the key. Pure read, never fails.
    pub fn connection_state(&self, key: &SessionKey) -> Option<ConnectionInfo> {
        let connections = lock(&self.connections);
        connections.get(key).map(|handle| {
            let status = handle.status.load(Ordering::SeqCst);
            ConnectionInfo {
                is_connected: status == STATUS_OPEN,
                is_connecting: status == STATUS_CONNECTING,
                subscriber_count: handle.registry.count(),
            }
        })
    }

    fn subscription(
        self: &Arc<Self>,
        key: SessionKey,
        id: u64,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Subscription {
        Subscription {
            manager: Arc::downgrade(self),
            key,
            id,
            rx,
            active: true,
        }
    }

    fn attach(&self, key: &SessionKey, id: u64, tx: mpsc::UnboundedSender<StreamEvent>) -> bool {
        let mut connections = lock(&self.connections);
        match connections.get_mut(key) {
            Some(handle) => {
                handle.register(id, tx);
                debug!(session = %key, subscriber = id, "attached to existing connection");
                true
            }
            None => false,
        }
    }

    fn remove_subscriber(self: &Arc<Self>, key: &SessionKey, id: u64) {
        let mut connections = lock(&self.connections);
        let Some(handle) = connections.get_mut(key) else {
            return;
        };

        let remaining = {
            let mut subs = lock(&handle.registry.subs);
            subs.remove(&id);
            subs.len()
        };
        debug!(session = %key, subscriber = id, remaining, "unsubscribed");
        if remaining > 0 || handle.grace.is_some() {
            return;
        }

        // Last subscriber gone: linger for the grace window so a quick
        // remount reuses the live socket instead of a reconnect round-trip.
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let manager = Arc::downgrade(self);
                let key = key.clone();
                // Anchor the deadline here, not at the timer task's first
                // poll, so the window starts when the last subscriber leaves.
                let deadline = tokio::time::Instant::now() + self.grace_period;
                handle.grace = Some(rt.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(manager) = manager.upgrade() {
                        manager.teardown_if_idle(&key);
                    }
                }));
            }
            Err(_) => {
                // No runtime (process teardown): close immediately.
                let _ = handle.cmd_tx.send(ConnCommand::Shutdown);
                connections.remove(key);
            }
        }
    }

    fn teardown_if_idle(&self, key: &SessionKey) {
        let mut connections = lock(&self.connections);
        let Some(handle) = connections.get_mut(key) else {
            return;
        };
        handle.grace = None;
        if handle.registry.count() > 0 {
            return;
        }
        if let Some(handle) = connections.remove(key) {
            debug!(session = %key, "grace period expired; closing idle connection");
            let _ = handle.cmd_tx.send(ConnCommand::Shutdown);
        }
    }

    /// Called by a finishing connection task. The epoch guard keeps a
    /// stale task from removing a record that has since been replaced.
    fn drop_record(&self, key: &SessionKey, epoch: u64) {
        let mut connections = lock(&self.connections);
        let matches = connections
            .get(key)
            .map(|handle| handle.epoch == epoch)
            .unwrap_or(false);
        if matches {
            if let Some(mut handle) = connections.remove(key) {
                handle.cancel_grace();
            }
        }
    }
}

/// A consumer's membership in one session stream.
///
/// Events arrive through [`Subscription::recv`] in transport order.
/// Dropping the subscription unsubscribes; calling
/// [`Subscription::unsubscribe`] more than once is a no-op.
pub struct Subscription {
    manager: Weak<ConnectionManager>,
    key: SessionKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Next event, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if !self.active {
            return None;
        }
        self.rx.recv().await
    }

    /// Idempotent; safe to call from inside an event-handling loop.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.rx.close();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_subscriber(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct ConnDriver {
    manager: Weak<ConnectionManager>,
    key: SessionKey,
    epoch: u64,
    endpoint: Url,
    registry: Arc<Registry>,
    status: Arc<AtomicU8>,
    tokens: Arc<dyn TokenProvider>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    dedup: DedupWindow,
}

enum ExitCause {
    Shutdown,
    Closed(CloseReason),
}

impl ConnDriver {
    fn session_url(&self, token: &str) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let url = format!(
            "{}/ws/{}/{}?token={}",
            base,
            self.key.session_type,
            urlencoding::encode(&self.key.session_id),
            urlencoding::encode(token)
        );
        Url::parse(&url).map_err(FeedError::Endpoint)
    }

    fn handle_text(&mut self, text: &str) {
        match decode_frame(text) {
            Ok(event) => {
                let dedup_key = dedup_key(&event);
                if !self.dedup.insert(dedup_key) {
                    debug!(
                        session = %self.key,
                        event = event.kind.tag(),
                        "duplicate event dropped"
                    );
                    return;
                }
                self.registry.broadcast(StreamEvent::Domain(Arc::new(event)));
            }
            Err(e) => {
                // Malformed frame: surface it, keep the socket open.
                warn!(session = %self.key, error = %e, "bad frame from stream");
                let synthetic = DomainEvent {
                    kind: EventKind::Error {
                        message: e.to_string(),
                    },
                    timestamp: Utc::now(),
                };
                self.registry
                    .broadcast(StreamEvent::Domain(Arc::new(synthetic)));
            }
        }
    }
}

async fn drive_connection(mut driver: ConnDriver, mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>) {
    let mut attempt: u32 = 0;

    'outer: loop {
        driver.status.store(STATUS_CONNECTING, Ordering::SeqCst);

        // The token may have expired since the last open; re-resolve on
        // every attempt. A missing token abandons this attempt silently but
        // still burns it.
        let Some(token) = driver.tokens.bearer_token().await else {
            debug!(session = %driver.key, attempt, "no token available; attempt abandoned");
            if !driver
                .policy
                .should_retry(attempt, CloseReason::Abnormal(None), driver.registry.count())
            {
                break 'outer;
            }
            let delay = driver.policy.next_delay(attempt);
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => continue 'outer,
                _ = cmd_rx.recv() => break 'outer,
            }
        };

        let url = match driver.session_url(&token) {
            Ok(url) => url,
            Err(e) => {
                error!(session = %driver.key, error = %e, "cannot build stream URL");
                break 'outer;
            }
        };

        let connected = tokio::select! {
            result = driver.transport.connect(&url) => result,
            _ = cmd_rx.recv() => break 'outer,
        };

        let mut socket = match connected {
            Ok(socket) => socket,
            Err(e) => {
                warn!(session = %driver.key, attempt, error = %e, "connect failed");
                if !driver
                    .policy
                    .should_retry(attempt, CloseReason::Abnormal(None), driver.registry.count())
                {
                    break 'outer;
                }
                let delay = driver.policy.next_delay(attempt);
                attempt += 1;
                driver
                    .registry
                    .broadcast(StreamEvent::Disconnected { retrying: true });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'outer,
                    _ = cmd_rx.recv() => break 'outer,
                }
            }
        };

        attempt = 0;
        driver.status.store(STATUS_OPEN, Ordering::SeqCst);
        info!(session = %driver.key, "session stream connected");
        driver.registry.broadcast(StreamEvent::Connected);

        let cause = loop {
            tokio::select! {
                frame = socket.next_frame() => match frame {
                    Some(Ok(Frame::Text(text))) => driver.handle_text(&text),
                    Some(Ok(Frame::Close(code))) => {
                        break ExitCause::Closed(CloseReason::from_code(code));
                    }
                    Some(Err(e)) => {
                        warn!(session = %driver.key, error = %e, "socket error");
                        break ExitCause::Closed(CloseReason::Abnormal(None));
                    }
                    None => break ExitCause::Closed(CloseReason::Abnormal(None)),
                },
                _ = cmd_rx.recv() => break ExitCause::Shutdown,
            }
        };

        match cause {
            ExitCause::Shutdown => {
                driver.status.store(STATUS_CLOSING, Ordering::SeqCst);
                if let Err(e) = socket.close().await {
                    debug!(session = %driver.key, error = %e, "close failed");
                }
                break 'outer;
            }
            ExitCause::Closed(reason) => {
                if !driver
                    .policy
                    .should_retry(attempt, reason, driver.registry.count())
                {
                    info!(session = %driver.key, ?reason, "stream closed; not reconnecting");
                    break 'outer;
                }
                let delay = driver.policy.next_delay(attempt);
                attempt += 1;
                warn!(
                    session = %driver.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "stream lost; reconnecting"
                );
                driver.status.store(STATUS_CONNECTING, Ordering::SeqCst);
                driver
                    .registry
                    .broadcast(StreamEvent::Disconnected { retrying: true });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cmd_rx.recv() => break 'outer,
                }
            }
        }
    }

    driver.status.store(STATUS_CLOSED, Ordering::SeqCst);
    if let Some(manager) = driver.manager.upgrade() {
        manager.drop_record(&driver.key, driver.epoch);
    }
    driver
        .registry
        .broadcast(StreamEvent::Disconnected { retrying: false });
    debug!(session = %driver.key, "connection task finished");
}
