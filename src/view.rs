//! Consumer-facing session view.
//!
//! A `SessionView` subscribes one consumer to a session, folds the event
//! stream through the pure reducer, and republishes the derived state over a
//! watch channel. Server `error` events and stream connectivity land in the
//! published [`ViewState`] as side channels next to the session snapshot.

use crate::auth::TokenProvider;
use crate::error::{FeedError, Result};
use crate::manager::{ConnectionManager, StreamEvent, Subscription};
use crate::protocol::EventKind;
use crate::session::{SessionKey, SessionState};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Opening the first connection for this view.
    Connecting,
    Connected,
    /// Temporarily disconnected; the manager is retrying with backoff.
    Reconnecting,
    /// Permanently disconnected; [`SessionView::reconnect`] is required.
    Disconnected,
}

/// Snapshot published to the consumer on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub connectivity: Connectivity,
    pub session: SessionState,
    /// Most recent server-reported error, if any.
    pub error: Option<String>,
}

impl ViewState {
    fn fresh() -> Self {
        Self {
            connectivity: Connectivity::Connecting,
            session: SessionState::new(),
            error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }
}

pub struct SessionView {
    manager: Arc<ConnectionManager>,
    tokens: Arc<dyn TokenProvider>,
    key: Option<SessionKey>,
    state_tx: Arc<watch::Sender<ViewState>>,
    fold: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionView")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SessionView {
    /// Subscribe to a session and start folding its events.
    pub async fn open(
        manager: Arc<ConnectionManager>,
        key: SessionKey,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let (state_tx, _) = watch::channel(ViewState::fresh());
        let mut view = Self {
            manager,
            tokens,
            key: None,
            state_tx: Arc::new(state_tx),
            fold: None,
        };
        view.set_session(Some(key)).await?;
        Ok(view)
    }

    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Current snapshot.
    pub fn state(&self) -> ViewState {
        self.state_tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ViewState> {
        self.state_tx.subscribe()
    }

    /// Switch this view to a different session (or to none), unsubscribing
    /// from the old key and clearing local state.
    pub async fn set_session(&mut self, key: Option<SessionKey>) -> Result<()> {
        self.stop_fold();
        self.key = key.clone();
        self.state_tx.send_replace(ViewState::fresh());

        match key {
            Some(key) => {
                let sub = self
                    .manager
                    .subscribe(key, Arc::clone(&self.tokens))
                    .await?;
                self.spawn_fold(sub);
            }
            None => {
                self.state_tx
                    .send_modify(|state| state.connectivity = Connectivity::Disconnected);
            }
        }
        Ok(())
    }

    /// Manual retry after a permanent disconnect. Keeps the accumulated
    /// session state; clears the error and connectivity.
    pub async fn reconnect(&mut self) -> Result<()> {
        let Some(key) = self.key.clone() else {
            return Err(FeedError::InvalidSession(
                "no session selected".to_string(),
            ));
        };
        self.stop_fold();
        self.state_tx.send_modify(|state| {
            state.connectivity = Connectivity::Connecting;
            state.error = None;
        });
        let sub = self
            .manager
            .subscribe(key, Arc::clone(&self.tokens))
            .await?;
        self.spawn_fold(sub);
        Ok(())
    }

    fn spawn_fold(&mut self, sub: Subscription) {
        let state_tx = Arc::clone(&self.state_tx);
        self.fold = Some(tokio::spawn(fold_events(sub, state_tx)));
    }

    fn stop_fold(&mut self) {
        if let Some(task) = self.fold.take() {
            // Aborting drops the subscription, which unsubscribes.
            task.abort();
        }
    }
}

impl Drop for SessionView {
    fn drop(&mut self) {
        self.stop_fold();
    }
}

async fn fold_events(mut sub: Subscription, state_tx: Arc<watch::Sender<ViewState>>) {
    while let Some(event) = sub.recv().await {
        state_tx.send_modify(|view| apply_stream_event(view, &event));
    }
    debug!(session = %sub.key(), "view fold loop ended");
}

fn apply_stream_event(view: &mut ViewState, event: &StreamEvent) {
    match event {
        StreamEvent::Connected => view.connectivity = Connectivity::Connected,
        StreamEvent::Disconnected { retrying } => {
            view.connectivity = if *retrying {
                Connectivity::Reconnecting
            } else {
                Connectivity::Disconnected
            };
        }
        StreamEvent::Domain(event) => {
            match &event.kind {
                EventKind::Error { message } => view.error = Some(message.clone()),
                EventKind::SessionFailed {
                    message: Some(message),
                } => view.error = Some(message.clone()),
                _ => {}
            }
            view.session = view.session.apply(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DomainEvent;
    use crate::session::SessionStatus;
    use chrono::Utc;

    fn domain(kind: EventKind) -> StreamEvent {
        StreamEvent::Domain(Arc::new(DomainEvent {
            kind,
            timestamp: Utc::now(),
        }))
    }

    #[test]
    fn test_connectivity_transitions() {
        let mut view = ViewState::fresh();
        assert_eq!(view.connectivity, Connectivity::Connecting);

        apply_stream_event(&mut view, &StreamEvent::Connected);
        assert!(view.is_connected());

        apply_stream_event(&mut view, &StreamEvent::Disconnected { retrying: true });
        assert_eq!(view.connectivity, Connectivity::Reconnecting);

        apply_stream_event(&mut view, &StreamEvent::Disconnected { retrying: false });
        assert_eq!(view.connectivity, Connectivity::Disconnected);
    }

    #[test]
    fn test_error_event_sets_side_channel_only() {
        let mut view = ViewState::fresh();
        apply_stream_event(
            &mut view,
            &domain(EventKind::SessionInitialized {
                total_candles: Some(10),
            }),
        );
        apply_stream_event(
            &mut view,
            &domain(EventKind::Error {
                message: "order rejected".to_string(),
            }),
        );

        assert_eq!(view.error.as_deref(), Some("order rejected"));
        assert_eq!(view.session.status, SessionStatus::Running);
    }

    #[test]
    fn test_session_failed_surfaces_message_and_status() {
        let mut view = ViewState::fresh();
        apply_stream_event(
            &mut view,
            &domain(EventKind::SessionFailed {
                message: Some("out of margin".to_string()),
            }),
        );

        assert_eq!(view.session.status, SessionStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("out of margin"));
    }
}
