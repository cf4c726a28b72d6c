//! Live-session streaming client for trading-agent dashboards.
//!
//! One physical WebSocket per `(session_type, session_id)` is shared across
//! every interested consumer. Inbound frames are validated into a closed
//! event union, deduplicated within a bounded window, and fanned out in
//! transport order; the consumer-facing [`SessionView`] folds them through a
//! pure reducer into a [`SessionState`] snapshot. Abnormal disconnects are
//! retried with capped exponential backoff; normal closes are not.

pub mod auth;
pub mod backoff;
pub mod config;
pub mod dedup;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod view;
pub mod ws;

pub use auth::{StaticToken, TokenProvider};
pub use backoff::{CloseReason, ReconnectPolicy};
pub use config::FeedConfig;
pub use error::{FeedError, Result};
pub use manager::{ConnectionInfo, ConnectionManager, StreamEvent, Subscription};
pub use protocol::{decode_frame, DomainEvent, EventKind, StatsPatch};
pub use session::{
    OpenPosition, PositionSide, Progress, SessionKey, SessionState, SessionStatus, SessionType,
};
pub use transport::{FeedSocket, Frame, Transport};
pub use view::{Connectivity, SessionView, ViewState};
pub use ws::WsTransport;
