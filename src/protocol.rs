//! EventCodec: inbound wire frames -> typed domain events.
//!
//! The wire format is a JSON envelope `{ "type", "data", "timestamp" }`.
//! Payloads are validated here, at the boundary; the rest of the crate only
//! ever sees the closed [`EventKind`] union. Unknown `type` values are a
//! protocol error, not a silent drop.

use crate::error::{FeedError, Result};
use crate::session::OpenPosition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Outer wire envelope.
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
}

/// One validated event from the session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SessionInitialized { total_candles: Option<u64> },
    Candle { index: u64, total_candles: Option<u64> },
    StatsUpdate(StatsPatch),
    PositionOpened(OpenPosition),
    PositionClosed,
    SessionPaused,
    SessionResumed,
    SessionCompleted,
    SessionFailed { message: Option<String> },
    Error { message: String },
    Heartbeat,
}

impl EventKind {
    /// Wire tag for this event kind; also the first dedup-key component.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::SessionInitialized { .. } => "session_initialized",
            EventKind::Candle { .. } => "candle",
            EventKind::StatsUpdate(_) => "stats_update",
            EventKind::PositionOpened(_) => "position_opened",
            EventKind::PositionClosed => "position_closed",
            EventKind::SessionPaused => "session_paused",
            EventKind::SessionResumed => "session_resumed",
            EventKind::SessionCompleted => "session_completed",
            EventKind::SessionFailed { .. } => "session_failed",
            EventKind::Error { .. } => "error",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

/// Partial statistics snapshot; absent fields mean "no change".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StatsPatch {
    #[serde(default)]
    pub current_equity: Option<Decimal>,
    #[serde(default)]
    pub equity_change_pct: Option<Decimal>,
    #[serde(default)]
    pub total_trades: Option<u64>,
    #[serde(default)]
    pub win_rate: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct InitPayload {
    #[serde(default)]
    total_candles: Option<u64>,
    #[serde(default)]
    config: Option<InitConfig>,
}

#[derive(Debug, Deserialize)]
struct InitConfig {
    #[serde(default)]
    total_candles: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CandlePayload {
    #[serde(default)]
    candle_index: Option<u64>,
    #[serde(default)]
    candle_number: Option<u64>,
    #[serde(default)]
    total_candles: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    message: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, data: serde_json::Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| FeedError::Protocol(format!("invalid {kind} payload: {e}")))
}

/// Parse one inbound text frame into a [`DomainEvent`].
pub fn decode_frame(text: &str) -> Result<DomainEvent> {
    let frame: WireFrame = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("malformed frame: {e}")))?;

    let kind = match frame.kind.as_str() {
        "session_initialized" => {
            let p: InitPayload = payload("session_initialized", frame.data)?;
            EventKind::SessionInitialized {
                total_candles: p
                    .total_candles
                    .or_else(|| p.config.and_then(|c| c.total_candles)),
            }
        }
        "candle" => {
            let p: CandlePayload = payload("candle", frame.data)?;
            let index = p
                .candle_index
                .or(p.candle_number)
                .ok_or_else(|| FeedError::Protocol("candle frame missing index".to_string()))?;
            EventKind::Candle {
                index,
                total_candles: p.total_candles,
            }
        }
        "stats_update" => EventKind::StatsUpdate(payload("stats_update", frame.data)?),
        "position_opened" => EventKind::PositionOpened(payload("position_opened", frame.data)?),
        "position_closed" => EventKind::PositionClosed,
        "session_paused" => EventKind::SessionPaused,
        "session_resumed" => EventKind::SessionResumed,
        "session_completed" => EventKind::SessionCompleted,
        "session_failed" => {
            let p: MessagePayload = payload("session_failed", frame.data)?;
            EventKind::SessionFailed { message: p.message }
        }
        "error" => {
            let p: MessagePayload = payload("error", frame.data)?;
            EventKind::Error {
                message: p.message.unwrap_or_else(|| "unknown error".to_string()),
            }
        }
        "heartbeat" => EventKind::Heartbeat,
        other => {
            return Err(FeedError::Protocol(format!("unknown event type: {other}")));
        }
    };

    Ok(DomainEvent {
        kind,
        timestamp: frame.timestamp,
    })
}
