//! Reconnection policy: pure backoff math, kept separate from socket plumbing.

use std::time::Duration;

/// Why a connection ended, as seen by the reconnect driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Intentional closure (normal / going-away); never reconnected.
    Normal,
    /// Everything else: abnormal close codes, transport errors, stream EOF.
    Abnormal(Option<u16>),
}

impl CloseReason {
    /// Map a WebSocket close code to a reason. 1000 (normal) and 1001
    /// (going away) suppress reconnection.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(1000) | Some(1001) => CloseReason::Normal,
            other => CloseReason::Abnormal(other),
        }
    }
}

/// Capped exponential backoff with an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based):
    /// `min(base * 2^attempt, cap)`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match 2u32.checked_pow(attempt) {
            Some(factor) => self.base.saturating_mul(factor).min(self.cap),
            None => self.cap,
        }
    }

    /// Whether another reconnect attempt should be scheduled.
    pub fn should_retry(&self, attempt: u32, close: CloseReason, subscribers: usize) -> bool {
        matches!(close, CloseReason::Abnormal(_))
            && subscribers > 0
            && attempt < self.max_attempts
    }
}
