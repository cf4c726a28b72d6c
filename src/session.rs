//! Session identity and the pure state reducer.
//!
//! `SessionState` is a value object: events are folded through
//! [`SessionState::apply`], which returns a fresh state and never mutates in
//! place. Once a session reaches a terminal status the state is frozen;
//! late-arriving events are logged and ignored.

use crate::protocol::{DomainEvent, EventKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Kind of long-running session the backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Backtest,
    Forward,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Backtest => "backtest",
            SessionType::Forward => "forward",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies exactly one logical session and one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_type: SessionType,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(session_type: SessionType, session_id: impl Into<String>) -> Self {
        Self {
            session_type,
            session_id: session_id.into(),
        }
    }

    pub fn backtest(session_id: impl Into<String>) -> Self {
        Self::new(SessionType::Backtest, session_id)
    }

    pub fn forward(session_id: impl Into<String>) -> Self {
        Self::new(SessionType::Forward, session_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_type, self.session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Terminal statuses freeze the state; no further events are applied.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Candle progress through the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u64,
    pub total: Option<u64>,
    /// Percent complete, rounded to two decimals; `None` until total is known.
    pub pct: Option<Decimal>,
}

impl Progress {
    fn recompute(&mut self) {
        self.pct = match self.total {
            Some(total) if total > 0 => Some(
                (Decimal::from(self.current) * Decimal::from(100) / Decimal::from(total))
                    .round_dp(2),
            ),
            _ => None,
        };
    }

    fn force_complete(&mut self) {
        if let Some(total) = self.total {
            self.current = total;
        }
        self.pct = Some(Decimal::from(100));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    #[serde(alias = "buy")]
    Long,
    #[serde(alias = "sell")]
    Short,
}

/// Normalized open-position record carried in `position_opened` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPosition {
    #[serde(rename = "type")]
    pub side: PositionSide,
    pub entry_price: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
}

/// Derived view of a session: a pure function of its ordered, deduplicated
/// event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub progress: Progress,
    pub equity: Option<Decimal>,
    pub equity_change_pct: Option<Decimal>,
    pub trade_count: u64,
    pub win_rate: Option<Decimal>,
    pub open_position: Option<OpenPosition>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Initializing,
            progress: Progress::default(),
            equity: None,
            equity_change_pct: None,
            trade_count: 0,
            win_rate: None,
            open_position: None,
        }
    }

    /// Fold one event into the state, returning the successor state.
    ///
    /// Terminal states are frozen: a late duplicate racing the terminal
    /// transition is logged as an anomaly and dropped. `error` and
    /// `heartbeat` events never change the state; errors are surfaced to the
    /// consumer as a side channel by the view layer.
    pub fn apply(&self, event: &DomainEvent) -> SessionState {
        if self.status.is_terminal() {
            warn!(
                event = event.kind.tag(),
                status = ?self.status,
                "event received after terminal state; ignoring"
            );
            return self.clone();
        }

        let mut next = self.clone();
        match &event.kind {
            EventKind::SessionInitialized { total_candles } => {
                next.status = SessionStatus::Running;
                if total_candles.is_some() {
                    next.progress.total = *total_candles;
                }
                next.progress.recompute();
            }
            EventKind::Candle {
                index,
                total_candles,
            } => {
                next.progress.current = *index;
                if next.progress.total.is_none() {
                    next.progress.total = *total_candles;
                }
                next.progress.recompute();
            }
            EventKind::StatsUpdate(patch) => {
                // Partial update: absent fields mean "no change".
                if let Some(equity) = patch.current_equity {
                    next.equity = Some(equity);
                }
                if let Some(change) = patch.equity_change_pct {
                    next.equity_change_pct = Some(change);
                }
                if let Some(trades) = patch.total_trades {
                    next.trade_count = trades;
                }
                if let Some(win_rate) = patch.win_rate {
                    next.win_rate = Some(win_rate);
                }
            }
            EventKind::PositionOpened(position) => {
                next.open_position = Some(position.clone());
            }
            EventKind::PositionClosed => {
                next.open_position = None;
            }
            EventKind::SessionPaused => {
                next.status = SessionStatus::Paused;
            }
            EventKind::SessionResumed => {
                next.status = SessionStatus::Running;
            }
            EventKind::SessionCompleted => {
                next.status = SessionStatus::Completed;
                next.progress.force_complete();
            }
            EventKind::SessionFailed { .. } => {
                next.status = SessionStatus::Failed;
            }
            // Surfaced out-of-band; the session itself is unaffected.
            EventKind::Error { .. } => {}
            EventKind::Heartbeat => {}
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatsPatch;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn event(kind: EventKind) -> DomainEvent {
        DomainEvent {
            kind,
            timestamp: Utc::now(),
        }
    }

    fn fold(events: Vec<EventKind>) -> SessionState {
        events
            .into_iter()
            .fold(SessionState::new(), |state, kind| state.apply(&event(kind)))
    }

    #[test]
    fn test_initialized_sets_running_and_total() {
        let state = fold(vec![EventKind::SessionInitialized {
            total_candles: Some(100),
        }]);
        assert_eq!(state.status, SessionStatus::Running);
        assert_eq!(state.progress.total, Some(100));
        assert_eq!(state.progress.pct, Some(dec!(0)));
    }

    #[test]
    fn test_candles_drive_progress_pct() {
        // Scenario: init with 100 candles, then candles 1..=10 -> 10 percent.
        let mut events = vec![EventKind::SessionInitialized {
            total_candles: Some(100),
        }];
        for i in 1..=10 {
            events.push(EventKind::Candle {
                index: i,
                total_candles: None,
            });
        }
        let state = fold(events);
        assert_eq!(state.progress.current, 10);
        assert_eq!(state.progress.pct, Some(dec!(10)));
    }

    #[test]
    fn test_candle_backfills_unknown_total() {
        let state = fold(vec![EventKind::Candle {
            index: 5,
            total_candles: Some(50),
        }]);
        assert_eq!(state.progress.total, Some(50));
        assert_eq!(state.progress.pct, Some(dec!(10)));
    }

    #[test]
    fn test_stats_updates_merge_partially() {
        // Scenario: trades arrive first, win rate later; neither overwrites
        // the other.
        let state = fold(vec![
            EventKind::StatsUpdate(StatsPatch {
                current_equity: None,
                equity_change_pct: None,
                total_trades: Some(5),
                win_rate: None,
            }),
            EventKind::StatsUpdate(StatsPatch {
                current_equity: None,
                equity_change_pct: None,
                total_trades: None,
                win_rate: Some(dec!(60)),
            }),
        ]);
        assert_eq!(state.trade_count, 5);
        assert_eq!(state.win_rate, Some(dec!(60)));
    }

    #[test]
    fn test_position_lifecycle() {
        let position = OpenPosition {
            side: PositionSide::Long,
            entry_price: dec!(101.5),
            unrealized_pnl: dec!(0),
        };
        let opened = fold(vec![
            EventKind::SessionInitialized {
                total_candles: Some(10),
            },
            EventKind::PositionOpened(position.clone()),
        ]);
        assert_eq!(opened.open_position, Some(position));

        let closed = opened.apply(&event(EventKind::PositionClosed));
        assert_eq!(closed.open_position, None);
    }

    #[test]
    fn test_pause_resume_cycle() {
        let paused = fold(vec![
            EventKind::SessionInitialized {
                total_candles: Some(10),
            },
            EventKind::SessionPaused,
        ]);
        assert_eq!(paused.status, SessionStatus::Paused);

        let resumed = paused.apply(&event(EventKind::SessionResumed));
        assert_eq!(resumed.status, SessionStatus::Running);
    }

    #[test]
    fn test_completed_forces_full_progress() {
        let state = fold(vec![
            EventKind::SessionInitialized {
                total_candles: Some(200),
            },
            EventKind::Candle {
                index: 73,
                total_candles: None,
            },
            EventKind::SessionCompleted,
        ]);
        assert_eq!(state.status, SessionStatus::Completed);
        assert_eq!(state.progress.current, 200);
        assert_eq!(state.progress.pct, Some(dec!(100)));
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let completed = fold(vec![EventKind::SessionCompleted]);
        assert!(completed.status.is_terminal());

        let after = completed
            .apply(&event(EventKind::Candle {
                index: 999,
                total_candles: Some(1000),
            }))
            .apply(&event(EventKind::SessionPaused))
            .apply(&event(EventKind::SessionFailed { message: None }));

        assert_eq!(after, completed);
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal_state() {
        for setup in [
            vec![],
            vec![EventKind::SessionInitialized {
                total_candles: Some(10),
            }],
            vec![
                EventKind::SessionInitialized {
                    total_candles: Some(10),
                },
                EventKind::SessionPaused,
            ],
        ] {
            let mut events = setup;
            events.push(EventKind::SessionFailed {
                message: Some("out of margin".to_string()),
            });
            assert_eq!(fold(events).status, SessionStatus::Failed);
        }
    }

    #[test]
    fn test_error_event_leaves_status_untouched() {
        let state = fold(vec![
            EventKind::SessionInitialized {
                total_candles: Some(10),
            },
            EventKind::Error {
                message: "order rejected".to_string(),
            },
        ]);
        assert_eq!(state.status, SessionStatus::Running);
    }
}
