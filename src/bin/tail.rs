//! Tail one live session from the command line.
//!
//! Usage: `tail <backtest|forward> <session-id>`
//!
//! Configuration comes from `config/default.toml` plus `LIVEFEED__*`
//! environment overrides (at minimum `LIVEFEED__WS_BASE_URL`); the bearer
//! token comes from `LIVEFEED_TOKEN`.

use anyhow::{bail, Context};
use livefeed::{
    Connectivity, ConnectionManager, FeedConfig, SessionKey, SessionType, SessionView, StaticToken,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FeedConfig::load().context("failed to load configuration")?;
    init_logging(&config);

    let mut args = std::env::args().skip(1);
    let session_type = match args.next().as_deref() {
        Some("backtest") => SessionType::Backtest,
        Some("forward") => SessionType::Forward,
        _ => bail!("usage: tail <backtest|forward> <session-id>"),
    };
    let Some(session_id) = args.next() else {
        bail!("usage: tail <backtest|forward> <session-id>");
    };
    let token = std::env::var("LIVEFEED_TOKEN").context("LIVEFEED_TOKEN is not set")?;

    let manager = ConnectionManager::with_websocket(config)?;
    let key = SessionKey::new(session_type, session_id);
    info!(session = %key, "tailing session");

    let view = SessionView::open(manager.clone(), key, StaticToken::new(token)).await?;
    let mut states = view.watch();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!(
                    connectivity = ?state.connectivity,
                    status = ?state.session.status,
                    progress = ?state.session.progress.pct,
                    equity = ?state.session.equity,
                    trades = state.session.trade_count,
                    "session update"
                );
                if let Some(error) = &state.error {
                    warn!(error, "session reported an error");
                }
                if state.connectivity == Connectivity::Disconnected {
                    warn!("stream permanently disconnected; exiting");
                    break;
                }
                if state.session.status.is_terminal() {
                    info!(status = ?state.session.status, "session finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                break;
            }
        }
    }

    manager.disconnect_all();
    Ok(())
}

fn init_logging(config: &FeedConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
