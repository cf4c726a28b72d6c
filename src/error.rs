use thiserror::Error;

/// Main error type for the streaming client
#[derive(Error, Debug)]
pub enum FeedError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    // Authentication errors
    #[error("Authentication required: {0}")]
    Auth(String),

    // Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    // Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for FeedError
pub type Result<T> = std::result::Result<T, FeedError>;
