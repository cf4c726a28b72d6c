use async_trait::async_trait;
use std::sync::Arc;

/// Async capability that yields a bearer token for the stream handshake.
///
/// Returning `None` means no credential is currently available: a first
/// subscribe fails with an authentication error, and a reconnect attempt is
/// abandoned silently. The token is re-resolved on every (re)open, never
/// cached, so expired credentials are picked up between attempts.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

/// Fixed-token provider for tools and tests.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self(token.into()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}
