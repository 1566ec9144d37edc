//! Bearer credential delegation
//!
//! The API client never refreshes tokens itself. It asks the auth collaborator
//! for the current token before each call and notifies it on a 401.

use async_trait::async_trait;
use std::sync::RwLock;

/// Supplies bearer credentials for sync calls
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token, `None` when signed out
    async fn bearer_token(&self) -> Option<String>;

    /// Called after the server answered 401; the provider should refresh
    async fn on_unauthorized(&self);
}

/// Fixed token (from config or environment), cleared on 401
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Replace the token, e.g. after the user signed in again
    pub fn set(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn on_unauthorized(&self) {
        // A static token cannot be refreshed; drop it so calls stop carrying it
        log::warn!("Bearer token rejected by server, clearing it");
        self.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_cleared_on_unauthorized() {
        let tokens = StaticToken::new(Some("abc".to_string()));
        assert_eq!(tokens.bearer_token().await, Some("abc".to_string()));

        tokens.on_unauthorized().await;
        assert_eq!(tokens.bearer_token().await, None);

        tokens.set(Some("fresh".to_string()));
        assert_eq!(tokens.bearer_token().await, Some("fresh".to_string()));
    }
}
