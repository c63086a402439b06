//! Access token collaborator
//!
//! Token acquisition lives outside the engine; components only ask for the
//! current bearer token.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current bearer token, `None` when signed out
    async fn current_token(&self) -> Result<Option<String>>;

    fn is_authenticated(&self) -> bool;
}

/// Token held in memory, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn current_token(&self) -> Result<Option<String>> {
        Ok(self.token.read().clone())
    }

    fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }
}
