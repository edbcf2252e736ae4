//! Bearer-token access.
//!
//! The token is owned by whoever persists it; the manager only ever reads it,
//! once per connection attempt.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Opaque bearer credential. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for building the connect URL and headers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// `Bearer {token}` for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken(***)")
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Synchronous, read-only lookup of bearer tokens by key.
pub trait TokenStore: Send + Sync + 'static {
    /// Returns the token stored under `key`, or `None` when absent.
    fn get(&self, key: &str) -> Option<AuthToken>;
}

impl<F> TokenStore for F
where
    F: Fn(&str) -> Option<AuthToken> + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<AuthToken> {
        self(key)
    }
}

/// In-process token store.
///
/// Applications refresh the token here after an authentication rejection and
/// then call `connect()` again.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, AuthToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token. Blank tokens remove the entry instead.
    pub fn set(&self, key: impl Into<String>, token: impl Into<String>) {
        let key = key.into();
        let token = token.into();
        let mut tokens = self.tokens.write();
        if token.trim().is_empty() {
            tokens.remove(&key);
        } else {
            tokens.insert(key, AuthToken::new(token));
        }
    }

    pub fn remove(&self, key: &str) -> Option<AuthToken> {
        self.tokens.write().remove(key)
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Option<AuthToken> {
        self.tokens.read().get(key).cloned()
    }
}
