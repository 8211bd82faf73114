//! Credential storage consulted before every connection attempt.

use std::sync::{PoisonError, RwLock};

/// Supplies the opaque token used for the channel handshake and REST calls.
///
/// A missing token is not an error: the channel simply stays down until the
/// host signs in elsewhere and stores one.
pub trait TokenStore: Send + Sync {
    fn token(&self) -> Option<String>;

    /// Forget the token, e.g. after the server reported it expired.
    fn clear(&self);
}

/// In-memory token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }
}

impl TokenStore for MemoryTokenStore {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_clear() {
        let store = MemoryTokenStore::new(None);
        assert!(store.token().is_none());
        store.set("abc");
        assert_eq!(store.token().as_deref(), Some("abc"));
        store.clear();
        assert!(store.token().is_none());
    }
}
