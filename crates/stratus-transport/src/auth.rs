// Auth token accessor.
use parking_lot::RwLock;

/// Source of the current auth token. Read on every request and every socket
/// connect, so a rotated token is picked up by the next reconnect.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A token that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticToken {
    value: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(token: impl Into<String>) -> Self {
        let this = Self::default();
        this.set(Some(token.into()));
        this
    }

    pub fn set(&self, token: Option<String>) {
        *self.value.write() = token.filter(|value| !value.is_empty());
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.value.read().clone()
    }
}
