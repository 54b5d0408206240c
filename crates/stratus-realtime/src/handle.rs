// Capability returned by subscribe.
use futures::future::BoxFuture;

type Release = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Removes exactly the registration that produced it: one callback under one
/// topic key. Dropping the handle without calling [`unsubscribe`] leaves the
/// subscription in place.
///
/// [`unsubscribe`]: UnsubscribeHandle::unsubscribe
#[must_use = "dropping the handle keeps the subscription active"]
pub struct UnsubscribeHandle {
    key: String,
    release: Release,
}

impl UnsubscribeHandle {
    pub(crate) fn new<F>(key: String, release: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            key,
            release: Box::new(release),
        }
    }

    /// Registry key this handle refers to.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn unsubscribe(self) {
        (self.release)().await;
    }
}

impl std::fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsubscribeHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
