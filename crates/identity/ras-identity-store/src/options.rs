//! Opaque per-call options handed through to store backends.

use http::Extensions;

/// Side-channel passed unexamined from the caller to the store backend.
///
/// Cookie-backed stores typically carry the request and response handles of
/// the current HTTP exchange here; database-backed stores may carry a
/// transaction or tenant handle. Values are keyed by their type.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    extensions: Extensions,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value, replacing any previous value of the same type
    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.extensions.insert(value);
        self
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.extensions.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.extensions.get_mut::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
