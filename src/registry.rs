//! Runtime provider registry: resolve named dependencies at call time.

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::NotRegistered;

/// Maps string tags to providers.
///
/// A registry is explicitly constructed and owned by its scope; nothing
/// here is process-global. Tags can be registered and removed at runtime,
/// so a handle may be resolved before its concrete provider exists.
pub struct Registry<P> {
    providers: RwLock<AHashMap<String, P>>,
    fallback: RwLock<Option<P>>,
}

impl<P: Clone> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone> Registry<P> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(AHashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Registers `provider` under `tag`, replacing any previous entry.
    pub fn register(&self, tag: impl Into<String>, provider: P) {
        self.providers.write().insert(tag.into(), provider);
    }

    /// Removes and returns the provider registered under `tag`.
    pub fn deregister(&self, tag: &str) -> Option<P> {
        self.providers.write().remove(tag)
    }

    /// Whether `tag` is currently registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.providers.read().contains_key(tag)
    }

    /// Configures a substitute returned for tags that are not registered.
    pub fn set_fallback(&self, provider: P) {
        *self.fallback.write() = Some(provider);
    }

    /// Resolves `tag`, substituting the configured fallback for missing
    /// tags.
    pub fn resolve(&self, tag: &str) -> Result<P, NotRegistered> {
        if let Some(provider) = self.providers.read().get(tag) {
            return Ok(provider.clone());
        }

        tracing::debug!(tag, "tag not registered, checking fallback");
        match self.fallback.read().as_ref() {
            Some(provider) => Ok(provider.clone()),
            None => Err(NotRegistered::new(tag)),
        }
    }
}
