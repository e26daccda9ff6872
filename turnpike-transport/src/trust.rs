//! Trust set: the thumbprints a listener accepts.
//!
//! A single mutex-guarded set. The surface is small and contention is
//! negligible next to the TLS handshake that precedes every read.

use std::collections::HashSet;
use std::sync::Mutex;

use turnpike_core::Thumbprint;

/// Set of trusted client thumbprints, read on every TLS accept.
#[derive(Default)]
pub struct TrustSet {
    inner: Mutex<HashSet<Thumbprint>>,
}

impl TrustSet {
    /// Create an empty trust set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a thumbprint. Returns `false` if it was already present.
    pub fn add(&self, thumbprint: Thumbprint) -> bool {
        self.lock().insert(thumbprint)
    }

    /// Stop trusting a thumbprint. Returns `false` if it was not present.
    pub fn remove(&self, thumbprint: &Thumbprint) -> bool {
        self.lock().remove(thumbprint)
    }

    /// Replace the whole set.
    pub fn replace(&self, thumbprints: impl IntoIterator<Item = Thumbprint>) {
        *self.lock() = thumbprints.into_iter().collect();
    }

    /// Whether a thumbprint is trusted.
    pub fn contains(&self, thumbprint: &Thumbprint) -> bool {
        self.lock().contains(thumbprint)
    }

    /// Number of trusted thumbprints.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is trusted.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Thumbprint>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
