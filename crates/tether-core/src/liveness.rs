//! Liveness tracking for proxies of remote entities.
//!
//! Each proxy carries a [`DisposeGuard`]. The guard fires its disposal
//! callback exactly once: either when `dispose()` is called explicitly or when
//! the last handle to the proxy is dropped. The callback evicts the proxy from
//! its [`LivenessRegistry`] and notifies the peer so the peer can release the
//! strong reference it keeps for the remote side.
//!
//! Drop-driven disposal only happens once every clone of a handle is gone,
//! so reclamation is bounded over time rather than per call. Long-lived
//! clones (for example a callback stored in a listener list) keep the remote
//! entry alive until they are removed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Why a guard fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    /// `dispose()` was called.
    Explicit,
    /// The last handle was dropped.
    Dropped,
}

pub(crate) type DisposeCallback = Arc<dyn Fn(&str, DisposeReason) + Send + Sync>;

/// Fires a disposal callback exactly once.
pub struct DisposeGuard {
    id: String,
    disposed: AtomicBool,
    on_dispose: DisposeCallback,
}

impl DisposeGuard {
    pub(crate) fn new(id: impl Into<String>, on_dispose: DisposeCallback) -> Self {
        Self {
            id: id.into(),
            disposed: AtomicBool::new(false),
            on_dispose,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Dispose explicitly. Returns false if already disposed.
    pub fn dispose(&self) -> bool {
        self.fire(DisposeReason::Explicit)
    }

    fn fire(&self, reason: DisposeReason) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        (self.on_dispose)(&self.id, reason);
        true
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        self.fire(DisposeReason::Dropped);
    }
}

impl fmt::Debug for DisposeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposeGuard")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Memoizes proxies by remote id without keeping them alive.
///
/// Repeated lookups of a live id return the same `Arc`, so proxy identity
/// mirrors remote identity.
pub struct LivenessRegistry<T> {
    entries: Mutex<HashMap<String, Weak<T>>>,
}

impl<T> Default for LivenessRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> LivenessRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live proxy for `id`, if any.
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries.lock().get(id).and_then(Weak::upgrade)
    }

    /// The live proxy for `id`, creating one with `make` if none is alive.
    ///
    /// `make` runs under the registry lock and must not touch this registry.
    pub fn get_or_insert_with(&self, id: &str, make: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(id).and_then(Weak::upgrade) {
            return existing;
        }
        let created = make();
        entries.insert(id.to_string(), Arc::downgrade(&created));
        created
    }

    /// Evict `id` unconditionally.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Evict `id` only if its proxy is no longer reachable.
    ///
    /// A newer live proxy registered under the same id is left alone.
    pub fn remove_if_dead(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(weak) if weak.strong_count() == 0 => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Number of entries whose proxy is still reachable.
    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
