//! Cancellation tokens for in-flight generations and judge calls

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::SlotKey;

/// A token handed out for one in-flight call. `id` lets the owner release
/// exactly the token it was given, even if a newer one replaced it.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug)]
struct Registry {
    parent: Option<CancellationToken>,
    root: CancellationToken,
    next_id: u64,
    active: HashMap<SlotKey, IssuedToken>,
}

/// Owns one cancellation token per in-flight call.
///
/// Every issued token is a child of a root token, so `cancel_all` reaches
/// tokens handed out concurrently with it. Cancellation is cooperative: the
/// holder checks its token at each suspension point.
#[derive(Debug)]
pub struct CancellationController {
    registry: Mutex<Registry>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A controller whose tokens are also cancelled when `parent` is
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self::build(Some(parent.clone()))
    }

    fn build(parent: Option<CancellationToken>) -> Self {
        let root = fresh_root(parent.as_ref());
        Self {
            registry: Mutex::new(Registry {
                parent,
                root,
                next_id: 0,
                active: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh token for `key`. A token still registered for the same key
    /// is cancelled first.
    pub fn issue(&self, key: SlotKey) -> IssuedToken {
        let mut registry = self.lock();
        registry.next_id += 1;
        let issued = IssuedToken {
            id: registry.next_id,
            token: registry.root.child_token(),
        };
        if let Some(previous) = registry.active.insert(key, issued.clone()) {
            previous.token.cancel();
        }
        issued
    }

    /// Abort the call running under `key`. Returns false if nothing was in flight.
    pub fn cancel(&self, key: SlotKey) -> bool {
        match self.lock().active.remove(&key) {
            Some(issued) => {
                debug!(slot = %key, "cancelling");
                issued.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Abort every outstanding call. Tokens issued afterwards are unaffected.
    pub fn cancel_all(&self) -> usize {
        let mut registry = self.lock();
        let count = registry.active.len();
        debug!(count, "cancelling all");
        registry.root.cancel();
        registry.root = fresh_root(registry.parent.as_ref());
        registry.active.clear();
        count
    }

    /// Drop the registration for `key` if it still belongs to `id`.
    pub fn release(&self, key: SlotKey, id: u64) {
        let mut registry = self.lock();
        if registry.active.get(&key).is_some_and(|t| t.id == id) {
            registry.active.remove(&key);
        }
    }

    pub fn is_active(&self, key: SlotKey) -> bool {
        self.lock().active.contains_key(&key)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }
}

fn fresh_root(parent: Option<&CancellationToken>) -> CancellationToken {
    parent.map_or_else(CancellationToken::new, CancellationToken::child_token)
}
