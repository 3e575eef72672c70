//! Per-identity write serialization
//!
//! Every mutation of a principal (checkpoint, spend, verification refresh,
//! merge) holds that identity's lock for its read-modify-write. The store's
//! version compare-and-swap catches anything that slips past, such as a
//! second process on the same database.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

#[derive(Default)]
pub struct IdentityLocks {
    locks: Arc<LockTable>,
}

/// Held lock on one identity. Dropping it releases the lock and removes the
/// table entry once nobody else holds or waits on it.
pub struct IdentityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    identity: String,
    table: Arc<LockTable>,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        // Release first so our own clone no longer counts
        drop(self.guard.take());
        self.table
            .remove_if(&self.identity, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, identity: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, identity: &str) -> IdentityGuard {
        let guard = self.slot(identity).lock_owned().await;
        IdentityGuard {
            guard: Some(guard),
            identity: identity.to_string(),
            table: Arc::clone(&self.locks),
        }
    }

    /// Lock several identities in sorted order so overlapping groups never deadlock.
    pub async fn lock_many(&self, identities: &[String]) -> Vec<IdentityGuard> {
        let mut ordered: Vec<&String> = identities.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for identity in ordered {
            guards.push(self.lock(identity).await);
        }
        guards
    }

    /// Identities currently locked or awaited
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
