// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! At-most-one-in-flight guard.
//!
//! A best-effort de-duplication layer keyed by identity: a second attempt
//! for an identity already being processed is refused, not queued. The set
//! lives in process memory, so it does not survive a restart and does not
//! coordinate across worker processes. The next event or poll cycle
//! restores consistency after a refused attempt.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Set of identities currently being processed.
#[derive(Debug)]
pub struct InFlightSet<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Clone for InFlightSet<K> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for InFlightSet<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug> InFlightSet<K> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if it is already claimed.
    pub fn try_acquire(&self, key: K) -> Option<InFlightGuard<K>> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        if keys.insert(key.clone()) {
            Some(InFlightGuard {
                keys: self.keys.clone(),
                key,
            })
        } else {
            None
        }
    }

    /// Whether `key` is claimed.
    pub fn contains(&self, key: &K) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(key)
    }

    /// Number of claimed keys.
    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// No key is claimed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claim on one key; released on drop.
#[derive(Debug)]
pub struct InFlightGuard<K: Eq + Hash> {
    keys: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash> InFlightGuard<K> {
    /// The claimed key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused_until_release() {
        let set = InFlightSet::new();
        let guard = set.try_acquire(7_i64).unwrap();
        assert!(set.try_acquire(7).is_none());
        assert!(set.try_acquire(8).is_some());
        assert!(set.contains(&7));

        drop(guard);
        assert!(!set.contains(&7));
        assert!(set.try_acquire(7).is_some());
    }

    #[tokio::test]
    async fn test_guard_released_when_task_panics() {
        let set = InFlightSet::new();
        let clone = set.clone();
        let handle = tokio::spawn(async move {
            let _guard = clone.try_acquire("w1".to_string()).unwrap();
            panic!("boom");
        });
        assert!(handle.await.is_err());
        assert!(set.is_empty());
    }
}
