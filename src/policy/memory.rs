//! In-process policy store.
//!
//! Used when no external store is configured. Such a store is seeded from
//! the configured lists and only counts hits on those seeded keys.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::policy::PolicyStore;

/// Policy store held entirely in memory.
#[derive(Default)]
pub struct MemoryPolicyStore {
    lists: RwLock<HashMap<String, HashMap<String, i64>>>,
    /// Increments of absent keys are dropped
    known_keys_only: bool,
}

impl MemoryPolicyStore {
    /// Create an empty store that records every increment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only count keys that were inserted beforehand.
    pub fn known_keys_only(mut self) -> Self {
        self.known_keys_only = true;
        self
    }

    /// Add `key` to `list` with a zero count, keeping an existing count.
    pub fn insert(&self, list: &str, key: impl Into<String>) {
        self.lists
            .write()
            .entry(list.to_string())
            .or_default()
            .entry(key.into())
            .or_insert(0);
    }

    /// Current count of `key` in `list`.
    pub fn count(&self, list: &str, key: &str) -> Option<i64> {
        self.lists.read().get(list)?.get(key).copied()
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn is_member(&self, list: &str, key: &str) -> Result<bool> {
        Ok(self
            .lists
            .read()
            .get(list)
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false))
    }

    async fn keys(&self, list: &str) -> Result<HashSet<String>> {
        Ok(self
            .lists
            .read()
            .get(list)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn increment(&self, list: &str, key: &str, amount: i64) -> Result<()> {
        let mut lists = self.lists.write();
        if self.known_keys_only {
            if let Some(count) = lists.get_mut(list).and_then(|entries| entries.get_mut(key)) {
                *count += amount;
            }
            return Ok(());
        }
        *lists
            .entry(list.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += amount;
        Ok(())
    }
}
