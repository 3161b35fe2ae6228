//! Policy store: named lists of counted keys.
//!
//! Backs the blacklist, whitelist and direct-domain list (keys are regex
//! patterns, counts are hit counters) as well as the accepted-host and
//! per-target byte ledgers. Each list behaves like a hash of
//! `key -> count`.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryPolicyStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisPolicyStore;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;

/// Blacklisted host patterns.
pub const BLACKLIST: &str = "blacklist";
/// Host patterns exempt from the blacklist.
pub const WHITELIST: &str = "whitelist";
/// Externally maintained direct-domain patterns.
pub const DOMAINLIST: &str = "domainlist";
/// Accepted HTTP hosts, counted per connection.
pub const OKLIST: &str = "oklist";
/// Bytes received per `host:port`.
pub const BYTESLIST: &str = "byteslist";

/// Key-count store consulted by the router and fed by sessions.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Whether `key` is present in `list`.
    async fn is_member(&self, list: &str, key: &str) -> Result<bool>;

    /// All keys of `list`.
    async fn keys(&self, list: &str) -> Result<HashSet<String>>;

    /// Add `amount` to the count of `key` in `list`, creating it at zero.
    async fn increment(&self, list: &str, key: &str, amount: i64) -> Result<()>;
}
