//! Upstream selection and blacklist gating.
//!
//! Every connection goes to the primary upstream unless it is an HTTP
//! request for a direct-domain host and direct mode is on, in which case it
//! goes to the secondary upstream. HTTP requests are additionally checked
//! against the blacklist before anything is dialed.
//!
//! Policy lists hold regex patterns as keys. A host is in a list when it is
//! a key itself or matches any key; the matched key's counter is bumped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use crate::crypto::TunnelKey;
use crate::error::{Error, Result};
use crate::policy::{PolicyStore, BLACKLIST, DOMAINLIST, OKLIST, WHITELIST};

/// A tunnel endpoint and the key it expects.
#[derive(Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub key: TunnelKey,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16, key: TunnelKey) -> Self {
        Self {
            host: host.into(),
            port,
            key,
        }
    }

    /// `host:port` suitable for dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Where one connection is tunneled. Fixed for the life of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub key: TunnelKey,
    /// Whether the secondary upstream was chosen
    pub direct: bool,
}

impl RouteDecision {
    fn to(upstream: &Upstream, direct: bool) -> Self {
        Self {
            upstream_host: upstream.host.clone(),
            upstream_port: upstream.port,
            key: upstream.key.clone(),
            direct,
        }
    }

    /// `host:port` of the chosen upstream.
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

/// A compiled direct-domain pattern; equality is on the pattern text.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    pattern: String,
    regex: Regex,
}

impl DomainPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern)
            .map_err(|e| Error::config(format!("invalid domain pattern `{}`: {}", pattern, e)))?;
        Ok(Self { pattern, regex })
    }

    pub fn is_match(&self, host: &str) -> bool {
        self.regex.is_match(host)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl PartialEq for DomainPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for DomainPattern {}

/// Per-connection routing and policy decisions.
pub struct Router {
    primary: Upstream,
    direct: Option<Upstream>,
    direct_patterns: Vec<DomainPattern>,
    with_black_list: bool,
    store: Arc<dyn PolicyStore>,
    /// Compiled store patterns per list; `None` marks a pattern that failed
    /// to compile
    pattern_cache: Mutex<HashMap<String, HashMap<String, Option<Regex>>>>,
}

impl Router {
    /// Route everything to `primary`, with no blacklist.
    pub fn new(primary: Upstream, store: Arc<dyn PolicyStore>) -> Self {
        Self {
            primary,
            direct: None,
            direct_patterns: Vec::new(),
            with_black_list: false,
            store,
            pattern_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Enable direct mode: matching HTTP hosts go to `direct`.
    pub fn with_direct(mut self, direct: Upstream, patterns: Vec<DomainPattern>) -> Self {
        self.direct = Some(direct);
        self.direct_patterns = patterns;
        self
    }

    /// Enable blacklist gating for HTTP requests.
    pub fn with_black_list(mut self, enabled: bool) -> Self {
        self.with_black_list = enabled;
        self
    }

    pub fn primary(&self) -> &Upstream {
        &self.primary
    }

    pub fn is_direct_enabled(&self) -> bool {
        self.direct.is_some()
    }

    /// Pick the upstream for `host`. SOCKS requests always use the primary.
    pub async fn resolve(&self, host: &str, is_socks: bool) -> RouteDecision {
        match &self.direct {
            Some(direct) if !is_socks && self.is_direct_domain(host).await => {
                RouteDecision::to(direct, true)
            }
            _ => RouteDecision::to(&self.primary, false),
        }
    }

    /// Whether `host` is in the direct-domain set: a configured pattern or
    /// the store's domain list.
    pub async fn is_direct_domain(&self, host: &str) -> bool {
        if self.direct_patterns.iter().any(|p| p.is_match(host)) {
            return true;
        }
        self.match_list(DOMAINLIST, host).await.is_some()
    }

    /// Gate an HTTP request. Whitelisted hosts always pass; otherwise the
    /// first matching blacklist pattern rejects it. Accepted hosts are
    /// counted in the ok list.
    pub async fn check_policy(&self, host: &str) -> Result<()> {
        if self.with_black_list && self.match_list(WHITELIST, host).await.is_none() {
            if let Some(pattern) = self.match_patterns(BLACKLIST, host).await {
                self.bump(BLACKLIST, &pattern).await;
                return Err(Error::PolicyRejection {
                    host: host.to_string(),
                    pattern,
                });
            }
        }
        self.bump(OKLIST, host).await;
        Ok(())
    }

    /// Find `host` in `list` by exact key or pattern, counting the hit.
    async fn match_list(&self, list: &str, host: &str) -> Option<String> {
        let exact = match self.store.is_member(list, host).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("policy lookup in {} failed: {}", list, e);
                false
            }
        };
        let matched = if exact {
            Some(host.to_string())
        } else {
            self.match_patterns(list, host).await
        };
        if let Some(key) = &matched {
            self.bump(list, key).await;
        }
        matched
    }

    /// First key of `list` (in sorted order) whose regex matches `host`.
    async fn match_patterns(&self, list: &str, host: &str) -> Option<String> {
        let keys = match self.store.keys(list).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("policy listing of {} failed: {}", list, e);
                return None;
            }
        };
        let mut sorted: Vec<_> = keys.iter().cloned().collect();
        sorted.sort();

        let mut caches = self.pattern_cache.lock();
        let cache = caches.entry(list.to_string()).or_default();
        // Patterns no longer in the store are forgotten
        cache.retain(|pattern, _| keys.contains(pattern));
        sorted.into_iter().find(|pattern| {
            let compiled = cache.entry(pattern.clone()).or_insert_with(|| {
                Regex::new(pattern)
                    .map_err(|e| tracing::warn!("skipping bad {} pattern `{}`: {}", list, pattern, e))
                    .ok()
            });
            compiled.as_ref().map_or(false, |re| re.is_match(host))
        })
    }

    async fn bump(&self, list: &str, key: &str) {
        if let Err(e) = self.store.increment(list, key, 1).await {
            tracing::warn!("policy counter {}[{}] not updated: {}", list, key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::crypto::derive_key;
    use crate::policy::MemoryPolicyStore;

    fn primary() -> Upstream {
        Upstream::new("relay.example.net", 12345, derive_key("primary"))
    }

    fn direct() -> Upstream {
        Upstream::new("10.0.0.2", 23456, derive_key("direct"))
    }

    fn direct_router(store: Arc<MemoryPolicyStore>) -> Router {
        Router::new(primary(), store).with_direct(
            direct(),
            vec![DomainPattern::new(r"\.example\.cn$").unwrap()],
        )
    }

    #[tokio::test]
    async fn test_direct_pattern_selects_secondary() {
        let router = direct_router(Arc::new(MemoryPolicyStore::new()));

        let decision = router.resolve("www.example.cn", false).await;
        assert!(decision.direct);
        assert_eq!(decision.upstream_addr(), "10.0.0.2:23456");
        assert_eq!(decision.key, derive_key("direct"));

        let decision = router.resolve("www.example.com", false).await;
        assert!(!decision.direct);
        assert_eq!(decision.upstream_addr(), "relay.example.net:12345");
        assert_eq!(decision.key, derive_key("primary"));
    }

    #[tokio::test]
    async fn test_socks_always_primary() {
        let router = direct_router(Arc::new(MemoryPolicyStore::new()));

        let decision = router.resolve("www.example.cn", true).await;
        assert!(!decision.direct);
        assert_eq!(decision.upstream_host, "relay.example.net");
    }

    #[tokio::test]
    async fn test_direct_disabled_ignores_patterns() {
        let router = Router::new(primary(), Arc::new(MemoryPolicyStore::new()));
        assert!(!router.is_direct_enabled());

        let decision = router.resolve("www.example.cn", false).await;
        assert!(!decision.direct);
    }

    #[tokio::test]
    async fn test_store_domain_list_selects_secondary() {
        let store = Arc::new(MemoryPolicyStore::new());
        store.insert(DOMAINLIST, "intranet.local");
        store.insert(DOMAINLIST, r"^git\.");
        let router = direct_router(Arc::clone(&store));

        assert!(router.resolve("intranet.local", false).await.direct);
        assert!(router.resolve("git.corp.io", false).await.direct);
        assert!(!router.resolve("www.corp.io", false).await.direct);
        assert_eq!(store.count(DOMAINLIST, r"^git\."), Some(1));
    }

    #[tokio::test]
    async fn test_blacklist_rejects_and_counts() {
        let store = Arc::new(MemoryPolicyStore::new());
        store.insert(BLACKLIST, r"^ads\.");
        let router = Router::new(primary(), store.clone()).with_black_list(true);

        let err = router.check_policy("ads.example.com").await.unwrap_err();
        match err {
            Error::PolicyRejection { host, pattern } => {
                assert_eq!(host, "ads.example.com");
                assert_eq!(pattern, r"^ads\.");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.count(BLACKLIST, r"^ads\."), Some(1));
        assert_eq!(store.count(OKLIST, "ads.example.com"), None);

        router.check_policy("www.example.com").await.unwrap();
        assert_eq!(store.count(OKLIST, "www.example.com"), Some(1));
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_blacklist() {
        let store = Arc::new(MemoryPolicyStore::new());
        store.insert(BLACKLIST, "example");
        store.insert(WHITELIST, r"^docs\.example\.com$");
        let router = Router::new(primary(), store.clone()).with_black_list(true);

        router.check_policy("docs.example.com").await.unwrap();
        assert!(router.check_policy("www.example.com").await.is_err());
        assert_eq!(store.count(WHITELIST, r"^docs\.example\.com$"), Some(1));
    }

    #[tokio::test]
    async fn test_blacklist_mode_off() {
        let store = Arc::new(MemoryPolicyStore::new());
        store.insert(BLACKLIST, ".*");
        let router = Router::new(primary(), store.clone());

        router.check_policy("anything.example").await.unwrap();
        assert_eq!(store.count(BLACKLIST, ".*"), Some(0));
    }

    #[tokio::test]
    async fn test_invalid_store_pattern_skipped() {
        let store = Arc::new(MemoryPolicyStore::new());
        store.insert(BLACKLIST, "(unclosed");
        store.insert(BLACKLIST, "tracker");
        let router = Router::new(primary(), store.clone()).with_black_list(true);

        router.check_policy("www.example.com").await.unwrap();
        assert!(router.check_policy("tracker.example.com").await.is_err());
    }

    #[test]
    fn test_domain_pattern() {
        let p = DomainPattern::new(r"\.cn$").unwrap();
        assert!(p.is_match("baidu.cn"));
        assert!(!p.is_match("cn.com"));
        assert_eq!(p, DomainPattern::new(r"\.cn$").unwrap());
        assert!(DomainPattern::new("(").is_err());
    }

    #[test]
    fn test_upstream_debug_hides_key() {
        let rendered = format!("{:?}", primary());
        assert!(rendered.contains("relay.example.net"));
        assert!(!rendered.contains("key"));
    }

    /// Store whose blacklist can be replaced between lookups.
    struct SwappableStore(Mutex<HashSet<String>>);

    #[async_trait::async_trait]
    impl PolicyStore for SwappableStore {
        async fn is_member(&self, list: &str, key: &str) -> Result<bool> {
            Ok(list == BLACKLIST && self.0.lock().contains(key))
        }

        async fn keys(&self, list: &str) -> Result<HashSet<String>> {
            Ok(if list == BLACKLIST {
                self.0.lock().clone()
            } else {
                HashSet::new()
            })
        }

        async fn increment(&self, _list: &str, _key: &str, _amount: i64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pattern_cache_follows_store() {
        let patterns = ["tracker", "(unclosed", r"^ads\."];
        let store = Arc::new(SwappableStore(Mutex::new(
            patterns.iter().map(|p| p.to_string()).collect(),
        )));
        let router = Router::new(primary(), store.clone()).with_black_list(true);

        router.check_policy("www.example.com").await.unwrap();
        assert_eq!(router.pattern_cache.lock()[BLACKLIST].len(), 3);

        *store.0.lock() = HashSet::from(["tracker".to_string()]);
        router.check_policy("www.example.com").await.unwrap();
        let cached: Vec<_> = router.pattern_cache.lock()[BLACKLIST].keys().cloned().collect();
        assert_eq!(cached, vec!["tracker".to_string()]);
        assert!(router.check_policy("ads.example.com").await.is_ok());
    }
}
