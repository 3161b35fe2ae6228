//! Listeners for both halves of the proxy.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        LocalServer                         │
//! │  accept ──▶ Session (one task per client)                  │
//! │              │ frontend::read_request                      │
//! │              │ Router::check_policy (HTTP only)            │
//! │              │ Router::resolve ──▶ dial upstream           │
//! │              │ tunnel::open_tunnel                         │
//! │              ▼ Relay (client ⇄ frames)                     │
//! │                                                            │
//! │  ServerState: config · router · registry · store · metrics │
//! └────────────────────────────────────────────────────────────┘
//!                     │ tunnel
//! ┌───────────────────▼────────────────────────────────────────┐
//! │  RemoteServer: read_handshake ─▶ dial target ─▶ Relay      │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
mod metrics;
mod registry;
mod remote;
mod session;

pub use config::{LocalConfig, LocalConfigFile, RemoteConfig, RemoteConfigFile};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use registry::{format_span, SessionEntry, SessionGuard, SessionRegistry, TrafficAccounting};
pub use remote::RemoteServer;
pub use session::{Session, SessionId, SessionState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::policy::{MemoryPolicyStore, PolicyStore, BLACKLIST, WHITELIST};
use crate::proxy::RelayOutcome;
use crate::router::Router;

/// State shared by every session of the local half.
pub struct ServerState {
    pub config: LocalConfig,
    pub router: Router,
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<dyn PolicyStore>,
    pub metrics: ServerMetrics,
}

impl ServerState {
    /// Build the shared state around an already opened policy store.
    pub fn new(config: LocalConfig, store: Arc<dyn PolicyStore>) -> Self {
        let mut router = Router::new(config.primary.clone(), Arc::clone(&store))
            .with_black_list(config.with_black_list);
        if config.with_direct {
            if let Some(direct) = &config.direct {
                router = router.with_direct(direct.clone(), config.domain_patterns.clone());
            }
        }

        Self {
            config,
            router,
            registry: Arc::new(SessionRegistry::new()),
            store,
            metrics: ServerMetrics::new(),
        }
    }

    /// One-line summary of the counters and the busiest open target.
    pub fn stats_line(&self) -> String {
        let stats = self.metrics.snapshot();
        match self.registry.snapshot().into_iter().next() {
            Some((target, entry)) => format!(
                "{}; {} open targets, busiest {} ({} sessions, {} bytes)",
                stats,
                self.registry.len(),
                target,
                entry.count,
                entry.bytes
            ),
            None => format!("{}; no open targets", stats),
        }
    }
}

/// Open the policy store named by the configuration: Redis when a URL is
/// given and the `redis` feature is built in, otherwise an in-memory store
/// seeded from the configured lists that only counts hits on those.
pub async fn open_policy_store(config: &LocalConfig) -> Result<Arc<dyn PolicyStore>> {
    if let Some(url) = &config.redis_url {
        #[cfg(feature = "redis")]
        {
            let store = crate::policy::RedisPolicyStore::connect(url).await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis"))]
        tracing::warn!("redis_url {} ignored: built without the redis feature", url);
    }

    let store = MemoryPolicyStore::new().known_keys_only();
    for pattern in &config.black_list {
        store.insert(BLACKLIST, pattern.as_str());
    }
    for pattern in &config.white_list {
        store.insert(WHITELIST, pattern.as_str());
    }
    Ok(Arc::new(store))
}

/// Log how a session ended at the level its cause deserves.
pub(crate) fn log_session_end(result: &Result<RelayOutcome>, active: u64) {
    let e = match result {
        Ok(_) => return,
        Err(e) => e,
    };
    match e {
        Error::PolicyRejection { .. } => {}
        Error::FrameCorruption => tracing::error!(active, "session closed: {}", e),
        e if e.is_expected_close() => tracing::debug!(active, "session closed: {}", e),
        e => tracing::info!(active, "session closed: {}", e),
    }
}

/// Client-facing listener of the local half.
pub struct LocalServer {
    state: Arc<ServerState>,
    next_id: AtomicU64,
}

impl LocalServer {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(
            "local listening on {} ({} direct proxy)",
            addr,
            if self.state.router.is_direct_enabled() {
                "with"
            } else {
                "without"
            }
        );
        self.serve(listener).await
    }

    /// Accept clients on `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        let active = state.metrics.increment_connections();
                        tracing::debug!(active, "connected from {}", peer_addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
                        }

                        let mut session = Session::new(id, Arc::clone(&state));
                        let result = session.run(stream).await;

                        state.metrics.decrement_connections();
                        log_session_end(&result, state.metrics.active_connections());
                        tracing::debug!("stats: {}", state.stats_line());
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }
    }
}
