//! Remote half: accepts tunnels, dials targets, relays.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::crypto::{Cipher, TunnelCipher};
use crate::error::{Error, Result};
use crate::proxy::{tunnel, Relay, RelayOutcome};
use crate::server::config::RemoteConfig;
use crate::server::metrics::ServerMetrics;
use crate::server::log_session_end;

/// Tunnel endpoint.
pub struct RemoteServer {
    config: Arc<RemoteConfig>,
    cipher: Arc<dyn Cipher>,
    metrics: Arc<ServerMetrics>,
}

impl RemoteServer {
    pub fn new(config: RemoteConfig) -> Self {
        let cipher: Arc<dyn Cipher> = Arc::new(TunnelCipher::new(&config.key));
        Self {
            config: Arc::new(config),
            cipher,
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("remote listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept tunnels on `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let config = Arc::clone(&self.config);
                    let cipher = Arc::clone(&self.cipher);
                    let metrics = Arc::clone(&self.metrics);

                    tokio::spawn(async move {
                        let active = metrics.increment_connections();
                        tracing::debug!(active, "tunnel from {}", peer_addr);

                        let result =
                            Self::handle_tunnel(&config, cipher, &metrics, stream, peer_addr).await;
                        if let Err(Error::UpstreamUnreachable { .. }) = &result {
                            metrics.increment_upstream_failures();
                        }
                        metrics.decrement_connections();
                        log_session_end(&result, metrics.active_connections());
                        tracing::debug!("stats: {}", metrics.snapshot());
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }
    }

    async fn handle_tunnel(
        config: &RemoteConfig,
        cipher: Arc<dyn Cipher>,
        metrics: &ServerMetrics,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<RelayOutcome> {
        stream.set_nodelay(true)?;

        let target = tokio::time::timeout(
            config.connect_timeout,
            tunnel::read_handshake(&mut stream, cipher.as_ref(), &config.key),
        )
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))??;

        if config.verify_key && !target.verified {
            tracing::info!(
                active = metrics.active_connections(),
                "tunnel from {} failed key verification",
                peer_addr
            );
            return Err(Error::VerificationFailed);
        }

        let addr = format!("{}:{}", target.host, target.port);
        tracing::info!(active = metrics.active_connections(), "target: {}", addr);

        let dial = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr));
        let upstream = match dial.await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(source)) => return Err(Error::UpstreamUnreachable { addr, source }),
            Err(_) => {
                return Err(Error::UpstreamUnreachable {
                    addr,
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };
        upstream.set_nodelay(true)?;

        let outcome = Relay::new(upstream, stream, cipher, config.idle_timeout)
            .run()
            .await?;
        metrics.add_relayed(outcome.bytes_sealed, outcome.bytes_opened);
        tracing::debug!(
            active = metrics.active_connections(),
            "closed {} ({:?})",
            addr,
            outcome.reason
        );
        Ok(outcome)
    }
}
