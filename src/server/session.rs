//! One client connection on the local half, from accept to teardown.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::crypto::{Cipher, TunnelCipher};
use crate::error::{Error, Result};
use crate::proxy::http::CONNECT_REPLY;
use crate::proxy::{frontend, tunnel, Protocol, Relay, RelayOutcome};
use crate::server::registry::{format_span, SessionGuard, TrafficAccounting};
use crate::server::ServerState;

/// Unique session identifier.
pub type SessionId = u64;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading the client request, routing and writing the tunnel handshake
    Handshaking,
    /// Relay running
    Relaying,
    /// Torn down
    Closed,
}

/// A single client session.
pub struct Session {
    id: SessionId,
    state: SessionState,
    server: Arc<ServerState>,
}

impl Session {
    pub fn new(id: SessionId, server: Arc<ServerState>) -> Self {
        Self {
            id,
            state: SessionState::Handshaking,
            server,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve `client` until it, the upstream, or the idle timer ends the
    /// session. The state is `Closed` afterwards on every path.
    pub async fn run<C>(&mut self, client: C) -> Result<RelayOutcome>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let result = self.serve(client).await;
        self.state = SessionState::Closed;
        result
    }

    async fn serve<C>(&mut self, mut client: C) -> Result<RelayOutcome>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let server = Arc::clone(&self.server);
        let session = self.id;
        let active = server.metrics.active_connections();

        // A client that never finishes its request is cut after the idle period
        let idle = server.config.idle_timeout;
        let request = match tokio::time::timeout(idle, frontend::read_request(&mut client)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                if e.is_protocol_violation() {
                    server.metrics.increment_protocol_errors();
                }
                return Err(e);
            }
            Err(_) => return Err(Error::Timeout(idle)),
        };
        let target = request.target();
        tracing::info!(session, kind = %request.protocol, active, "target: {}", target);

        if !request.protocol.is_socks() {
            if let Err(e) = server.router.check_policy(&request.host).await {
                if let Error::PolicyRejection { host, pattern } = &e {
                    server.metrics.increment_rejected();
                    tracing::info!(
                        session,
                        active,
                        "closed black site: {} (matched `{}`)",
                        host,
                        pattern
                    );
                }
                return Err(e);
            }
        }

        let route = server
            .router
            .resolve(&request.host, request.protocol.is_socks())
            .await;
        let upstream_addr = route.upstream_addr();
        let mut upstream = match TcpStream::connect(&upstream_addr).await {
            Ok(stream) => stream,
            Err(source) => {
                server.metrics.increment_upstream_failures();
                return Err(Error::UpstreamUnreachable {
                    addr: upstream_addr,
                    source,
                });
            }
        };
        upstream.set_nodelay(true)?;
        tracing::debug!(
            session,
            active,
            direct = route.direct,
            "connected to upstream {} for {}",
            upstream_addr,
            target
        );

        let guard = SessionGuard::new(Arc::clone(&server.registry), target);
        let cipher: Arc<dyn Cipher> = Arc::new(TunnelCipher::new(&route.key));
        tunnel::open_tunnel(
            &mut upstream,
            cipher.as_ref(),
            &route.key,
            &request.host,
            request.port,
            request.initial_payload.as_deref(),
        )
        .await?;
        if request.protocol == Protocol::Https {
            client.write_all(CONNECT_REPLY).await?;
        }

        self.state = SessionState::Relaying;
        let started = Instant::now();
        let accounting = TrafficAccounting::new(
            Arc::clone(&server.registry),
            Arc::clone(&server.store),
            guard.key().to_string(),
        );
        let outcome = Relay::new(client, upstream, cipher, server.config.idle_timeout)
            .with_observer(Arc::new(accounting))
            .run()
            .await?;

        server
            .metrics
            .add_relayed(outcome.bytes_sealed, outcome.bytes_opened);
        let bytes = guard.entry().map(|e| e.bytes).unwrap_or_default();
        tracing::debug!(
            session,
            active = server.metrics.active_connections(),
            "closed {} after {} ({:?}, {} bytes received by all sessions)",
            guard.key(),
            format_span(started.elapsed().as_secs() as i64),
            outcome.reason,
            bytes
        );
        drop(guard);
        Ok(outcome)
    }
}
