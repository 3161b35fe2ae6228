//! Front-end protocol classification.
//!
//! The first byte of a new client connection decides everything: `5` is a
//! SOCKS5 greeting, anything above is the first letter of an HTTP verb,
//! anything below is rejected.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::{Error, Result};
use crate::proxy::http;
use crate::proxy::socks5::{self, SOCKS5_VERSION};
use crate::READ_BUFFER_SIZE;

/// Protocol spoken by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// SOCKS5 CONNECT/BIND
    Socks5,
    /// Plain HTTP proxy request (absolute URI)
    Http,
    /// HTTP CONNECT tunnel
    Https,
}

impl Protocol {
    /// Whether routing must treat this request as SOCKS.
    pub fn is_socks(self) -> bool {
        matches!(self, Protocol::Socks5)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Socks5 => "socks",
            Protocol::Http => "http",
            Protocol::Https => "HTTPS",
        })
    }
}

/// What the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Bytes to forward right after the tunnel handshake
    pub initial_payload: Option<Vec<u8>>,
}

impl ClientRequest {
    /// `host:port` of the requested target.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Classify a freshly accepted connection and extract its target.
///
/// SOCKS5 replies are written during negotiation. The CONNECT reply is left
/// to the caller, which sends it once the tunnel is open. Everything after
/// that is opaque payload.
pub async fn read_request<S>(stream: &mut S) -> Result<ClientRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = stream.read_u8().await?;

    if first == SOCKS5_VERSION {
        let target = socks5::negotiate(stream).await?;
        return Ok(ClientRequest {
            protocol: Protocol::Socks5,
            host: target.host,
            port: target.port,
            initial_payload: None,
        });
    }

    if first < SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "only HTTP and SOCKS5 are supported, got first byte {}",
            first
        )));
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    buf[0] = first;
    let n = stream.read(&mut buf[1..]).await?;
    buf.truncate(n + 1);
    tracing::trace!("got content from client:\n{}", String::from_utf8_lossy(&buf));

    let request = http::parse_request(&buf)?;

    Ok(ClientRequest {
        protocol: if request.is_connect {
            Protocol::Https
        } else {
            Protocol::Http
        },
        host: request.host,
        port: request.port,
        initial_payload: request.payload,
    })
}
