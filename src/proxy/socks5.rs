//! SOCKS5 negotiation (no-auth only).
//!
//! The version byte has already been consumed by the front-end classifier,
//! so negotiation starts at the method count. The bound address in the
//! success reply is always `0.0.0.0:0`.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

/// "No authentication required" method
const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;

/// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Method selection reply: version 5, no authentication.
pub const METHOD_REPLY: [u8; 2] = [SOCKS5_VERSION, AUTH_NO_AUTH];

/// Success reply with a zeroed bound address.
pub const SUCCESS_REPLY: [u8; 10] = [SOCKS5_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];

/// Negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5State {
    /// Waiting for the method list
    AwaitGreeting,
    /// Method selected, waiting for the CONNECT/BIND request
    AwaitRequest,
    /// Success reply sent
    Established,
}

/// Target requested by a SOCKS5 client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Target {
    pub host: String,
    pub port: u16,
}

/// Drives the negotiation on one client stream.
pub struct Socks5Negotiation<'a, S> {
    stream: &'a mut S,
    state: Socks5State,
}

impl<'a, S> Socks5Negotiation<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Start negotiating on a stream whose version byte was already read.
    pub fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            state: Socks5State::AwaitGreeting,
        }
    }

    /// Current state.
    pub fn state(&self) -> Socks5State {
        self.state
    }

    /// Run the negotiation to completion.
    ///
    /// On any failure the caller closes the connection; a greeting without
    /// the no-auth method gets no reply at all.
    pub async fn run(mut self) -> Result<Socks5Target> {
        loop {
            match self.state {
                Socks5State::AwaitGreeting => {
                    self.read_greeting().await?;
                    self.stream.write_all(&METHOD_REPLY).await?;
                    self.state = Socks5State::AwaitRequest;
                }
                Socks5State::AwaitRequest => {
                    let target = self.read_request().await?;
                    self.stream.write_all(&SUCCESS_REPLY).await?;
                    self.state = Socks5State::Established;
                    return Ok(target);
                }
                Socks5State::Established => {
                    return Err(Error::protocol("SOCKS5 negotiation already finished"));
                }
            }
        }
    }

    async fn read_greeting(&mut self) -> Result<()> {
        let nmethods = self.stream.read_u8().await? as usize;
        let mut methods = vec![0u8; nmethods];
        self.stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_NO_AUTH) {
            return Err(Error::protocol("client does not offer no-auth method"));
        }
        Ok(())
    }

    async fn read_request(&mut self) -> Result<Socks5Target> {
        let mut req = [0u8; 4];
        self.stream.read_exact(&mut req).await?;
        let [ver, cmd, _rsv, atyp] = req;

        if ver != SOCKS5_VERSION {
            return Err(Error::protocol(format!("ver should be 5, got {}", ver)));
        }
        if cmd != CMD_CONNECT && cmd != CMD_BIND {
            return Err(Error::protocol(format!("bad cmd: {}", cmd)));
        }

        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                self.stream.read_exact(&mut octets).await?;
                Ipv4Addr::from(octets).to_string()
            }
            ATYP_DOMAIN => {
                let len = self.stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                self.stream.read_exact(&mut domain).await?;
                String::from_utf8(domain)
                    .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?
            }
            other => return Err(Error::UnsupportedAddressType(other)),
        };

        let port = self.stream.read_u16().await?;
        Ok(Socks5Target { host, port })
    }
}

/// Negotiate SOCKS5 on a stream whose version byte was already consumed.
pub async fn negotiate<S>(stream: &mut S) -> Result<Socks5Target>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Socks5Negotiation::new(stream).run().await
}
