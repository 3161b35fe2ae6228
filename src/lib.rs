//! # splitproxy
//!
//! A local/remote split proxy. The local half is a drop-in SOCKS5 and
//! HTTP/HTTPS proxy for client applications; every accepted connection is
//! carried to a paired remote half over a length-prefixed, symmetrically
//! encrypted byte stream, and the remote half opens the real outbound
//! connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐   SOCKS5 / HTTP   ┌───────────────────────────────────┐
//! │  Application │ ────────────────▶ │ Local                             │
//! └──────────────┘                   │  frontend → router → tunnel      │
//!                                    │  handshake → relay engine         │
//!                                    └──────────────┬────────────────────┘
//!                                                   │ encrypted frames
//!                                    ┌──────────────▼────────────────────┐
//!                                    │ Remote                            │
//!                                    │  handshake read → dial → relay    │
//!                                    └──────────────┬────────────────────┘
//!                                                   ▼
//!                                                target host
//! ```
//!
//! ## Wire Protocol
//!
//! ```text
//! Handshake:
//!   [1: verLen ][verLen : Encrypt(key[8..16])]
//!   [1: hostLen][hostLen: Encrypt(host)]
//!   [2: port (big-endian)]
//! Data frame (either direction):
//!   [2: len (big-endian)][len: Encrypt(payload)]
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod router;
pub mod server;

pub use error::{Error, Result};

/// Size of the client read buffer, and of the initial HTTP request buffer.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Default idle timeout for a relayed session (seconds).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;

/// Lower bound applied to any configured idle timeout (seconds).
pub const MIN_IDLE_TIMEOUT_SECS: u64 = 60;

/// Clamp a configured idle timeout to the supported minimum.
pub fn clamp_idle_timeout(secs: u64) -> u64 {
    secs.max(MIN_IDLE_TIMEOUT_SECS)
}
