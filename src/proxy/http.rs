//! HTTP proxy request handling.
//!
//! Only the request line of the first buffered read matters: it yields the
//! target and, for `GET`/`HEAD` with an absolute URI, is rewritten into
//! origin form before being forwarded through the tunnel.

use url::Url;

use crate::error::{Error, Result};

/// Literal reply sent to a CONNECT client once its tunnel is open.
pub const CONNECT_REPLY: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

/// Port used when the request target carries none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// A tokenized request line: `METHOD TARGET HTTP/x.y`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub target: &'a str,
    pub version: &'a str,
}

impl<'a> RequestLine<'a> {
    /// Tokenize a single request line.
    ///
    /// Exactly three whitespace-separated tokens are required and the last
    /// must start with `HTTP/`.
    pub fn parse(line: &'a str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let (method, target, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => return Err(Error::protocol("request line needs three tokens")),
        };
        if tokens.next().is_some() {
            return Err(Error::protocol("request line has trailing tokens"));
        }
        if !version.starts_with("HTTP/") {
            return Err(Error::protocol(format!("bad HTTP version: {}", version)));
        }
        Ok(Self {
            method,
            target,
            version,
        })
    }

    /// Whether this is a CONNECT (HTTPS tunnel) request.
    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }
}

/// A parsed HTTP proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub host: String,
    pub port: u16,
    pub is_connect: bool,
    /// Bytes to forward after the tunnel handshake; `None` for CONNECT.
    pub payload: Option<Vec<u8>>,
}

/// Parse the initial buffered bytes of an HTTP proxy connection.
pub fn parse_request(buf: &[u8]) -> Result<HttpRequest> {
    let (line, line_len) = first_line(buf)?;
    let request_line = RequestLine::parse(line)?;
    let is_connect = buf.starts_with(b"CONNECT");
    let (host, port) = parse_target(request_line.target)?;

    let payload = if is_connect {
        None
    } else {
        Some(rewrite_request(buf, &request_line, line_len))
    };

    Ok(HttpRequest {
        host,
        port,
        is_connect,
        payload,
    })
}

/// Split a request target into host and port.
///
/// Targets without a scheme (CONNECT authority form) are read as `http://`.
/// A missing port means port 80, whatever the scheme. Origin-form targets
/// (`/path`) name no host and are rejected.
pub fn parse_target(target: &str) -> Result<(String, u16)> {
    if target.starts_with('/') || authority(target).is_empty() {
        return Err(Error::protocol(format!("request target has no host: {}", target)));
    }

    let absolute = if has_scheme(target) {
        target.to_string()
    } else {
        format!("http://{}", target)
    };

    let url = Url::parse(&absolute)
        .map_err(|e| Error::protocol(format!("bad url {}: {}", absolute, e)))?;
    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return Err(Error::protocol(format!("url has no host: {}", absolute))),
    };

    // `Url::port` hides a port equal to the scheme default
    let port = match url.port() {
        Some(p) => p,
        None if has_explicit_port(&absolute) => {
            url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT)
        }
        None => DEFAULT_HTTP_PORT,
    };

    Ok((host, port))
}

/// Rewrite the request line of `buf` into origin form when it is a
/// `GET`/`HEAD` with an absolute URI. Other requests are returned as-is.
pub fn rewrite_request(buf: &[u8], line: &RequestLine<'_>, line_len: usize) -> Vec<u8> {
    if !matches!(line.method, "GET" | "HEAD") || !has_scheme(line.target) {
        return buf.to_vec();
    }

    let rewritten = format!("{} {} {}", line.method, origin_form(line.target), line.version);
    let mut out = Vec::with_capacity(buf.len());
    out.extend_from_slice(rewritten.as_bytes());
    out.extend_from_slice(&buf[line_len..]);
    out
}

/// Strip scheme and authority from an absolute URI, keeping the raw path
/// and query bytes untouched.
fn origin_form(target: &str) -> String {
    let rest = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    match rest.find(['/', '?', '#']) {
        Some(i) if rest.as_bytes()[i] == b'/' => rest[i..].to_string(),
        Some(i) => format!("/{}", &rest[i..]),
        None => "/".to_string(),
    }
}

fn has_scheme(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

/// The `[userinfo@]host[:port]` part of a target, with or without scheme.
fn authority(target: &str) -> &str {
    let rest = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target);
    rest.split(['/', '?', '#']).next().unwrap_or("")
}

fn has_explicit_port(absolute: &str) -> bool {
    let authority = authority(absolute);
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    let after_host = match host_port.rfind(']') {
        Some(i) => &host_port[i + 1..],
        None => host_port,
    };
    after_host.contains(':')
}

/// Return the first line of `buf` (without line terminator) and its length
/// excluding the terminator.
fn first_line(buf: &[u8]) -> Result<(&str, usize)> {
    let end = buf
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| if i > 0 && buf[i - 1] == b'\r' { i - 1 } else { i })
        .unwrap_or(buf.len());
    let line = std::str::from_utf8(&buf[..end])
        .map_err(|_| Error::protocol("request line is not valid UTF-8"))?;
    Ok((line, end))
}
