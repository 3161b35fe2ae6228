//! Local and remote configuration.
//!
//! Each half has a file format (`*ConfigFile`, serde) and a runtime form
//! (`*Config`) with keys derived and defaults applied. Conversion validates
//! everything once, at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{derive_key, TunnelKey};
use crate::error::{Error, Result};
use crate::router::{DomainPattern, Upstream};
use crate::{clamp_idle_timeout, DEFAULT_IDLE_TIMEOUT_SECS};

const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
const DEFAULT_LOCAL_PORT: u16 = 1080;
const DEFAULT_REMOTE_HOST: &str = "0.0.0.0";
const DEFAULT_REMOTE_PORT: u16 = 12345;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

fn default_local_host() -> String {
    DEFAULT_LOCAL_HOST.to_string()
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

fn default_remote_host() -> String {
    DEFAULT_REMOTE_HOST.to_string()
}

fn default_remote_port() -> u16 {
    DEFAULT_REMOTE_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Local half configuration file (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfigFile {
    #[serde(default = "default_local_host")]
    pub listen_host: String,
    #[serde(default = "default_local_port")]
    pub listen_port: u16,
    /// Primary upstream host
    #[serde(default)]
    pub host: String,
    /// Primary upstream port
    #[serde(default)]
    pub port: u16,
    /// Primary passphrase
    #[serde(default)]
    pub key: String,
    /// Direct-domain regex patterns
    #[serde(default)]
    pub domain_list: Vec<String>,
    #[serde(default)]
    pub direct_host: Option<String>,
    #[serde(default)]
    pub direct_port: Option<u16>,
    #[serde(default)]
    pub direct_key: Option<String>,
    #[serde(default)]
    pub with_direct: bool,
    #[serde(default)]
    pub with_black_list: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Patterns seeded into the in-memory blacklist
    #[serde(default)]
    pub black_list: Vec<String>,
    /// Patterns seeded into the in-memory whitelist
    #[serde(default)]
    pub white_list: Vec<String>,
}

impl LocalConfigFile {
    /// Parse a JSON configuration.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::config(format!("invalid JSON: {}", e)))
    }

    /// Convert to runtime configuration, deriving keys.
    pub fn to_config(&self) -> Result<LocalConfig> {
        if self.host.trim().is_empty() {
            return Err(Error::config("host is required"));
        }
        if self.port == 0 {
            return Err(Error::config("port is required"));
        }
        if self.key.trim().is_empty() {
            return Err(Error::config("key is required"));
        }

        let key = derive_key(&self.key);
        let primary = Upstream::new(self.host.trim(), self.port, key.clone());

        let direct = match (&self.direct_host, self.direct_port) {
            (Some(host), Some(port)) if !host.trim().is_empty() && port != 0 => {
                let direct_key = match &self.direct_key {
                    Some(k) if !k.trim().is_empty() => derive_key(k),
                    _ => key.clone(),
                };
                Some(Upstream::new(host.trim(), port, direct_key))
            }
            _ => None,
        };

        let domain_patterns = self
            .domain_list
            .iter()
            .map(|p| DomainPattern::new(p.as_str()))
            .collect::<Result<Vec<_>>>()?;

        let config = LocalConfig {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            primary,
            direct,
            domain_patterns,
            with_direct: self.with_direct,
            with_black_list: self.with_black_list,
            idle_timeout: Duration::from_secs(clamp_idle_timeout(self.timeout_secs)),
            redis_url: self.redis_url.clone().filter(|u| !u.trim().is_empty()),
            black_list: self.black_list.clone(),
            white_list: self.white_list.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Local half runtime configuration.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub primary: Upstream,
    pub direct: Option<Upstream>,
    pub domain_patterns: Vec<DomainPattern>,
    pub with_direct: bool,
    pub with_black_list: bool,
    /// Already clamped to the minimum
    pub idle_timeout: Duration,
    pub redis_url: Option<String>,
    pub black_list: Vec<String>,
    pub white_list: Vec<String>,
}

impl LocalConfig {
    /// Configuration with a single upstream and defaults for everything else.
    pub fn new(host: impl Into<String>, port: u16, passphrase: &str) -> Self {
        Self {
            listen_host: DEFAULT_LOCAL_HOST.to_string(),
            listen_port: DEFAULT_LOCAL_PORT,
            primary: Upstream::new(host, port, derive_key(passphrase)),
            direct: None,
            domain_patterns: Vec::new(),
            with_direct: false,
            with_black_list: false,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            redis_url: None,
            black_list: Vec::new(),
            white_list: Vec::new(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::config("listen_host cannot be empty"));
        }
        if self.primary.host.is_empty() || self.primary.port == 0 {
            return Err(Error::config("primary upstream host and port are required"));
        }
        if self.with_direct && self.direct.is_none() {
            return Err(Error::config(
                "with_direct requires direct_host and direct_port",
            ));
        }
        Ok(())
    }
}

/// Remote half configuration file (TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfigFile {
    #[serde(default = "default_remote_host")]
    pub listen_host: String,
    #[serde(default = "default_remote_port")]
    pub listen_port: u16,
    pub key: String,
    #[serde(default)]
    pub verify_key: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl RemoteConfigFile {
    /// Parse a TOML configuration.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
    }

    /// Convert to runtime configuration, deriving the key.
    pub fn to_config(&self) -> Result<RemoteConfig> {
        if self.key.trim().is_empty() {
            return Err(Error::config("key is required"));
        }
        let config = RemoteConfig {
            listen_host: self.listen_host.clone(),
            listen_port: self.listen_port,
            key: derive_key(&self.key),
            verify_key: self.verify_key,
            idle_timeout: Duration::from_secs(clamp_idle_timeout(self.timeout_secs)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Remote half runtime configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub key: TunnelKey,
    /// Reject tunnels whose verification block does not match the key
    pub verify_key: bool,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(passphrase: &str) -> Self {
        Self {
            listen_host: DEFAULT_REMOTE_HOST.to_string(),
            listen_port: DEFAULT_REMOTE_PORT,
            key: derive_key(passphrase),
            verify_key: false,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(Error::config("listen_host cannot be empty"));
        }
        Ok(())
    }
}
