//! Service, backend, and process configuration types.
//!
//! `ServiceConfig` and `BackendConfig` are the wire shapes accepted by the
//! admin API; the same shapes appear in the optional TOML process config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Health check interval applied when a config leaves it at zero.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 2000;
/// Consecutive successful checks required to bring a backend up.
pub const DEFAULT_RISE: u32 = 2;
/// Consecutive failed checks required to take a backend down.
pub const DEFAULT_FALL: u32 = 2;

/// One front-end binding: a listener plus its backends and policy.
///
/// All durations are integer milliseconds; zero means "use the default" for
/// the check settings and "no deadline" for the timeouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "address", default)]
    pub addr: String,
    #[serde(default)]
    pub virtual_hosts: Vec<String>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// "RR", "LC", or empty for round-robin.
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub check_interval: u64,
    #[serde(default)]
    pub fall: u32,
    #[serde(default)]
    pub rise: u32,
    #[serde(default)]
    pub client_timeout: u64,
    #[serde(default)]
    pub server_timeout: u64,
    #[serde(rename = "connect_timeout", default)]
    pub dial_timeout: u64,
    /// location URL -> status codes served from that page.
    #[serde(default)]
    pub error_pages: HashMap<String, Vec<u16>>,
}

impl ServiceConfig {
    /// Copy with the check defaults applied and the balance name
    /// canonicalized, the shape a running service reports back.
    pub fn normalized(&self) -> ServiceConfig {
        let mut cfg = self.clone();
        if cfg.check_interval == 0 {
            cfg.check_interval = DEFAULT_CHECK_INTERVAL_MS;
        }
        if cfg.rise == 0 {
            cfg.rise = DEFAULT_RISE;
        }
        if cfg.fall == 0 {
            cfg.fall = DEFAULT_FALL;
        }
        if cfg.balance.is_empty() {
            cfg.balance = "RR".to_string();
        }
        cfg
    }

    /// Equality test deciding whether an update can skip the stop/start
    /// cycle. Virtual hosts and backends compare as sets, and both sides are
    /// normalized first so a raw config matches the running service it
    /// produced.
    pub fn matches(&self, other: &ServiceConfig) -> bool {
        let a = self.normalized();
        let b = other.normalized();

        let mut a_hosts = a.virtual_hosts.clone();
        let mut b_hosts = b.virtual_hosts.clone();
        a_hosts.sort();
        b_hosts.sort();

        let mut a_backends = a.backends.clone();
        let mut b_backends = b.backends.clone();
        a_backends.sort_by(|x, y| x.name.cmp(&y.name));
        b_backends.sort_by(|x, y| x.name.cmp(&y.name));

        a.name == b.name
            && a.addr == b.addr
            && a.balance == b.balance
            && a.check_interval == b.check_interval
            && a.fall == b.fall
            && a.rise == b.rise
            && a.client_timeout == b.client_timeout
            && a.server_timeout == b.server_timeout
            && a.dial_timeout == b.dial_timeout
            && a_hosts == b_hosts
            && a_backends == b_backends
            && a.error_pages == b.error_pages
    }
}

/// One upstream endpoint belonging to a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "address", default)]
    pub addr: String,
    /// HTTP URL probed by the health check; empty means a TCP connect check.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_addr: String,
    /// Preserved for callers; the current selectors ignore it.
    #[serde(default)]
    pub weight: u32,
}

/// Counter snapshot for one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendStat {
    pub name: String,
    #[serde(rename = "address")]
    pub addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_addr: String,
    pub up: bool,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub connections: u64,
    pub active: i64,
    pub http_active: i64,
    pub check_fail: u64,
}

/// Counter snapshot for one service, backends included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStat {
    pub name: String,
    #[serde(rename = "address")]
    pub addr: String,
    pub virtual_hosts: Vec<String>,
    pub backends: Vec<BackendStat>,
    pub balance: String,
    pub check_interval: u64,
    pub fall: u32,
    pub rise: u32,
    pub client_timeout: u64,
    pub server_timeout: u64,
    #[serde(rename = "connect_timeout")]
    pub dial_timeout: u64,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub connections: u64,
    pub active: i64,
    pub http_active: i64,
    pub http_connections: u64,
    pub http_errors: u64,
}

/// Process configuration loaded from a TOML file at startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Services started before the listeners come up.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address of the HTTP virtual-host front door.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Admin API address: TCP, or a UNIX socket path starting with '/'.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
    /// Redirect plain-HTTP requests to https.
    #[serde(default)]
    pub ssl_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_addr: default_admin_addr(),
            ssl_only: false,
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}

impl Config {
    /// Parse the TOML config at `path`. A missing file yields the defaults
    /// so the proxy can start empty and be driven through the admin API.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}
