use std::env;

use crate::server::payload_cursor::WireEncoding;

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub pools: PoolConfig,
    pub watchdog: WatchdogConfig,
    pub protocol: ProtocolConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self {
            server: ServerConfig::load(),
            pools: PoolConfig::load(),
            watchdog: WatchdogConfig::load(),
            protocol: ProtocolConfig::load(),
        }
    }
}

// --- MODULES ---

// SERVER
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub acceptors: usize,
    pub log_level: String,
    /// Route tag appended to minted affinity tokens; names this node.
    pub route_tag: String,
}

impl ServerConfig {
    fn load() -> Self {
        Self {
            host:      get_env("AJPD_HOST", "127.0.0.1"),
            port:      get_env("AJPD_PORT", "8009"),
            acceptors: get_env("AJPD_ACCEPTORS", "2"),
            log_level: get_env("AJPD_LOG", "info"),
            route_tag: get_env("AJPD_ROUTE_TAG", "ajpd"),
        }
    }
}

// POOLS
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub connections: usize,
    pub handlers: usize,
}

impl PoolConfig {
    fn load() -> Self {
        Self {
            workers:     get_env("AJPD_WORKER_POOL", "20"),
            connections: get_env("AJPD_CONNECTION_POOL", "20"),
            handlers:    get_env("AJPD_HANDLER_POOL", "20"),
        }
    }
}

// WATCHDOG
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval_ms: u64,
    pub max_running_ms: u64,
    pub recovery_enabled: bool,
}

impl WatchdogConfig {
    fn load() -> Self {
        Self {
            interval_ms:      get_env("AJPD_WATCHDOG_INTERVAL_MS", "10000"),
            max_running_ms:   get_env("AJPD_WATCHDOG_MAX_RUNNING_MS", "30000"),
            recovery_enabled: get_env("AJPD_WATCHDOG_RECOVERY", "true"),
        }
    }
}

// PROTOCOL
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub encoding: WireEncoding,
    pub session_ttl_secs: u64,
}

impl ProtocolConfig {
    fn load() -> Self {
        let label: String = get_env("AJPD_DEFAULT_ENCODING", "utf-8");
        let encoding = WireEncoding::from_label(&label).unwrap_or_else(|| {
            tracing::warn!(label, "unknown default encoding, falling back to utf-8");
            WireEncoding::Utf8
        });
        Self {
            encoding,
            session_ttl_secs: get_env("AJPD_SESSION_TTL_SECS", "1800"),
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: std::str::FromStr>(key: &str, default: &str) -> T {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| format!("Config error: {} must be valid", key))
        .unwrap()
}
