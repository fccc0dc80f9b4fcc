//! Environment-driven configuration.
//!
//! Every knob has a default; environment variables override them when
//! `BridgeConfig::default()` (or `from_env()`) is called:
//!
//! - `UNITY_MCP_STATUS_DIR`: registry directory (default `~/.unity-mcp`)
//! - `UNITY_MCP_DEFAULT_INSTANCE`: instance used when a call names none
//! - `UNITY_MCP_TRANSPORT`: `stdio` (default) or `http`
//! - `UNITY_MCP_REMOTE`: multi-tenant hosting (`1`/`true`)
//! - `UNITY_MCP_STRICT_FRAMING`: refuse peers that do not negotiate framing
//! - `UNITY_MCP_TOOL_WATCH_INTERVAL`: tool watcher period, seconds
//! - `UNITY_MCP_STATUS_TTL`: status file freshness, seconds

use std::path::PathBuf;
use std::time::Duration;

pub const REGISTRY_DIR_NAME: &str = ".unity-mcp";
pub const DEFAULT_PORT: u16 = 6400;

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Registry directory the peers write port and status files into.
pub fn default_registry_dir() -> PathBuf {
    if let Some(dir) = env_string("UNITY_MCP_STATUS_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(REGISTRY_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(REGISTRY_DIR_NAME))
}

/// How the server facing the tool-calling client is exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
}

impl TransportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Some(Self::Stdio),
            "http" | "streamable-http" => Some(Self::Http),
            _ => None,
        }
    }
}

/// Timeouts and retry bounds for one peer connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Steady-state bound on one response read.
    pub read_timeout: Duration,
    /// Wall-clock bound on consecutive heartbeat frames before a read
    /// degrades to an empty success.
    pub heartbeat_deadline: Duration,
    pub max_heartbeat_frames: u32,
    /// Fail closed instead of downgrading to the legacy unframed protocol.
    pub strict_framing: bool,
    /// Transport-error retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub reload_max_retries: u32,
    pub reload_retry_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(30),
            heartbeat_deadline: Duration::from_secs(2),
            max_heartbeat_frames: 16,
            strict_framing: env_flag("UNITY_MCP_STRICT_FRAMING"),
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            reload_max_retries: 40,
            reload_retry_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub registry_dir: PathBuf,
    pub default_instance: Option<String>,
    pub transport: TransportMode,
    /// Multi-tenant remote hosting: sessions are keyed by authenticated
    /// user and auto-select is disabled.
    pub remote_hosted: bool,
    /// Discovery cache lifetime in the connection pool.
    pub scan_interval: Duration,
    pub probe_timeout: Duration,
    pub tool_watch_interval: Duration,
    pub status_ttl: Duration,
    /// Refresh bound for the tool registry snapshot.
    pub visibility_refresh: Duration,
    pub connection: ConnectionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            registry_dir: default_registry_dir(),
            default_instance: env_string("UNITY_MCP_DEFAULT_INSTANCE"),
            transport: env_string("UNITY_MCP_TRANSPORT")
                .and_then(|s| TransportMode::parse(&s))
                .unwrap_or_default(),
            remote_hosted: env_flag("UNITY_MCP_REMOTE"),
            scan_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(300),
            tool_watch_interval: env_secs("UNITY_MCP_TOOL_WATCH_INTERVAL")
                .unwrap_or(Duration::from_secs(1)),
            status_ttl: env_secs("UNITY_MCP_STATUS_TTL").unwrap_or(Duration::from_secs(15)),
            visibility_refresh: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_registry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.registry_dir = dir.into();
        self
    }

    pub fn with_default_instance(mut self, id: Option<String>) -> Self {
        self.default_instance = id;
        self
    }

    pub fn with_remote_hosted(mut self, remote: bool) -> Self {
        self.remote_hosted = remote;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_tool_watch_interval(mut self, interval: Duration) -> Self {
        self.tool_watch_interval = interval;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }
}
