use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub rtc: RtcConfig,
    pub room: RoomConfig,
    pub stat: StatConfig,
    pub sdk: SdkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Seconds to wait for in-flight requests on shutdown
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            shutdown_timeout_seconds: 10,
        }
    }
}

/// Where room state and the relay bus live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// In-process cache, single node only
    Standalone,
    /// Shared Redis, required for multi-node deployments
    #[default]
    Cluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: CacheMode,
    pub redis_url: String,
    pub connect_timeout_seconds: u64,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Cluster,
            redis_url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
            key_prefix: "live_server".to_string(),
        }
    }
}

/// WebRTC media plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Public IP advertised as the host candidate (1:1 NAT)
    pub node_ip: Option<String>,
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    pub ice_servers: Vec<String>,
    pub ice_gather_timeout_ms: u64,
    pub keyframe_interval_ms: u64,
    pub stat_interval_ms: u64,
    pub subscribe_timeout_ms: u64,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            node_ip: None,
            udp_port_min: 50000,
            udp_port_max: 50100,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            ice_gather_timeout_ms: 5000,
            keyframe_interval_ms: 2000,
            stat_interval_ms: 1000,
            subscribe_timeout_ms: 2000,
        }
    }
}

impl RtcConfig {
    #[must_use]
    pub const fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    #[must_use]
    pub const fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }
}

/// What happens to a room once its last participant leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRoomPolicy {
    /// Leave the record to expire with its TTL
    #[default]
    Keep,
    /// Tear the room down immediately
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub ttl_seconds: u64,
    /// TTL applied to persistent rooms (voice/video rooms) once someone joins
    pub long_ttl_seconds: u64,
    pub participant_ttl_seconds: u64,
    pub join_request_ttl_seconds: u64,
    pub empty_room_policy: EmptyRoomPolicy,
    /// Worker id mixed into generated room ids, 0..=1023; derived from the
    /// node id when unset
    pub worker_id: Option<u16>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 24 * 3600,
            long_ttl_seconds: 365 * 24 * 3600,
            participant_ttl_seconds: 30 * 24 * 3600,
            join_request_ttl_seconds: 30 * 60,
            empty_room_policy: EmptyRoomPolicy::Keep,
            worker_id: None,
        }
    }
}

/// Destination for quality telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatSinkKind {
    #[default]
    Log,
    Clickhouse,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatConfig {
    pub sink: StatSinkKind,
    pub flush_interval_ms: u64,
    pub batch_size: usize,
    pub channel_capacity: usize,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_table: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            sink: StatSinkKind::Log,
            flush_interval_ms: 2000,
            batch_size: 100,
            channel_capacity: 100,
            clickhouse_url: "http://localhost:8123".to_string(),
            clickhouse_database: "default".to_string(),
            clickhouse_table: "stat".to_string(),
            clickhouse_user: "default".to_string(),
            clickhouse_password: String::new(),
        }
    }
}

/// Downstream business services consulted by the room logic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Base URL of the permission service; empty disables checks
    pub check_endpoint: String,
    /// Base URL of the push service; empty disables signalling
    pub push_endpoint: String,
    pub push_signal_type: i32,
    /// Seconds a call invitation stays valid
    pub call_timeout_seconds: i64,
    pub request_timeout_ms: u64,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            check_endpoint: String::new(),
            push_endpoint: String::new(),
            push_signal_type: 1001,
            call_timeout_seconds: 60,
            request_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECALL_RTC__NODE_IP, LIVECALL_CACHE__REDIS_URL, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECALL")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("rtc.ice_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check cross-field constraints, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.cache.mode == CacheMode::Cluster && self.cache.redis_url.is_empty() {
            errors.push("cache.redis_url is required in cluster mode".to_string());
        }
        if self.rtc.udp_port_min == 0 || self.rtc.udp_port_min > self.rtc.udp_port_max {
            errors.push(format!(
                "rtc udp port range {}..{} is invalid",
                self.rtc.udp_port_min, self.rtc.udp_port_max
            ));
        }
        if self.rtc.keyframe_interval_ms == 0 || self.rtc.stat_interval_ms == 0 {
            errors.push("rtc keyframe and stat intervals must be non-zero".to_string());
        }
        if self.rtc.subscribe_timeout_ms == 0 {
            errors.push("rtc.subscribe_timeout_ms must be non-zero".to_string());
        }
        if let Some(worker_id) = self.room.worker_id.filter(|id| *id > 1023) {
            errors.push(format!("room.worker_id {worker_id} exceeds 1023"));
        }
        if self.stat.batch_size == 0 || self.stat.channel_capacity == 0 {
            errors.push("stat batch size and channel capacity must be non-zero".to_string());
        }
        if self.stat.sink == StatSinkKind::Clickhouse && self.stat.clickhouse_url.is_empty() {
            errors.push("stat.clickhouse_url is required for the clickhouse sink".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format '{}' is not json or pretty", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Resolve and load configuration
///
/// Config file search order:
/// 1. explicit path (command line)
/// 2. LIVECALL_CONFIG_PATH environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (Kubernetes mount path)
/// 5. Fall back to environment variables only
pub fn load_config(explicit_path: Option<&str>) -> anyhow::Result<Config> {
    let config_path = explicit_path
        .map(str::to_string)
        .or_else(|| std::env::var("LIVECALL_CONFIG_PATH").ok())
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
