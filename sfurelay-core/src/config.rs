use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub gateway: GatewayConfig,
    pub webrtc: WebRTCConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. `*` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Directory served as static files (client pages). `None` disables it.
    pub static_dir: Option<String>,
    /// Largest inbound WebSocket frame, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5111,
            allowed_origins: vec!["*".to_string()],
            static_dir: Some("public".to_string()),
            max_message_size: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
}

/// Connection gateway limits and liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Maximum number of registered sessions
    pub max_clients: usize,
    /// Interval between heartbeat pings
    pub heartbeat_interval_ms: u64,
    /// Time a ping may stay unanswered (0 = only the next heartbeat cycle counts)
    pub pong_timeout_ms: u64,
    /// Interval of the periodic stats log line
    pub stats_interval_secs: u64,
    /// Outbound messages buffered per socket before new ones are dropped
    pub outbound_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_clients: 12,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 5_000,
            stats_interval_secs: 60,
            outbound_buffer: 256,
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn pong_timeout(&self) -> Option<Duration> {
        if self.pong_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.pong_timeout_ms))
        }
    }

    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// WebRTC engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRTCConfig {
    /// STUN server URLs handed to every server-side transport
    pub stun_servers: Vec<String>,
    /// Number of ICE candidates gathered ahead of negotiation
    pub ice_candidate_pool_size: u8,
    /// Upper bound on waiting for ICE gathering before an answer is sent
    pub ice_gathering_timeout_ms: u64,
    /// Also close consumers whose requesting session leaves
    pub release_consumers_on_viewer_exit: bool,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.stunprotocol.org:3478".to_string(),
                "stun:stun.l.google.com:19302".to_string(),
            ],
            ice_candidate_pool_size: 10,
            ice_gathering_timeout_ms: 5_000,
            release_consumers_on_viewer_exit: false,
        }
    }
}

impl WebRTCConfig {
    #[must_use]
    pub const fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
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
    ///
    /// Environment keys use a `SFURELAY_` prefix and `__` between section and
    /// field, e.g. `SFURELAY_GATEWAY__MAX_CLIENTS=20`. List values are comma
    /// separated.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SFURELAY")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("server.allowed_origins")
                .with_list_parse_key("webrtc.stun_servers")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Listen address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check the configuration for inconsistencies, reporting all of them.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.allowed_origins.is_empty() {
            errors.push("server.allowed_origins must list at least one origin (use \"*\" for any)".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be non-zero".to_string());
        }

        if self.tls.enabled {
            for (field, path) in [("tls.cert_file", &self.tls.cert_file), ("tls.key_file", &self.tls.key_file)] {
                if path.is_empty() {
                    errors.push(format!("{field} is required when tls.enabled is set"));
                } else if !Path::new(path).exists() {
                    errors.push(format!("{field} does not exist: {path}"));
                }
            }
        }

        if self.gateway.max_clients == 0 {
            errors.push("gateway.max_clients must be at least 1".to_string());
        }
        if self.gateway.heartbeat_interval_ms == 0 {
            errors.push("gateway.heartbeat_interval_ms must be non-zero".to_string());
        }
        if self.gateway.pong_timeout_ms >= self.gateway.heartbeat_interval_ms
            && self.gateway.pong_timeout_ms != 0
        {
            errors.push(format!(
                "gateway.pong_timeout_ms ({}) must be shorter than gateway.heartbeat_interval_ms ({})",
                self.gateway.pong_timeout_ms, self.gateway.heartbeat_interval_ms
            ));
        }
        if self.gateway.stats_interval_secs == 0 {
            errors.push("gateway.stats_interval_secs must be non-zero".to_string());
        }
        if self.gateway.outbound_buffer == 0 {
            errors.push("gateway.outbound_buffer must be non-zero".to_string());
        }

        for url in &self.webrtc.stun_servers {
            if !(url.starts_with("stun:") || url.starts_with("stuns:")) {
                errors.push(format!("webrtc.stun_servers entry is not a STUN URL: {url}"));
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 5111);
        assert_eq!(config.gateway.max_clients, 12);
        assert_eq!(config.gateway.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.gateway.pong_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.server.allowed_origins, vec!["*".to_string()]);
        assert_eq!(config.webrtc.stun_servers.len(), 2);
        assert!(!config.tls.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 8443;

        assert_eq!(config.http_address(), "127.0.0.1:8443");
    }

    #[test]
    fn test_zero_pong_timeout_disables_deadline() {
        let mut config = Config::default();
        config.gateway.pong_timeout_ms = 0;

        assert_eq!(config.gateway.pong_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.gateway.max_clients = 0;
        config.gateway.pong_timeout_ms = 60_000;
        config.webrtc.stun_servers = vec!["turn:relay.example.com".to_string()];
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("max_clients")));
        assert!(errors.iter().any(|e| e.contains("pong_timeout_ms")));
        assert!(errors.iter().any(|e| e.contains("turn:relay.example.com")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_tls_requires_existing_files() {
        let mut config = Config::default();
        config.tls.enabled = true;
        config.tls.cert_file = "/nonexistent/cert.pem".to_string();

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("tls.cert_file does not exist")));
        assert!(errors.iter().any(|e| e.contains("tls.key_file is required")));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\ngateway:\n  max_clients: 3\nwebrtc:\n  stun_servers:\n    - stun:stun.example.org:3478"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.gateway.max_clients, 3);
        assert_eq!(config.webrtc.stun_servers, vec!["stun:stun.example.org:3478".to_string()]);
        // Untouched sections keep their defaults
        assert_eq!(config.gateway.heartbeat_interval_ms, 30_000);
    }
}
