//! Configuration file for the Punchline CLI.

use punchline_core::{CoordinatorConfig, FallbackMode, SymmetricPolicy};
use punchline_nat::{ClassifierConfig, PunchConfig};
use punchline_signal::{RelayServerConfig, SignalServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Punchline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// This peer's identity and connection policy
    pub peer: PeerConfig,
    /// Signaling relay, client and server side
    pub signal: SignalConfig,
    /// STUN servers and the optional responder
    pub stun: StunConfig,
    /// Hole punching timings
    pub punch: PunchTimings,
    /// Datagram relay, client and server side
    pub relay: RelayConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Peer id to register; a random one is generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Default room
    pub room: String,
    /// Local address punch sockets bind to
    pub bind_addr: String,
    /// Endpoint to publish instead of the detected one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_endpoint: Option<String>,
    /// `sequential` or `parallel`
    pub fallback_mode: FallbackMode,
    /// `attempt-punch` or `fail-fast`
    pub symmetric_policy: SymmetricPolicy,
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Relay URL peers connect to
    pub url: String,
    /// WebSocket listen address for `serve`
    pub listen_addr: String,
    /// HTTP introspection listen address for `serve`; empty disables it
    pub http_addr: String,
    /// Liveness sweep period
    pub sweep_interval_secs: u64,
    /// Idle time before eviction
    pub inactivity_timeout_secs: u64,
    /// Registered peer limit
    pub max_peers: usize,
    /// Client request deadline
    pub request_timeout_secs: u64,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    /// Servers as `host:port`, primary first
    pub servers: Vec<String>,
    /// Deadline per Binding transaction
    pub probe_timeout_secs: u64,
    /// Responder listen address for `serve` and `stun`
    pub listen_addr: String,
    /// Run the responder alongside `serve`
    pub serve: bool,
}

/// Hole punching timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PunchTimings {
    /// Give-up deadline per attempt
    pub connection_timeout_secs: u64,
    /// Spacing of punch datagrams
    pub punch_interval_ms: u64,
    /// Keep-alive spacing on established UDP links
    pub keepalive_interval_secs: u64,
    /// TCP connect deadline
    pub tcp_connect_timeout_secs: u64,
    /// Default port step for the birthday attack
    pub birthday_increment: i32,
    /// Delay between announcing and starting an attempt
    pub attempt_grace_ms: u64,
}

/// Datagram relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay peers use for the `turn-relay` strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Listen address for `serve`
    pub listen_addr: String,
    /// Run the relay alongside `serve`
    pub serve: bool,
    /// Client limit
    pub max_clients: usize,
    /// Packets per client per second
    pub rate_limit: usize,
    /// Idle time before a client is dropped
    pub client_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: None,
            room: "lobby".to_string(),
            bind_addr: "0.0.0.0:40000".to_string(),
            advertised_endpoint: None,
            fallback_mode: FallbackMode::Sequential,
            symmetric_policy: SymmetricPolicy::AttemptPunch,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            http_addr: "0.0.0.0:8081".to_string(),
            sweep_interval_secs: 60,
            inactivity_timeout_secs: 300,
            max_peers: 10_000,
            request_timeout_secs: 10,
        }
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: ClassifierConfig::default().stun_servers,
            probe_timeout_secs: 5,
            listen_addr: "0.0.0.0:3478".to_string(),
            serve: false,
        }
    }
}

impl Default for PunchTimings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            punch_interval_ms: 500,
            keepalive_interval_secs: 25,
            tcp_connect_timeout_secs: 10,
            birthday_increment: 1,
            attempt_grace_ms: 200,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: None,
            listen_addr: "0.0.0.0:3479".to_string(),
            serve: false,
            max_clients: 10_000,
            rate_limit: 100,
            client_timeout_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save configuration to file, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("punchline/config.toml")
    }

    /// Load from the default path, writing defaults there if it does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid entry.
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_addr(&self.peer.bind_addr, "Peer bind address")?;
        if let Some(endpoint) = &self.peer.advertised_endpoint {
            parse_addr(endpoint, "Advertised endpoint")?;
        }
        if self.peer.room.is_empty() {
            anyhow::bail!("Room name must not be empty");
        }

        if !self.signal.url.starts_with("ws://") && !self.signal.url.starts_with("wss://") {
            anyhow::bail!("Signal URL '{}' must use ws:// or wss://", self.signal.url);
        }
        parse_addr(&self.signal.listen_addr, "Signal listen address")?;
        if !self.signal.http_addr.is_empty() {
            parse_addr(&self.signal.http_addr, "HTTP listen address")?;
        }
        parse_addr(&self.stun.listen_addr, "STUN listen address")?;
        parse_addr(&self.relay.listen_addr, "Relay listen address")?;
        if let Some(server) = &self.relay.server {
            parse_addr(server, "Relay server")?;
        }

        if self.stun.servers.is_empty() {
            anyhow::bail!("At least one STUN server is required");
        }
        for server in &self.stun.servers {
            validate_host_port(server, "STUN server")?;
        }

        let timeouts = [
            ("signal.sweep_interval_secs", self.signal.sweep_interval_secs),
            ("signal.inactivity_timeout_secs", self.signal.inactivity_timeout_secs),
            ("signal.request_timeout_secs", self.signal.request_timeout_secs),
            ("stun.probe_timeout_secs", self.stun.probe_timeout_secs),
            ("punch.connection_timeout_secs", self.punch.connection_timeout_secs),
            ("punch.punch_interval_ms", self.punch.punch_interval_ms),
            ("punch.keepalive_interval_secs", self.punch.keepalive_interval_secs),
            ("punch.tcp_connect_timeout_secs", self.punch.tcp_connect_timeout_secs),
            ("relay.client_timeout_secs", self.relay.client_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.punch.birthday_increment == 0 {
            anyhow::bail!("punch.birthday_increment must not be zero");
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            );
        }
        Ok(())
    }

    /// Hole punching settings
    #[must_use]
    pub fn punch_config(&self) -> PunchConfig {
        PunchConfig {
            connection_timeout: Duration::from_secs(self.punch.connection_timeout_secs),
            punch_interval: Duration::from_millis(self.punch.punch_interval_ms),
            keepalive_interval: Duration::from_secs(self.punch.keepalive_interval_secs),
            tcp_connect_timeout: Duration::from_secs(self.punch.tcp_connect_timeout_secs),
            birthday_increment: self.punch.birthday_increment,
        }
    }

    /// NAT detection settings
    ///
    /// # Errors
    ///
    /// Returns an error if the peer bind address is malformed.
    pub fn classifier_config(&self) -> anyhow::Result<ClassifierConfig> {
        Ok(ClassifierConfig {
            stun_servers: self.stun.servers.clone(),
            bind_addr: parse_addr(&self.peer.bind_addr, "Peer bind address")?,
            probe_timeout: Duration::from_secs(self.stun.probe_timeout_secs),
            ..ClassifierConfig::default()
        })
    }

    /// Coordinator settings
    ///
    /// # Errors
    ///
    /// Returns an error if an address is malformed.
    pub fn coordinator_config(&self) -> anyhow::Result<CoordinatorConfig> {
        Ok(CoordinatorConfig {
            signaling_url: self.signal.url.clone(),
            bind_addr: parse_addr(&self.peer.bind_addr, "Peer bind address")?,
            advertised_endpoint: self
                .peer
                .advertised_endpoint
                .as_deref()
                .map(|endpoint| parse_addr(endpoint, "Advertised endpoint"))
                .transpose()?,
            nat_override: None,
            fallback_mode: self.peer.fallback_mode,
            symmetric_policy: self.peer.symmetric_policy,
            attempt_grace: Duration::from_millis(self.punch.attempt_grace_ms),
            signaling_timeout: Duration::from_secs(self.signal.request_timeout_secs),
            relay_server: self
                .relay
                .server
                .as_deref()
                .map(|server| parse_addr(server, "Relay server"))
                .transpose()?,
            punch: self.punch_config(),
            classifier: self.classifier_config()?,
        })
    }

    /// Signaling server settings
    ///
    /// # Errors
    ///
    /// Returns an error if a listen address is malformed.
    pub fn signal_server_config(&self) -> anyhow::Result<SignalServerConfig> {
        let http_addr = if self.signal.http_addr.is_empty() {
            None
        } else {
            Some(parse_addr(&self.signal.http_addr, "HTTP listen address")?)
        };
        Ok(SignalServerConfig {
            bind_addr: parse_addr(&self.signal.listen_addr, "Signal listen address")?,
            http_addr,
            sweep_interval: Duration::from_secs(self.signal.sweep_interval_secs),
            inactivity_timeout: Duration::from_secs(self.signal.inactivity_timeout_secs),
            max_peers: self.signal.max_peers,
        })
    }

    /// Datagram relay server settings
    #[must_use]
    pub fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_clients: self.relay.max_clients,
            rate_limit: self.relay.rate_limit,
            client_timeout: Duration::from_secs(self.relay.client_timeout_secs),
            ..RelayServerConfig::default()
        }
    }
}

/// Parse a literal `ip:port`
fn parse_addr(addr: &str, name: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' is not a valid ip:port"))
}

/// Validate `host:port` where host may be a DNS name
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        anyhow::bail!("{name} '{addr}' missing port (expected format: host:port)");
    };
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' has invalid port: {port}"))?;
    if port == 0 {
        anyhow::bail!("{name} '{addr}' has invalid port: 0");
    }
    if host.is_empty() {
        anyhow::bail!("{name} '{addr}' has empty hostname");
    }
    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{name} '{addr}' contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.peer.room, "lobby");
        assert_eq!(config.signal.url, "ws://127.0.0.1:8080");
        assert_eq!(config.punch.connection_timeout_secs, 30);
        assert_eq!(config.punch.punch_interval_ms, 500);
        assert_eq!(config.signal.inactivity_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.punch.connection_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.punch.connection_timeout_secs = 30;
        config.stun.servers = vec!["stun.example.net".to_string()];
        assert!(config.validate().is_err());

        config.stun.servers = vec!["stun.example.net:3478".to_string()];
        config.peer.bind_addr = "localhost:40000".to_string();
        assert!(config.validate().is_err());

        config.peer.bind_addr = "0.0.0.0:40000".to_string();
        config.signal.url = "http://relay".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [peer]
            id = "alice"
            fallback_mode = "parallel"

            [relay]
            server = "192.0.2.10:3479"
            "#,
        )
        .unwrap();
        assert_eq!(config.peer.id.as_deref(), Some("alice"));
        assert_eq!(config.peer.fallback_mode, FallbackMode::Parallel);
        assert_eq!(config.peer.room, "lobby");
        assert_eq!(config.logging.level, "info");

        let coordinator = config.coordinator_config().unwrap();
        assert_eq!(coordinator.fallback_mode, FallbackMode::Parallel);
        assert_eq!(
            coordinator.relay_server,
            Some("192.0.2.10:3479".parse().unwrap())
        );
        assert_eq!(coordinator.punch.punch_interval, Duration::from_millis(500));
        assert_eq!(coordinator.classifier.bind_addr.port(), 40000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.peer.id = Some("bob".to_string());
        config.signal.http_addr = String::new();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.peer.id.as_deref(), Some("bob"));
        assert!(loaded.signal_server_config().unwrap().http_addr.is_none());
    }
}
