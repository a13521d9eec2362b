//! Configuration management

use crate::crypto::{AuthToken, Authenticator, TOKEN_MAX_AGE_SECS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default: 587)
    #[serde(default = "default_port")]
    pub port: u16,
    /// SMTP hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Software name shown after "ESMTP" in the greeting
    #[serde(default = "default_banner")]
    pub banner: String,
    /// TLS certificate file
    #[serde(default = "default_cert_file")]
    pub cert_file: String,
    /// TLS key file
    #[serde(default = "default_key_file")]
    pub key_file: String,
    /// Users file path
    #[serde(default = "default_users_file")]
    pub users_file: String,
    /// Global switch for per-user destination logging
    #[serde(default = "default_true")]
    pub log_users: bool,
    /// Seconds to wait for a CONNECT destination to accept
    #[serde(default = "default_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Seconds a client has to finish the SMTP exchange
    #[serde(default = "default_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Largest frame payload accepted from clients
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            hostname: default_hostname(),
            banner: default_banner(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            users_file: default_users_file(),
            log_users: true,
            dial_timeout_secs: default_timeout_secs(),
            handshake_timeout_secs: default_timeout_secs(),
            max_frame_payload: default_max_frame_payload(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Server hostname, also used for SNI and certificate verification
    #[serde(default)]
    pub server_host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Name sent with EHLO
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Username
    #[serde(default)]
    pub username: String,
    /// Secret
    #[serde(default)]
    pub secret: String,
    /// CA certificate file the server certificate must chain to
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// Seconds to wait for CONNECT_OK / CONNECT_FAIL
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: default_port(),
            client_name: default_client_name(),
            username: String::new(),
            secret: String::new(),
            ca_cert: None,
            connect_timeout_secs: default_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset (e.g. "info", "debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEntry {
    /// Authentication secret
    pub secret: String,
    /// IP whitelist (empty = allow all)
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Enable logging for this user
    #[serde(default = "default_true")]
    pub logging: bool,
}

/// Users configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UsersConfig {
    #[serde(default)]
    pub users: HashMap<String, UserEntry>,
}

/// Full configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    587
}
fn default_hostname() -> String {
    "mail.example.com".to_string()
}
fn default_banner() -> String {
    "Postfix (Ubuntu)".to_string()
}
fn default_cert_file() -> String {
    "server.crt".to_string()
}
fn default_key_file() -> String {
    "server.key".to_string()
}
fn default_users_file() -> String {
    "users.yaml".to_string()
}
fn default_client_name() -> String {
    "localhost".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_frame_payload() -> usize {
    crate::proto::MAX_PAYLOAD_SIZE
}
fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl UsersConfig {
    /// Load users from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UsersConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Whether destinations opened by this user may be logged
    pub fn logging_enabled(&self, username: &str) -> bool {
        self.users.get(username).is_some_and(|u| u.logging)
    }

    /// Check if IP is whitelisted for user
    pub fn is_ip_whitelisted(&self, username: &str, ip: IpAddr) -> bool {
        let Some(user) = self.users.get(username) else {
            return false;
        };

        // Empty whitelist = allow all
        if user.whitelist.is_empty() {
            return true;
        }

        user.whitelist.iter().any(|entry| {
            if let Ok(addr) = entry.parse::<IpAddr>() {
                return addr == ip;
            }
            entry
                .parse::<ipnet::IpNet>()
                .is_ok_and(|network| network.contains(&ip))
        })
    }
}

impl Authenticator for UsersConfig {
    fn authenticate(&self, token: &str, peer: IpAddr) -> Option<String> {
        let secrets: HashMap<String, String> = self
            .users
            .iter()
            .map(|(name, entry)| (name.clone(), entry.secret.clone()))
            .collect();

        let username = AuthToken::verify_multi_user(token, &secrets, TOKEN_MAX_AGE_SECS)?;
        if !self.is_ip_whitelisted(&username, peer) {
            tracing::warn!("User {} not whitelisted from IP {}", username, peer);
            return None;
        }
        Some(username)
    }

    fn logging_enabled(&self, username: &str) -> bool {
        UsersConfig::logging_enabled(self, username)
    }
}

impl ServerConfig {
    /// Get socket address to bind to
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.hostname.trim().is_empty() || self.hostname.contains(['\r', '\n']) {
            return Err(crate::Error::InvalidConfig(
                "hostname must be a single non-empty line".into(),
            ));
        }
        if self.banner.contains(['\r', '\n']) {
            return Err(crate::Error::InvalidConfig("banner must be a single line".into()));
        }
        if self.max_frame_payload == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_frame_payload must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Get server address for connecting
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.server_host.is_empty() {
            return Err(crate::Error::InvalidConfig("server_host is required".into()));
        }
        if self.username.is_empty() {
            return Err(crate::Error::InvalidConfig("username is required".into()));
        }
        if self.secret.is_empty() {
            return Err(crate::Error::InvalidConfig("secret is required".into()));
        }
        Ok(())
    }
}

/// Generate example configuration
pub fn generate_example_config() -> String {
    r#"# SMTP Mux Configuration

server:
  # Listen address (0.0.0.0 for all interfaces)
  host: "0.0.0.0"

  # SMTP submission port (587 is standard)
  port: 587

  # Hostname to advertise in SMTP greeting
  hostname: "mail.example.com"
  banner: "Postfix (Ubuntu)"

  # TLS certificate and key files
  cert_file: "server.crt"
  key_file: "server.key"

  # Users configuration file
  users_file: "users.yaml"
  log_users: true

  dial_timeout_secs: 30
  handshake_timeout_secs: 30

client:
  server_host: "mail.example.com"
  server_port: 587
  username: "alice"
  secret: "your-secret-here"
  ca_cert: "server.crt"

logging:
  level: "info"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn users() -> UsersConfig {
        serde_yaml::from_str(
            r#"
users:
  alice:
    secret: "a-secret"
  bob:
    secret: "b-secret"
    logging: false
    whitelist:
      - 192.168.1.100
      - 10.0.0.0/8
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config = serde_yaml::from_str(&generate_example_config()).unwrap();
        assert_eq!(config.server.port, 587);
        assert_eq!(config.server.dial_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.server_addr(), "mail.example.com:587");
        assert_eq!(config.logging.level, "info");
        config.server.validate().unwrap();
        config.client.validate().unwrap();
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = serde_yaml::from_str("server:\n  port: 2525\n").unwrap();
        assert_eq!(config.server.port, 2525);
        assert_eq!(config.server.hostname, "mail.example.com");
        assert_eq!(config.server.max_frame_payload, crate::proto::MAX_PAYLOAD_SIZE);
        assert!(config.client.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_multiline_hostname() {
        let config = ServerConfig {
            hostname: "mail\r\n250 injected".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::InvalidConfig(_))));
    }

    #[test]
    fn test_whitelist() {
        let users = users();
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();

        assert!(users.is_ip_whitelisted("alice", ip("203.0.113.9")));
        assert!(users.is_ip_whitelisted("bob", ip("192.168.1.100")));
        assert!(users.is_ip_whitelisted("bob", ip("10.20.30.40")));
        assert!(!users.is_ip_whitelisted("bob", ip("192.168.1.101")));
        assert!(!users.is_ip_whitelisted("carol", ip("10.0.0.1")));
        assert!(users.logging_enabled("alice"));
        assert!(!users.logging_enabled("bob"));
    }

    #[test]
    fn test_authenticate() {
        let users = users();
        let token = AuthToken::generate_now("b-secret", "bob");

        assert_eq!(
            users.authenticate(&token, "10.1.1.1".parse().unwrap()),
            Some("bob".to_string())
        );
        assert_eq!(users.authenticate(&token, "8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(generate_example_config().as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        let out = tempfile::NamedTempFile::new().unwrap();
        config.save_to_file(out.path()).unwrap();
        let reloaded = Config::from_file(out.path()).unwrap();
        assert_eq!(reloaded.server.hostname, config.server.hostname);
        assert_eq!(reloaded.client.ca_cert, config.client.ca_cert);
    }
}
