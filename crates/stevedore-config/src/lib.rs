#![deny(unsafe_code)]

//! Configuration loading and validation for stevedore.
//!
//! Loads TOML configuration files and validates them against expected
//! schemas. Provides the [`AppConfig`] type as the central configuration
//! structure shared by the daemon and the client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Client-side configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Named remote daemons, keyed by remote name.
    ///
    /// A `BTreeMap` keeps listing order stable for operators.
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the stevedore daemon.
///
/// ## TOML Example
///
/// ```toml
/// [daemon]
/// listen_addr = "0.0.0.0"
/// listen_port = 8443
/// socket_path = "/run/stevedore/unix.socket"
/// data_dir = "/var/lib/stevedore"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address the daemon listens on for remote TLS connections.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port the daemon listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Path of the local trusted unix socket. Empty = disabled.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Daemon state directory: server identity keypair, pinned client
    /// certificates, and the admin password file live below this.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8443
}

fn default_socket_path() -> String {
    "/run/stevedore/unix.socket".to_string()
}

fn default_data_dir() -> String {
    "/var/lib/stevedore".to_string()
}

/// Client-side configuration.
///
/// ## TOML Example
///
/// ```toml
/// [client]
/// cert_dir = "/home/alice/.config/stevedore"
/// default_remote = "prod"
/// ```
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory holding the client identity keypair and the pinned
    /// server certificates (`servercerts/<remote>.crt`).
    /// Empty = `$HOME/.config/stevedore`.
    #[serde(default)]
    pub cert_dir: String,

    /// Remote used when none is named on the command line.
    /// Empty = the local unix socket.
    #[serde(default)]
    pub default_remote: String,
}

impl ClientConfig {
    /// Resolve the certificate directory, falling back to
    /// `$HOME/.config/stevedore` when unset.
    pub fn resolved_cert_dir(&self) -> Option<PathBuf> {
        if !self.cert_dir.is_empty() {
            return Some(PathBuf::from(&self.cert_dir));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("stevedore"))
    }
}

/// A single named remote daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// `host:port` address of the remote daemon.
    pub addr: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
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

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.listen_port == 0 {
            return Err(ConfigError::Validation(
                "daemon.listen_port must be non-zero".to_string(),
            ));
        }
        if self.daemon.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.listen_addr must not be empty".to_string(),
            ));
        }
        if self.daemon.data_dir.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.data_dir must not be empty".to_string(),
            ));
        }

        for (name, remote) in &self.remotes {
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "remote names must not be empty".to_string(),
                ));
            }
            if remote.addr.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "remotes.{name}.addr must not be empty"
                )));
            }
        }

        if !self.client.default_remote.is_empty()
            && !self.remotes.contains_key(&self.client.default_remote)
        {
            return Err(ConfigError::Validation(format!(
                "client.default_remote {:?} is not a configured remote",
                self.client.default_remote
            )));
        }

        Ok(())
    }

    /// Look up a remote address by name.
    pub fn remote_addr(&self, name: &str) -> Option<&str> {
        self.remotes.get(name).map(|r| r.addr.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.listen_addr, "127.0.0.1");
        assert_eq!(config.daemon.listen_port, 8443);
        assert_eq!(config.daemon.data_dir, "/var/lib/stevedore");
        assert_eq!(config.logging.level, "info");
        assert!(config.remotes.is_empty());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.daemon.listen_port, 8443);
        assert!(config.client.default_remote.is_empty());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            listen_addr = "0.0.0.0"
            listen_port = 9443
            socket_path = "/tmp/stevedore.sock"
            data_dir = "/tmp/stevedore"

            [client]
            default_remote = "prod"

            [remotes.prod]
            addr = "10.0.0.5:8443"

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.daemon.listen_addr, "0.0.0.0");
        assert_eq!(config.daemon.listen_port, 9443);
        assert_eq!(config.remote_addr("prod"), Some("10.0.0.5:8443"));
        assert_eq!(config.client.default_remote, "prod");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_zero_port() {
        let toml = r#"
            [daemon]
            listen_port = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_addr() {
        let toml = r#"
            [daemon]
            listen_addr = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_remote_addr() {
        let toml = r#"
            [remotes.prod]
            addr = ""
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_default_remote() {
        let toml = r#"
            [client]
            default_remote = "nowhere"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_remotes_are_ordered_by_name() {
        let toml = r#"
            [remotes.zeta]
            addr = "zeta:8443"

            [remotes.alpha]
            addr = "alpha:8443"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        let names: Vec<&str> = config.remotes.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_resolved_cert_dir_explicit() {
        let config = AppConfig::parse(
            r#"
            [client]
            cert_dir = "/etc/stevedore/certs"
        "#,
        )
        .unwrap();
        assert_eq!(
            config.client.resolved_cert_dir().unwrap(),
            PathBuf::from("/etc/stevedore/certs")
        );
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stevedore.toml");
        tokio::fs::write(
            &path,
            b"[daemon]\nlisten_port = 4242\nlisten_addr = \"0.0.0.0\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.daemon.listen_port, 4242);
        assert_eq!(config.daemon.listen_addr, "0.0.0.0");
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        assert!(AppConfig::load(&path).await.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
