//! Configuration management for shoal
//!
//! Settings are read from `~/.shoal/config.toml` (or an explicit path) and
//! then overridden by command-line flags in the binary. Every key has a
//! default, so an empty or missing file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::HostDefaults;
use crate::{Result, ShoalError};

/// Config file location relative to the user's home directory
pub const DEFAULT_CONFIG_PATH: &str = ".shoal/config.toml";

/// User-level shoal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShoalConfig {
    /// Hosts registered at start-up
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Accept and remember unknown host keys instead of refusing the connection.
    /// Generally NOT something you want.
    #[serde(default)]
    pub auto_add_hosts: bool,

    /// Default user for host specs without `user@`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Default password for host specs without `:password@`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Default port for host specs without `:port`
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds to wait for each host before a fan-out returns control
    #[serde(default = "default_job_timeout")]
    pub job_timeout: f64,

    /// Seconds allowed for TCP connect plus SSH handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,

    /// Private keys tried, in order, when no password is known
    #[serde(default = "default_identity_files")]
    pub identity_files: Vec<PathBuf>,

    /// Known-hosts file (defaults to `~/.ssh/known_hosts`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,

    /// Console prompt
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

// Default value providers
fn default_port() -> u16 {
    22
}

fn default_job_timeout() -> f64 {
    0.1
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_identity_files() -> Vec<PathBuf> {
    match dirs::home_dir() {
        Some(home) => vec![
            home.join(".ssh").join("id_ed25519"),
            home.join(".ssh").join("id_rsa"),
        ],
        None => Vec::new(),
    }
}

fn default_prompt() -> String {
    "shoal $ ".to_string()
}

/// Convert a seconds value from config or the console into a `Duration`.
///
/// Negative and NaN values clamp to zero; values too large for a `Duration`
/// saturate.
pub fn duration_from_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl ShoalConfig {
    /// `~/.shoal/config.toml`, if a home directory can be determined
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from `path`, or defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            ShoalError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Load from an explicit path, or from the default location
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Write the default configuration to `path`, creating parent directories
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ShoalError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fan-out wait bound per host
    pub fn job_timeout(&self) -> Duration {
        duration_from_secs(self.job_timeout)
    }

    /// Connect + handshake bound
    pub fn connect_timeout(&self) -> Duration {
        duration_from_secs(self.connect_timeout)
    }

    /// Known-hosts file, falling back to `~/.ssh/known_hosts`
    pub fn known_hosts_path(&self) -> Option<PathBuf> {
        self.known_hosts
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")))
    }

    /// Defaults applied to host specs that omit user, password or port.
    ///
    /// Without a configured username the local login name is used, as the
    /// OpenSSH client does.
    pub fn host_defaults(&self) -> HostDefaults {
        let username = self
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "root".to_string());

        HostDefaults {
            username,
            password: self.password.clone().filter(|p| !p.is_empty()),
            port: self.port,
        }
    }
}

impl Default for ShoalConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            auto_add_hosts: false,
            username: None,
            password: None,
            port: default_port(),
            job_timeout: default_job_timeout(),
            connect_timeout: default_connect_timeout(),
            identity_files: default_identity_files(),
            known_hosts: None,
            prompt: default_prompt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ShoalConfig::load(&dir.path().join("nope.toml")).unwrap();

        assert_eq!(config.port, 22);
        assert!(!config.auto_add_hosts);
        assert!(config.hosts.is_empty());
        assert_eq!(config.job_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "hosts = [\"web1\", \"deploy@web2:2222\"]\nauto_add_hosts = true\njob_timeout = 2.5\n",
        )
        .unwrap();

        let config = ShoalConfig::load(&path).unwrap();
        assert_eq!(config.hosts, vec!["web1", "deploy@web2:2222"]);
        assert!(config.auto_add_hosts);
        assert_eq!(config.job_timeout(), Duration::from_millis(2500));
        assert_eq!(config.port, 22);
        assert_eq!(config.prompt, "shoal $ ");
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"twenty-two\"").unwrap();

        let err = ShoalConfig::load(&path).unwrap_err();
        assert!(matches!(err, ShoalError::Config(_)));
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".shoal").join("config.toml");

        ShoalConfig::write_default(&path).unwrap();
        let config = ShoalConfig::load(&path).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_negative_timeout_clamps_to_zero() {
        assert_eq!(duration_from_secs(-3.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::INFINITY), Duration::MAX);
    }

    #[test]
    fn test_configured_username_wins() {
        let config = ShoalConfig {
            username: Some("deploy".to_string()),
            password: Some(String::new()),
            port: 2200,
            ..ShoalConfig::default()
        };

        let defaults = config.host_defaults();
        assert_eq!(defaults.username, "deploy");
        assert_eq!(defaults.password, None);
        assert_eq!(defaults.port, 2200);
    }
}
