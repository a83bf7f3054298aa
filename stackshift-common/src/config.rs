// Centralized configuration for stackshift

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::HostDescriptor;
use crate::validation::{describe_errors, validate_host};

/// Process-wide configuration with support for environment variable overrides
#[derive(Debug, Clone)]
pub struct StackshiftConfig {
    /// Path to the hosts file (default: ~/.config/stackshift/config.toml)
    pub config_file: PathBuf,

    /// Remote directory where archives are staged (default: /tmp)
    pub temp_dir: String,

    /// Base directory for stack data on target hosts (default: /opt/appdata)
    pub appdata_path: String,

    /// Timeout applied to every remote command
    pub command_timeout: Duration,

    /// Overrides the sync budget from the hosts file when set
    pub sync_max_wait: Option<Duration>,
}

impl Default for StackshiftConfig {
    fn default() -> Self {
        let config_file = dirs::config_dir()
            .map(|dir| dir.join("stackshift").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("/etc/stackshift/config.toml"));

        Self {
            config_file,
            temp_dir: "/tmp".to_string(),
            appdata_path: "/opt/appdata".to_string(),
            command_timeout: Duration::from_secs(120),
            sync_max_wait: None,
        }
    }
}

impl StackshiftConfig {
    /// Create a new configuration with environment variable overrides
    ///
    /// Supported environment variables:
    /// - STACKSHIFT_CONFIG: Override hosts file path
    /// - STACKSHIFT_TEMP_DIR: Override remote archive staging directory
    /// - STACKSHIFT_APPDATA_PATH: Override default target appdata directory
    /// - STACKSHIFT_COMMAND_TIMEOUT_SECS: Override per-command timeout
    /// - STACKSHIFT_SYNC_MAX_WAIT_SECS: Override filesystem sync budget
    pub fn new() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STACKSHIFT_CONFIG") {
            config.config_file = PathBuf::from(path);
        }

        if let Ok(dir) = std::env::var("STACKSHIFT_TEMP_DIR") {
            config.temp_dir = dir;
        }

        if let Ok(dir) = std::env::var("STACKSHIFT_APPDATA_PATH") {
            config.appdata_path = dir;
        }

        if let Some(secs) = env_secs("STACKSHIFT_COMMAND_TIMEOUT_SECS") {
            config.command_timeout = Duration::from_secs(secs);
        }

        config.sync_max_wait = env_secs("STACKSHIFT_SYNC_MAX_WAIT_SECS").map(Duration::from_secs);

        config
    }

    /// Load the hosts file and apply environment overrides on top of it
    pub fn load_hosts(&self) -> anyhow::Result<HostsFile> {
        let mut hosts = if self.config_file.exists() {
            HostsFile::load_from_file(&self.config_file)?
        } else {
            log::warn!(
                "Hosts file not found at {}. Using defaults.",
                self.config_file.display()
            );
            HostsFile::default()
        };

        if std::env::var("STACKSHIFT_TEMP_DIR").is_ok() {
            hosts.settings.temp_dir = self.temp_dir.clone();
        }
        if std::env::var("STACKSHIFT_APPDATA_PATH").is_ok() {
            hosts.settings.appdata_path = self.appdata_path.clone();
        }
        if std::env::var("STACKSHIFT_COMMAND_TIMEOUT_SECS").is_ok() {
            hosts.settings.command_timeout_secs = self.command_timeout.as_secs();
        }
        if let Some(max_wait) = self.sync_max_wait {
            hosts.settings.sync.max_wait_secs = max_wait.as_secs();
        }

        Ok(hosts)
    }
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|secs| secs.parse().ok())
}

/// Largest accepted growth factor between polling delays
pub const MAX_BACKOFF_FACTOR: f64 = 10.0;

/// Polling parameters for filesystem sync verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub max_wait_secs: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_wait_secs: 60,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            backoff_factor: 1.5,
        }
    }
}

impl SyncSettings {
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_wait_secs == 0 {
            return Err("max_wait_secs must be greater than zero".to_string());
        }
        if !(1.0..=MAX_BACKOFF_FACTOR).contains(&self.backoff_factor) {
            return Err(format!(
                "backoff_factor must be between 1.0 and {} (got {})",
                MAX_BACKOFF_FACTOR, self.backoff_factor
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(format!(
                "initial_delay_ms ({}) cannot exceed max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}

/// Global settings section of the hosts file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub temp_dir: String,
    pub appdata_path: String,
    pub command_timeout_secs: u64,
    /// Timeout for archive and rsync commands, which can run for hours
    pub transfer_timeout_secs: u64,
    pub sync: SyncSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = StackshiftConfig::default();
        Self {
            temp_dir: defaults.temp_dir,
            appdata_path: defaults.appdata_path,
            command_timeout_secs: defaults.command_timeout.as_secs(),
            transfer_timeout_secs: 6 * 60 * 60,
            sync: SyncSettings::default(),
        }
    }
}

impl Settings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// Hosts file: global settings plus the list of known Docker hosts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub settings: Settings,

    #[serde(rename = "host", default)]
    pub hosts: Vec<HostDescriptor>,
}

impl HostsFile {
    /// Load and validate a hosts file from TOML
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hosts file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid hosts file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let file: HostsFile = toml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.settings
            .sync
            .validate()
            .map_err(|e| anyhow::anyhow!("[settings.sync] {e}"))?;

        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            validate_host(host).map_err(|errors| {
                anyhow::anyhow!("host '{}': {}", host.id, describe_errors(&errors))
            })?;
            if !seen.insert(host.id.as_str()) {
                bail!("host '{}' is defined more than once", host.id);
            }
        }
        Ok(())
    }

    /// Look up a host by its identifier
    pub fn host(&self, id: &str) -> anyhow::Result<&HostDescriptor> {
        self.hosts
            .iter()
            .find(|h| h.id == id)
            .ok_or_else(|| anyhow::anyhow!("Unknown host '{id}'"))
    }

    /// Appdata base directory for a host, falling back to the global setting
    pub fn appdata_path_for<'a>(&'a self, host: &'a HostDescriptor) -> &'a str {
        host.appdata_path
            .as_deref()
            .unwrap_or(&self.settings.appdata_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[settings]
temp_dir = "/var/tmp"
command_timeout_secs = 30

[settings.sync]
max_wait_secs = 90

[[host]]
name = "alpha"
hostname = "10.0.0.5"
user = "deploy"
identity_file = "/home/me/.ssh/id_ed25519"

[[host]]
name = "beta"
hostname = "beta.lan"
user = "root"
port = 2222
appdata_path = "/srv/appdata"
exclude = ["*.sqlite-wal"]
"#;

    #[test]
    fn test_default_config() {
        let config = StackshiftConfig::default();
        assert_eq!(config.temp_dir, "/tmp");
        assert_eq!(config.appdata_path, "/opt/appdata");
        assert_eq!(config.command_timeout, Duration::from_secs(120));
        assert!(config.sync_max_wait.is_none());
    }

    #[test]
    fn test_parse_hosts_file() {
        let file = HostsFile::from_toml(SAMPLE).unwrap();
        assert_eq!(file.hosts.len(), 2);
        assert_eq!(file.settings.temp_dir, "/var/tmp");
        assert_eq!(file.settings.appdata_path, "/opt/appdata");
        assert_eq!(file.settings.command_timeout(), Duration::from_secs(30));
        assert_eq!(file.settings.transfer_timeout(), Duration::from_secs(21_600));
        assert_eq!(file.settings.sync.max_wait_secs, 90);
        assert_eq!(file.settings.sync.backoff_factor, 1.5);

        let alpha = file.host("alpha").unwrap();
        assert_eq!(alpha.port, 22);
        assert_eq!(file.appdata_path_for(alpha), "/opt/appdata");

        let beta = file.host("beta").unwrap();
        assert_eq!(beta.port, 2222);
        assert_eq!(file.appdata_path_for(beta), "/srv/appdata");
        assert_eq!(beta.exclude, vec!["*.sqlite-wal".to_string()]);
    }

    #[test]
    fn test_unknown_host() {
        let file = HostsFile::from_toml(SAMPLE).unwrap();
        assert!(file.host("gamma").is_err());
    }

    #[test]
    fn test_rejects_invalid_host() {
        let bad = r#"
[[host]]
name = "alpha"
hostname = "10.0.0.5"
user = "deploy"
port = 0
"#;
        assert!(HostsFile::from_toml(bad).is_err());
    }

    #[test]
    fn test_rejects_duplicate_host() {
        let dup = r#"
[[host]]
name = "alpha"
hostname = "a"
user = "u"

[[host]]
name = "alpha"
hostname = "b"
user = "u"
"#;
        assert!(HostsFile::from_toml(dup).is_err());
    }

    #[test]
    fn test_sync_settings_validation() {
        assert!(SyncSettings::default().validate().is_ok());

        let mut settings = SyncSettings::default();
        settings.backoff_factor = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = SyncSettings::default();
        settings.initial_delay_ms = 10_000;
        assert!(settings.validate().is_err());

        let mut settings = SyncSettings::default();
        settings.max_wait_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_non_finite_backoff_factor() {
        for factor in ["nan", "inf", "+inf", "-inf", "1e300", "10.5"] {
            let text = format!("[settings.sync]\nbackoff_factor = {factor}\n");
            assert!(HostsFile::from_toml(&text).is_err(), "accepted {factor}");
        }

        let file = HostsFile::from_toml("[settings.sync]\nbackoff_factor = 10.0\n").unwrap();
        assert_eq!(file.settings.sync.backoff_factor, MAX_BACKOFF_FACTOR);
    }

    #[test]
    fn test_toml_roundtrip_keeps_hosts() {
        let file = HostsFile::from_toml(SAMPLE).unwrap();
        let text = toml::to_string_pretty(&file).unwrap();
        assert!(text.contains("[[host]]"));
        assert!(text.contains("name = \"beta\""));
    }
}
