// Shared types and utilities for stackshift

pub mod config;
pub mod exclude;
pub mod format;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use config::{HostsFile, Settings, StackshiftConfig, SyncSettings};
pub use exclude::{ExcludeConfig, ExcludePattern};
pub use format::{format_bytes, format_duration};

/// A Docker host reachable over SSH
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostDescriptor {
    /// Short identifier used on the command line (e.g., "alpha")
    #[serde(rename = "name")]
    pub id: String,
    pub hostname: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key passed to ssh with `-i`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Base directory for stack data on this host, overrides the global default
    #[serde(default)]
    pub appdata_path: Option<String>,
    /// Extra archive exclusions applied when this host is a migration source
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl HostDescriptor {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            user: user.into(),
            port: default_ssh_port(),
            identity_file: None,
            appdata_path: None,
            exclude: Vec::new(),
        }
    }

    /// `user@hostname`, the form ssh and rsync expect
    pub fn ssh_target(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }
}

/// One volume entry of a Compose service, normalized from either the
/// `source:dest[:mode]` string form or the long mapping form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountSpec {
    BindMount {
        source: String,
        dest: String,
        mode: Option<String>,
    },
    NamedVolume {
        name: String,
        dest: String,
        mode: Option<String>,
    },
}

impl MountSpec {
    /// Classify a mount source. Paths starting with `/`, `./` or `~` are bind
    /// mounts, everything else names an engine-managed volume.
    pub fn classify(source: &str, dest: impl Into<String>, mode: Option<String>) -> Self {
        if is_bind_source(source) {
            MountSpec::BindMount {
                source: source.to_string(),
                dest: dest.into(),
                mode,
            }
        } else {
            MountSpec::NamedVolume {
                name: source.to_string(),
                dest: dest.into(),
                mode,
            }
        }
    }

    pub fn is_bind(&self) -> bool {
        matches!(self, MountSpec::BindMount { .. })
    }
}

/// Returns true if a mount source refers to a host path
pub fn is_bind_source(source: &str) -> bool {
    source.starts_with('/') || source.starts_with("./") || source.starts_with('~')
}

/// Volumes referenced by a Compose document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeInventory {
    pub named_volumes: BTreeSet<String>,
    pub bind_mounts: BTreeSet<String>,
    /// Top-level `volumes:` block, kept verbatim
    pub volume_definitions: BTreeMap<String, serde_json::Value>,
}

impl VolumeInventory {
    pub fn is_empty(&self) -> bool {
        self.named_volumes.is_empty() && self.bind_mounts.is_empty()
    }

    /// Bind mounts addressed by absolute path. Relative and home-relative
    /// sources only make sense next to the compose file and are not migrated.
    pub fn absolute_bind_mounts(&self) -> impl Iterator<Item = &String> {
        self.bind_mounts.iter().filter(|p| p.starts_with('/'))
    }
}

/// Strategy used to decide that a set of remote paths has settled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    /// Probe the remote host and pick the best available strategy
    Auto,
    Sync,
    Checksum,
    Size,
    Simple,
    /// Nothing to verify. Reported for empty path lists, never parsed from
    /// user input
    None,
}

impl SyncMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Auto => "auto",
            SyncMethod::Sync => "sync",
            SyncMethod::Checksum => "checksum",
            SyncMethod::Size => "size",
            SyncMethod::Simple => "simple",
            SyncMethod::None => "none",
        }
    }
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SyncMethod::Auto),
            "sync" => Ok(SyncMethod::Sync),
            "checksum" => Ok(SyncMethod::Checksum),
            "size" => Ok(SyncMethod::Size),
            "simple" => Ok(SyncMethod::Simple),
            _ => Err(format!(
                "Invalid sync method '{s}'. Must be one of: auto, sync, checksum, size, simple"
            )),
        }
    }
}

/// Outcome of one filesystem stability check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncVerificationResult {
    pub success: bool,
    pub duration: Duration,
    pub attempts: u32,
    pub method: SyncMethod,
    pub details: serde_json::Value,
}

impl SyncVerificationResult {
    /// Result for an empty path list
    pub fn nothing_to_verify() -> Self {
        Self {
            success: true,
            duration: Duration::ZERO,
            attempts: 0,
            method: SyncMethod::None,
            details: serde_json::json!({ "message": "No paths to verify" }),
        }
    }
}

/// Summary parsed from rsync `--stats` output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferStats {
    pub files_transferred: u64,
    pub total_size: u64,
    pub transfer_rate: String,
    pub speedup: f64,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self {
            files_transferred: 0,
            total_size: 0,
            transfer_rate: String::new(),
            speedup: 1.0,
        }
    }
}

/// Result of a completed host-to-host transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub source: String,
    pub destination: String,
    pub dry_run: bool,
    pub stats: TransferStats,
    /// Raw tool output, kept for operators
    pub output: String,
}

/// Running state of a stack's containers on its source host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopVerificationOutcome {
    pub all_stopped: bool,
    pub running_containers: Vec<String>,
}

impl StopVerificationOutcome {
    pub fn stopped() -> Self {
        Self {
            all_stopped: true,
            running_containers: Vec::new(),
        }
    }

    pub fn running(containers: Vec<String>) -> Self {
        Self {
            all_stopped: containers.is_empty(),
            running_containers: containers,
        }
    }
}
