//! Error types for the migration engine

use std::time::Duration;

use stackshift_common::SyncMethod;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MigrationError>;

/// A sync verification strategy did not converge within its budget
#[derive(Error, Debug, Clone)]
#[error("Filesystem sync verification ({method}) failed after {attempts} attempts in {duration:?}: {details}")]
pub struct FilesystemSyncError {
    pub method: SyncMethod,
    pub duration: Duration,
    pub attempts: u32,
    pub details: String,
}

/// Failure of a migration step
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Failed to parse compose file: {reason}")]
    ComposeParse { reason: String },

    #[error("Failed to extract volumes from compose file: {reason}")]
    VolumeExtraction { reason: String },

    #[error("Archive operation failed: {reason}")]
    Archive { reason: String },

    #[error("Transfer failed: {reason}")]
    Transfer { reason: String },

    #[error("Failed to prepare target directory {path}: {reason}")]
    TargetPreparation { path: String, reason: String },

    #[error("Containers of stack '{stack}' are still running: {}", containers.join(", "))]
    ContainersRunning {
        stack: String,
        containers: Vec<String>,
    },

    #[error("Remote command failed ({command}): {reason}")]
    RemoteCommand { command: String, reason: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error(transparent)]
    FilesystemSync(#[from] FilesystemSyncError),
}

impl MigrationError {
    /// Short label of the failure kind, used in the summary log line
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::ComposeParse { .. } => "compose_parse",
            MigrationError::VolumeExtraction { .. } => "volume_extraction",
            MigrationError::Archive { .. } => "archive",
            MigrationError::Transfer { .. } => "transfer",
            MigrationError::TargetPreparation { .. } => "target_preparation",
            MigrationError::ContainersRunning { .. } => "containers_running",
            MigrationError::RemoteCommand { .. } => "remote_command",
            MigrationError::Spawn { .. } => "spawn",
            MigrationError::Timeout { .. } => "timeout",
            MigrationError::InvalidInput { .. } => "invalid_input",
            MigrationError::FilesystemSync(_) => "filesystem_sync",
        }
    }
}
