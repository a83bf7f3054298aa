//! Remote archive handling
//!
//! Archives are built on the source host with GNU tar. Members keep their
//! absolute path (minus the leading `/`) so one archive can carry paths from
//! anywhere on the filesystem; the target side moves them into place after
//! extraction.

use std::collections::BTreeMap;

use chrono::Local;
use stackshift_common::ExcludeConfig;

use crate::error::{MigrationError, Result};
use crate::remote::{RemoteExec, shell_join, shell_quote};

fn archive_error(reason: impl Into<String>) -> MigrationError {
    MigrationError::Archive {
        reason: reason.into(),
    }
}

/// `{temp_dir}/{name}_{YYYYMMDD_HHMMSS}.tar.gz`
pub fn archive_path(temp_dir: &str, archive_name: &str) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    format!(
        "{}/{}_{}.tar.gz",
        temp_dir.trim_end_matches('/'),
        archive_name,
        timestamp
    )
}

/// Archive member name for an absolute path
pub fn member_name(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Create a compressed archive of `paths` on the remote host, returning its
/// path on that host.
///
/// The built-in exclusions are always applied; `exclusions` is expected to
/// come from [`ExcludeConfig::with_extra`] when callers need more.
pub async fn create_volume_archive(
    remote: &RemoteExec,
    paths: &[String],
    archive_name: &str,
    temp_dir: &str,
    exclusions: &ExcludeConfig,
) -> Result<String> {
    if paths.is_empty() {
        return Err(archive_error("no paths to archive"));
    }
    if archive_name.is_empty() || archive_name.contains('/') {
        return Err(archive_error(format!("invalid archive name '{archive_name}'")));
    }

    let archive = archive_path(temp_dir, archive_name);

    let excludes = exclusions
        .pattern_strings()
        .map(|pattern| shell_quote(&format!("--exclude={pattern}")))
        .collect::<Vec<_>>()
        .join(" ");

    let members: Vec<String> = paths.iter().map(|p| member_name(p)).collect();

    let command = format!(
        "tar -czf {} {} -C / {}",
        shell_quote(&archive),
        excludes,
        shell_join(&members)
    );

    log::info!(
        "[{}] Archiving {} path(s) to {}",
        remote.label(),
        paths.len(),
        archive
    );

    let output = remote.run(&command).await?;
    if !output.success() {
        return Err(archive_error(format!(
            "tar exited with status {}: {}",
            output.status,
            output.error_text()
        )));
    }

    Ok(archive)
}

/// Check that an archive can be listed end to end
pub async fn verify_archive(remote: &RemoteExec, archive: &str) -> Result<()> {
    let output = remote
        .run(&format!("tar -tzf {} >/dev/null", shell_quote(archive)))
        .await?;
    if !output.success() {
        return Err(archive_error(format!(
            "archive {} is corrupt: {}",
            archive,
            output.error_text()
        )));
    }
    Ok(())
}

/// Extract an archive into `dest_dir`, creating it if needed
pub async fn extract_archive(remote: &RemoteExec, archive: &str, dest_dir: &str) -> Result<()> {
    let command = format!(
        "mkdir -p {dest} && tar -xzf {archive} -C {dest}",
        dest = shell_quote(dest_dir),
        archive = shell_quote(archive)
    );
    let output = remote.run(&command).await?;
    if !output.success() {
        return Err(archive_error(format!(
            "failed to extract {} into {}: {}",
            archive,
            dest_dir,
            output.error_text()
        )));
    }
    Ok(())
}

/// Delete an archive from the remote host
pub async fn cleanup_archive(remote: &RemoteExec, archive: &str) -> Result<()> {
    remote
        .run_checked(&format!("rm -f {}", shell_quote(archive)))
        .await
        .map(|_| ())
}

/// Look up the mount point of each named volume on the remote engine
///
/// Volumes that cannot be resolved are logged and left out of the result
pub async fn get_volume_locations(
    remote: &RemoteExec,
    named_volumes: &[String],
) -> BTreeMap<String, String> {
    let mut locations = BTreeMap::new();

    for volume in named_volumes {
        let command = format!(
            "docker volume inspect --format '{{{{ .Mountpoint }}}}' {}",
            shell_quote(volume)
        );
        match remote.run(&command).await {
            Ok(output) if output.success() => {
                let mountpoint = output.stdout.trim();
                if mountpoint.is_empty() {
                    log::warn!(
                        "[{}] Volume '{}' has no mount point, skipping",
                        remote.label(),
                        volume
                    );
                } else {
                    locations.insert(volume.clone(), mountpoint.to_string());
                }
            }
            Ok(output) => log::warn!(
                "[{}] Could not resolve volume '{}': {}",
                remote.label(),
                volume,
                output.error_text()
            ),
            Err(e) => log::warn!(
                "[{}] Could not resolve volume '{}': {}",
                remote.label(),
                volume,
                e
            ),
        }
    }

    locations
}
