//! Target host layout and Compose path rewriting
//!
//! Every absolute bind mount of a stack lands in `{appdata}/{stack}/{name}`
//! on the target, where `name` is the final segment of the source path.
//! Named volumes are restored into engine volumes of the same name.

use std::collections::BTreeMap;

use stackshift_common::validation::validate_remote_path;

use crate::archive::member_name;
use crate::error::{MigrationError, Result};
use crate::remote::{RemoteExec, shell_quote};

/// Directory under the stack directory where archives are unpacked before
/// their contents are moved into place
pub const STAGING_DIR_NAME: &str = ".stackshift-restore";

/// Last non-empty segment of a path
pub fn final_segment(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// `{appdata}/{stack}`
pub fn stack_directory(appdata_path: &str, stack_name: &str) -> String {
    format!("{}/{}", appdata_path.trim_end_matches('/'), stack_name)
}

/// Map each old bind path to `{new_base}/{final segment}`
///
/// Two sources sharing a final segment would land on the same directory, so
/// that is rejected up front.
pub fn plan_target_paths(old_paths: &[String], new_base: &str) -> Result<BTreeMap<String, String>> {
    let base = new_base.trim_end_matches('/');
    let mut planned = BTreeMap::new();
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();

    for old in old_paths {
        let name = final_segment(old);
        if name.is_empty() || name == "." || name == ".." {
            return Err(MigrationError::InvalidInput {
                reason: format!("cannot derive a target directory name from '{old}'"),
            });
        }
        let previous = owners.insert(name, old.as_str());
        if let Some(previous) = previous.filter(|previous| *previous != old.as_str()) {
            return Err(MigrationError::InvalidInput {
                reason: format!(
                    "bind mounts '{previous}' and '{old}' would both move to {base}/{name}"
                ),
            });
        }
        planned.insert(old.clone(), format!("{base}/{name}"));
    }

    Ok(planned)
}

/// Create the stack directory on the target host and return its path
pub async fn prepare_target_directories(
    remote: &RemoteExec,
    appdata_path: &str,
    stack_name: &str,
) -> Result<String> {
    let target_dir = stack_directory(appdata_path, stack_name);
    validate_remote_path(&target_dir).map_err(|reason| MigrationError::TargetPreparation {
        path: target_dir.clone(),
        reason,
    })?;

    let output = remote
        .run(&format!("mkdir -p {}", shell_quote(&target_dir)))
        .await?;
    if !output.success() {
        return Err(MigrationError::TargetPreparation {
            path: target_dir,
            reason: output.error_text(),
        });
    }

    log::info!("[{}] Prepared {}", remote.label(), target_dir);
    Ok(target_dir)
}

/// Rewrite bind mount paths in Compose text
///
/// Every literal occurrence of an old path becomes `{new_base}/{final
/// segment}`. Longer paths win when one old path is a prefix of another, and
/// replaced text is never scanned again. Anything not in `old_paths` is left
/// as it was.
pub fn update_compose_for_migration(content: &str, old_paths: &[String], new_base: &str) -> String {
    let base = new_base.trim_end_matches('/');
    let mut replacements: Vec<(&str, String)> = old_paths
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| (p.as_str(), format!("{}/{}", base, final_segment(p))))
        .collect();
    replacements.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    'scan: while !rest.is_empty() {
        for (old, new) in &replacements {
            if rest.starts_with(old) {
                out.push_str(new);
                rest = &rest[old.len()..];
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Where one archived source path ends up on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreDestination {
    /// A plain directory (or file) path
    Path(String),
    /// An engine volume, created if missing
    Volume(String),
}

/// One archived path and its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreEntry {
    /// Absolute path on the source host, as archived
    pub source_path: String,
    pub destination: RestoreDestination,
}

async fn volume_mountpoint(remote: &RemoteExec, volume: &str) -> Result<String> {
    let command = format!(
        "docker volume create {name} >/dev/null && docker volume inspect --format '{{{{ .Mountpoint }}}}' {name}",
        name = shell_quote(volume)
    );
    let output = remote.run_checked(&command).await?;
    let mountpoint = output.stdout.trim();
    if mountpoint.is_empty() {
        return Err(MigrationError::TargetPreparation {
            path: volume.to_string(),
            reason: "volume has no mount point".to_string(),
        });
    }
    Ok(mountpoint.to_string())
}

fn copy_command(staged: &str, destination: &str) -> String {
    let staged = shell_quote(staged);
    let destination = shell_quote(destination);
    format!(
        "if [ -d {staged} ]; then mkdir -p {destination} && cp -a {staged}/. {destination}/; \
         else mkdir -p \"$(dirname {destination})\" && cp -a {staged} {destination}; fi"
    )
}

/// Move unpacked archive members from `staging_dir` to their destinations,
/// then remove the staging directory.
pub async fn restore_from_staging(
    remote: &RemoteExec,
    staging_dir: &str,
    entries: &[RestoreEntry],
) -> Result<()> {
    let staging = staging_dir.trim_end_matches('/');

    for entry in entries {
        let staged = format!("{}/{}", staging, member_name(&entry.source_path));
        let destination = match &entry.destination {
            RestoreDestination::Path(path) => path.clone(),
            RestoreDestination::Volume(name) => volume_mountpoint(remote, name).await?,
        };

        let output = remote.run(&copy_command(&staged, &destination)).await?;
        if !output.success() {
            return Err(MigrationError::TargetPreparation {
                path: destination,
                reason: output.error_text(),
            });
        }
        log::debug!("[{}] Restored {} -> {}", remote.label(), entry.source_path, destination);
    }

    let output = remote.run(&format!("rm -rf {}", shell_quote(staging))).await?;
    if !output.success() {
        log::warn!(
            "[{}] Could not remove staging directory {}: {}",
            remote.label(),
            staging,
            output.error_text()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandOutput;
    use crate::remote::testing::ScriptedRunner;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_final_segment() {
        assert_eq!(final_segment("/srv/web/config"), "config");
        assert_eq!(final_segment("/srv/web/config/"), "config");
        assert_eq!(final_segment("data"), "data");
    }

    #[test]
    fn test_rewrites_known_paths_only() {
        let compose = "\
services:
  web:
    volumes:
      - /srv/web/config:/config
      - ./config:/app/config
      - /srv/media:/media:ro
";
        let updated = update_compose_for_migration(
            compose,
            &paths(&["/srv/web/config", "/srv/media"]),
            "/opt/appdata/web",
        );
        assert!(updated.contains("- /opt/appdata/web/config:/config"));
        assert!(updated.contains("- ./config:/app/config"));
        assert!(updated.contains("- /opt/appdata/web/media:/media:ro"));
        assert!(!updated.contains("/srv/"));
    }

    #[test]
    fn test_rewrites_every_occurrence() {
        let compose = "a: /srv/data\nb: /srv/data:/x\nc: \"/srv/data\"\n";
        let updated = update_compose_for_migration(compose, &paths(&["/srv/data"]), "/opt/s/");
        assert_eq!(updated, "a: /opt/s/data\nb: /opt/s/data:/x\nc: \"/opt/s/data\"\n");
    }

    #[test]
    fn test_longest_path_wins_and_no_rescan() {
        let compose = "- /srv/app/logs:/logs\n- /srv/app:/app\n";
        let updated = update_compose_for_migration(
            compose,
            &paths(&["/srv/app", "/srv/app/logs"]),
            "/srv/app",
        );
        assert_eq!(updated, "- /srv/app/logs:/logs\n- /srv/app/app:/app\n");
    }

    #[test]
    fn test_empty_mapping_is_identity() {
        let compose = "services:\n  web:\n    image: nginx # café\n";
        assert_eq!(update_compose_for_migration(compose, &[], "/opt"), compose);
    }

    #[test]
    fn test_plan_rejects_collisions() {
        let planned = plan_target_paths(&paths(&["/srv/a/config", "/srv/media"]), "/opt/web").unwrap();
        assert_eq!(planned["/srv/a/config"], "/opt/web/config");

        let err = plan_target_paths(&paths(&["/srv/a/config", "/srv/b/config"]), "/opt/web").unwrap_err();
        assert!(matches!(err, MigrationError::InvalidInput { .. }));

        assert!(plan_target_paths(&paths(&["/"]), "/opt/web").is_err());
    }

    #[tokio::test]
    async fn test_prepare_creates_stack_dir() {
        let (runner, exec) = ScriptedRunner::new().into_exec();
        let dir = prepare_target_directories(&exec, "/opt/appdata/", "web").await.unwrap();
        assert_eq!(dir, "/opt/appdata/web");
        assert_eq!(runner.calls(), vec!["ssh deploy@test mkdir -p /opt/appdata/web".to_string()]);
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let (_runner, exec) = ScriptedRunner::new()
            .on("mkdir", CommandOutput::failed(1, "mkdir: cannot create directory: Permission denied"))
            .into_exec();

        let err = prepare_target_directories(&exec, "/opt/appdata", "web").await.unwrap_err();
        match err {
            MigrationError::TargetPreparation { path, reason } => {
                assert_eq!(path, "/opt/appdata/web");
                assert!(reason.contains("Permission denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_prepare_rejects_relative_base() {
        let (runner, exec) = ScriptedRunner::new().into_exec();
        assert!(prepare_target_directories(&exec, "appdata", "web").await.is_err());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restore_paths_and_volumes() {
        let (runner, exec) = ScriptedRunner::new()
            .on(
                "docker volume create",
                CommandOutput::ok("/var/lib/docker/volumes/web_data/_data\n"),
            )
            .into_exec();

        let entries = vec![
            RestoreEntry {
                source_path: "/srv/web/config".to_string(),
                destination: RestoreDestination::Path("/opt/appdata/web/config".to_string()),
            },
            RestoreEntry {
                source_path: "/var/lib/docker/volumes/web_data/_data".to_string(),
                destination: RestoreDestination::Volume("web_data".to_string()),
            },
        ];

        restore_from_staging(&exec, "/opt/appdata/web/.stackshift-restore", &entries)
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].contains("cp -a /opt/appdata/web/.stackshift-restore/srv/web/config/. /opt/appdata/web/config/"));
        assert!(calls[1].contains("docker volume create web_data"));
        assert!(calls[2].contains("/var/lib/docker/volumes/web_data/_data/"));
        assert!(calls[3].ends_with("rm -rf /opt/appdata/web/.stackshift-restore"));
    }
}
