//! Host-to-host transfers with rsync
//!
//! rsync cannot copy between two remote endpoints, so the transfer runs on
//! the source host and pushes to the target over its own ssh connection.
//! The source host therefore needs non-interactive ssh access to the target.

use std::sync::Arc;
use std::time::Duration;

use stackshift_common::{HostDescriptor, TransferResult};

use crate::error::{MigrationError, Result};
use crate::remote::{CommandRunner, RemoteExec, shell_quote};
use crate::stats::parse_rsync_stats;

/// Flags for one rsync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub compress: bool,
    /// Remove files on the target that are absent on the source
    pub delete: bool,
    pub dry_run: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            compress: true,
            delete: false,
            dry_run: false,
        }
    }
}

/// `user@host:path`
pub fn remote_spec(host: &HostDescriptor, path: &str) -> String {
    format!("{}:{}", host.ssh_target(), path)
}

/// Build the rsync command line that runs on the source host
pub fn rsync_command(
    target: &HostDescriptor,
    source_path: &str,
    target_path: &str,
    options: TransferOptions,
) -> String {
    // Flags overview:
    // - -a: archive mode, keeps ownership, permissions and timestamps
    // - --stats: summary block parsed into TransferStats
    // - -z: compress on the wire (pointless for .tar.gz payloads, kept optional)
    // - -e: how the source host reaches the target; the controller's identity
    //   file does not exist there, so only port and batch options are passed
    let mut args = vec!["rsync".to_string(), "-a".to_string(), "--stats".to_string()];
    if options.compress {
        args.push("-z".to_string());
    }
    if options.delete {
        args.push("--delete".to_string());
    }
    if options.dry_run {
        args.push("--dry-run".to_string());
    }

    let transport = format!(
        "ssh -p {} -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
        target.port
    );
    args.push("-e".to_string());
    args.push(shell_quote(&transport));
    args.push(shell_quote(source_path));
    args.push(shell_quote(&remote_spec(target, target_path)));

    args.join(" ")
}

/// Moves data between hosts
#[derive(Clone)]
pub struct TransferCoordinator {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl std::fmt::Debug for TransferCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TransferCoordinator {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Executor for long-running commands on `host`
    pub fn exec_for(&self, host: &HostDescriptor) -> RemoteExec {
        RemoteExec::for_host(host, self.runner.clone()).with_timeout(self.timeout)
    }

    /// Mirror `source_path` on `source` to `target_path` on `target`
    ///
    /// Fails with [`MigrationError::Transfer`] carrying rsync's stderr on
    /// nonzero exit. Statistics parsing never fails.
    pub async fn transfer_with_rsync(
        &self,
        source: &HostDescriptor,
        target: &HostDescriptor,
        source_path: &str,
        target_path: &str,
        options: TransferOptions,
    ) -> Result<TransferResult> {
        let source_spec = remote_spec(source, source_path);
        let destination = remote_spec(target, target_path);

        log::info!(
            "Transferring {} -> {}{}",
            source_spec,
            destination,
            if options.dry_run { " (dry run)" } else { "" }
        );

        let exec = self.exec_for(source);
        let output = exec
            .run(&rsync_command(target, source_path, target_path, options))
            .await?;

        if !output.success() {
            return Err(MigrationError::Transfer {
                reason: format!(
                    "rsync exited with status {}: {}",
                    output.status,
                    output.error_text()
                ),
            });
        }

        let stats = parse_rsync_stats(&output.stdout);
        log::info!(
            "Transfer complete: {} file(s), {} bytes{}",
            stats.files_transferred,
            stats.total_size,
            if stats.transfer_rate.is_empty() {
                String::new()
            } else {
                format!(" at {}", stats.transfer_rate)
            }
        );

        Ok(TransferResult {
            source: source_spec,
            destination,
            dry_run: options.dry_run,
            stats,
            output: output.stdout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandOutput;
    use crate::remote::testing::ScriptedRunner;

    fn hosts() -> (HostDescriptor, HostDescriptor) {
        let source = HostDescriptor::new("alpha", "10.0.0.5", "deploy");
        let mut target = HostDescriptor::new("beta", "beta.lan", "root");
        target.port = 2222;
        (source, target)
    }

    #[test]
    fn test_rsync_command_flags() {
        let (_, target) = hosts();

        let cmd = rsync_command(&target, "/tmp/web.tar.gz", "/tmp/", TransferOptions::default());
        assert!(cmd.starts_with("rsync -a --stats -z -e "));
        assert!(cmd.contains("'ssh -p 2222 -o BatchMode=yes -o StrictHostKeyChecking=accept-new'"));
        assert!(cmd.ends_with("/tmp/web.tar.gz root@beta.lan:/tmp/"));
        assert!(!cmd.contains("--delete"));
        assert!(!cmd.contains("--dry-run"));

        let cmd = rsync_command(
            &target,
            "/srv/data/",
            "/opt/appdata/web/data",
            TransferOptions {
                compress: false,
                delete: true,
                dry_run: true,
            },
        );
        assert!(!cmd.contains(" -z "));
        assert!(cmd.contains("--delete --dry-run"));
    }

    #[tokio::test]
    async fn test_transfer_parses_stats() {
        let (source, target) = hosts();
        let runner = Arc::new(ScriptedRunner::new().on(
            "rsync",
            CommandOutput::ok(
                "Number of regular files transferred: 3\n\
                 Total transferred file size: 4,096 bytes\n\
                 sent 4,500 bytes  received 60 bytes  9,120.00 bytes/sec\n\
                 total size is 4,096  speedup is 0.90\n",
            ),
        ));
        let coordinator = TransferCoordinator::new(runner.clone(), Duration::from_secs(60));

        let result = coordinator
            .transfer_with_rsync(&source, &target, "/tmp/a", "/tmp/", TransferOptions::default())
            .await
            .unwrap();

        assert_eq!(result.source, "deploy@10.0.0.5:/tmp/a");
        assert_eq!(result.destination, "root@beta.lan:/tmp/");
        assert_eq!(result.stats.files_transferred, 3);
        assert_eq!(result.stats.total_size, 4096);
        assert_eq!(result.stats.transfer_rate, "9,120.00 bytes/sec");
        assert_eq!(result.stats.speedup, 0.9);

        // runs on the source host
        assert!(runner.calls()[0].contains("deploy@10.0.0.5 rsync -a"));
    }

    #[tokio::test]
    async fn test_transfer_failure_carries_stderr() {
        let (source, target) = hosts();
        let runner = Arc::new(ScriptedRunner::new().on(
            "rsync",
            CommandOutput::failed(12, "rsync error: error in rsync protocol data stream (code 12)"),
        ));
        let coordinator = TransferCoordinator::new(runner, Duration::from_secs(60));

        let err = coordinator
            .transfer_with_rsync(&source, &target, "/tmp/a", "/tmp/", TransferOptions::default())
            .await
            .unwrap_err();

        match err {
            MigrationError::Transfer { reason } => {
                assert!(reason.contains("status 12"));
                assert!(reason.contains("protocol data stream"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unparsable_output_still_succeeds() {
        let (source, target) = hosts();
        let runner = Arc::new(ScriptedRunner::new().on("rsync", CommandOutput::ok("done\n")));
        let coordinator = TransferCoordinator::new(runner, Duration::from_secs(60));

        let result = coordinator
            .transfer_with_rsync(&source, &target, "/tmp/a", "/tmp/", TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stats.files_transferred, 0);
        assert_eq!(result.stats.speedup, 1.0);
    }
}
