//! Source container checks

use std::time::Duration;

use stackshift_common::StopVerificationOutcome;

use crate::error::{MigrationError, Result};
use crate::remote::{RemoteExec, shell_quote};

/// Wait after killing containers before the engine reports them gone
pub const FORCE_STOP_SETTLE: Duration = Duration::from_secs(3);

/// Compose labels every container of a project with this key
const PROJECT_LABEL: &str = "com.docker.compose.project";

async fn running_containers(remote: &RemoteExec, stack_name: &str) -> Result<Vec<String>> {
    let command = format!(
        "docker ps --filter {} --format '{{{{.Names}}}}'",
        shell_quote(&format!("label={PROJECT_LABEL}={stack_name}"))
    );
    let output = remote.run_checked(&command).await?;

    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

/// Check that no container of `stack_name` is running on the remote host
///
/// With `force_stop`, running containers are killed once and the stack is
/// listed again; the second listing is the answer, whatever it says.
pub async fn verify_containers_stopped(
    remote: &RemoteExec,
    stack_name: &str,
    force_stop: bool,
) -> Result<StopVerificationOutcome> {
    let mut force = force_stop;

    loop {
        let running = running_containers(remote, stack_name).await?;
        if running.is_empty() {
            log::info!("[{}] No running containers for stack '{}'", remote.label(), stack_name);
            return Ok(StopVerificationOutcome::stopped());
        }

        if !force {
            log::warn!(
                "[{}] {} container(s) of stack '{}' still running: {}",
                remote.label(),
                running.len(),
                stack_name,
                running.join(", ")
            );
            return Ok(StopVerificationOutcome::running(running));
        }

        log::info!(
            "[{}] Force stopping {} container(s) of stack '{}'",
            remote.label(),
            running.len(),
            stack_name
        );
        for container in &running {
            let output = remote
                .run(&format!("docker kill {}", shell_quote(container)))
                .await?;
            if !output.success() {
                log::warn!(
                    "[{}] Failed to kill {}: {}",
                    remote.label(),
                    container,
                    output.error_text()
                );
            }
        }

        tokio::time::sleep(FORCE_STOP_SETTLE).await;
        force = false;
    }
}

/// Like [`verify_containers_stopped`], but running containers are an error
pub async fn ensure_containers_stopped(
    remote: &RemoteExec,
    stack_name: &str,
    force_stop: bool,
) -> Result<()> {
    let outcome = verify_containers_stopped(remote, stack_name, force_stop).await?;
    if outcome.all_stopped {
        Ok(())
    } else {
        Err(MigrationError::ContainersRunning {
            stack: stack_name.to_string(),
            containers: outcome.running_containers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CommandOutput;
    use crate::remote::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_nothing_running() {
        let (runner, exec) = ScriptedRunner::new()
            .on("docker ps", CommandOutput::ok(""))
            .into_exec();

        let outcome = verify_containers_stopped(&exec, "media", true).await.unwrap();
        assert!(outcome.all_stopped);
        assert!(outcome.running_containers.is_empty());
        assert_eq!(runner.count("docker kill"), 0);
        assert!(runner.calls()[0].contains("label=com.docker.compose.project=media"));
    }

    #[tokio::test]
    async fn test_running_without_force() {
        let (runner, exec) = ScriptedRunner::new()
            .on("docker ps", CommandOutput::ok("media-web-1\nmedia-db-1\n"))
            .into_exec();

        let outcome = verify_containers_stopped(&exec, "media", false).await.unwrap();
        assert!(!outcome.all_stopped);
        assert_eq!(outcome.running_containers, vec!["media-web-1", "media-db-1"]);
        assert_eq!(runner.count("docker kill"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_kills_each_and_rechecks() {
        let (runner, exec) = ScriptedRunner::new()
            .on_sequence(
                "docker ps",
                vec![
                    CommandOutput::ok("media-web-1\nmedia-db-1\nmedia-cache-1\n"),
                    CommandOutput::ok(""),
                ],
            )
            .into_exec();

        let outcome = verify_containers_stopped(&exec, "media", true).await.unwrap();
        assert!(outcome.all_stopped);
        assert_eq!(runner.count("docker kill"), 3);
        assert_eq!(runner.count("docker ps"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_stop_reports_survivors() {
        let (runner, exec) = ScriptedRunner::new()
            .on("docker ps", CommandOutput::ok("media-web-1\nmedia-db-1\n"))
            .on("docker kill media-db-1", CommandOutput::failed(1, "permission denied"))
            .into_exec();

        let outcome = verify_containers_stopped(&exec, "media", true).await.unwrap();
        assert!(!outcome.all_stopped);
        assert_eq!(outcome.running_containers.len(), 2);
        // exactly one kill round, then one re-check
        assert_eq!(runner.count("docker kill"), 2);
        assert_eq!(runner.count("docker ps"), 2);
    }

    #[tokio::test]
    async fn test_listing_failure_is_error() {
        let (_runner, exec) = ScriptedRunner::new()
            .on("docker ps", CommandOutput::failed(1, "Cannot connect to the Docker daemon"))
            .into_exec();

        let err = verify_containers_stopped(&exec, "media", false).await.unwrap_err();
        assert!(err.to_string().contains("Cannot connect"));
    }

    #[tokio::test]
    async fn test_ensure_stopped_error_lists_containers() {
        let (_runner, exec) = ScriptedRunner::new()
            .on("docker ps", CommandOutput::ok("media-web-1\n"))
            .into_exec();

        let err = ensure_containers_stopped(&exec, "media", false).await.unwrap_err();
        match err {
            MigrationError::ContainersRunning { stack, containers } => {
                assert_eq!(stack, "media");
                assert_eq!(containers, vec!["media-web-1"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
