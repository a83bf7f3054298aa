// stackshift - move Compose stacks and their data between Docker hosts

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use stackshift_common::{
    HostsFile, StackshiftConfig, SyncMethod, format_bytes, format_duration,
};
use stackshift_engine::{
    MigrationManager, MigrationOptions, MigrationRequest, ProcessRunner, RemoteExec, SyncVerifier,
    parse_compose_volumes, verify_containers_stopped,
};

#[derive(Parser)]
#[command(name = "stackshift")]
#[command(about = "Move Compose stacks and their data between Docker hosts", long_about = None)]
struct Cli {
    /// Hosts file (defaults to $STACKSHIFT_CONFIG or ~/.config/stackshift/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate a stack from one host to another
    Migrate {
        /// Source host name
        #[arg(long)]
        source: String,

        /// Target host name
        #[arg(long)]
        target: String,

        /// Stack (Compose project) name
        #[arg(long)]
        stack: String,

        /// Path to the stack's compose file
        #[arg(long)]
        compose: PathBuf,

        /// Kill running source containers
        #[arg(long)]
        force_stop: bool,

        /// Inspect the source and preview the rewritten compose file only
        #[arg(long)]
        dry_run: bool,

        /// auto, sync, checksum, size or simple
        #[arg(long, default_value = "auto")]
        sync_method: SyncMethod,

        /// Skip filesystem sync verification
        #[arg(long)]
        skip_sync: bool,

        /// Send the archive uncompressed over the wire
        #[arg(long)]
        no_compress: bool,

        /// Extra archive exclusion pattern (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Leave the archives on both hosts
        #[arg(long)]
        keep_archives: bool,

        /// Write the rewritten compose file here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the volumes a compose file declares, as JSON
    Volumes {
        /// Path to the compose file
        #[arg(long)]
        compose: PathBuf,
    },

    /// Wait until paths on a host stop changing
    VerifySync {
        /// Host name
        #[arg(long)]
        host: String,

        /// Paths on the host
        #[arg(required = true)]
        paths: Vec<String>,

        /// auto, sync, checksum, size or simple
        #[arg(long, default_value = "auto")]
        method: SyncMethod,
    },

    /// Check that no container of a stack is running
    CheckStopped {
        /// Host name
        #[arg(long)]
        host: String,

        /// Stack (Compose project) name
        #[arg(long)]
        stack: String,

        /// Kill running containers, then check again
        #[arg(long)]
        force_stop: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    if let Err(e) = run(cli).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn load_hosts(config_path: Option<PathBuf>) -> Result<HostsFile> {
    let mut config = StackshiftConfig::new();
    if let Some(path) = config_path {
        config.config_file = path;
    }
    log::debug!("Hosts file: {}", config.config_file.display());
    config.load_hosts()
}

fn read_compose(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read compose file {}", path.display()))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Volumes { compose } => {
            let inventory = parse_compose_volumes(&read_compose(&compose)?)?;
            println!("{}", serde_json::to_string_pretty(&inventory)?);
        }

        Commands::Migrate {
            source,
            target,
            stack,
            compose,
            force_stop,
            dry_run,
            sync_method,
            skip_sync,
            no_compress,
            exclude,
            keep_archives,
            output,
        } => {
            let hosts = load_hosts(cli.config)?;
            let source = hosts.host(&source)?.clone();
            let target = hosts.host(&target)?.clone();
            if source.id == target.id {
                bail!("Source and target are the same host ({})", source.id);
            }

            let manager = MigrationManager::with_process_runner(hosts.settings.clone());
            let report = manager
                .migrate_stack(MigrationRequest {
                    source,
                    target,
                    stack_name: stack,
                    compose_content: read_compose(&compose)?,
                    options: MigrationOptions {
                        force_stop,
                        dry_run,
                        sync_method,
                        compress: !no_compress,
                        extra_exclusions: exclude,
                        cleanup_archives: !keep_archives,
                        skip_sync,
                    },
                })
                .await
                .context("Migration failed")?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &report.updated_compose).with_context(|| {
                        format!("Failed to write compose file {}", path.display())
                    })?;
                    log::info!("Wrote updated compose file to {}", path.display());
                }
                None => print!("{}", report.updated_compose),
            }

            if let Some(transfer) = &report.transfer {
                log::info!(
                    "{} file(s), {} transferred",
                    transfer.stats.files_transferred,
                    format_bytes(transfer.stats.total_size)
                );
            }
            log::info!("Finished in {}", format_duration(report.duration));
        }

        Commands::VerifySync { host, paths, method } => {
            let hosts = load_hosts(cli.config)?;
            let host = hosts.host(&host)?;
            let exec = RemoteExec::for_host(host, Arc::new(ProcessRunner))
                .with_timeout(hosts.settings.command_timeout());

            let verifier = SyncVerifier::new(hosts.settings.sync.clone());
            let result = verifier.wait_for_sync(&exec, &paths, method).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::CheckStopped {
            host,
            stack,
            force_stop,
        } => {
            let hosts = load_hosts(cli.config)?;
            let host = hosts.host(&host)?;
            let exec = RemoteExec::for_host(host, Arc::new(ProcessRunner))
                .with_timeout(hosts.settings.command_timeout());

            let outcome = verify_containers_stopped(&exec, &stack, force_stop).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.all_stopped {
                bail!(
                    "{} container(s) of stack '{}' still running",
                    outcome.running_containers.len(),
                    stack
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_migrate() {
        let cli = Cli::try_parse_from([
            "stackshift",
            "migrate",
            "--source",
            "alpha",
            "--target",
            "beta",
            "--stack",
            "media",
            "--compose",
            "docker-compose.yml",
            "--sync-method",
            "checksum",
            "-e",
            "*.sqlite-wal",
            "-e",
            "cache/",
            "--keep-archives",
        ])
        .unwrap();

        match cli.command {
            Commands::Migrate {
                sync_method,
                exclude,
                keep_archives,
                force_stop,
                ..
            } => {
                assert_eq!(sync_method, SyncMethod::Checksum);
                assert_eq!(exclude, vec!["*.sqlite-wal", "cache/"]);
                assert!(keep_archives);
                assert!(!force_stop);
            }
            _ => panic!("expected migrate"),
        }
    }

    #[test]
    fn test_rejects_unknown_sync_method() {
        let parsed = Cli::try_parse_from([
            "stackshift",
            "verify-sync",
            "--host",
            "alpha",
            "--method",
            "fsync",
            "/srv/data",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_rejects_sync_method_none() {
        let parsed = Cli::try_parse_from([
            "stackshift",
            "migrate",
            "--source",
            "alpha",
            "--target",
            "beta",
            "--stack",
            "media",
            "--compose",
            "docker-compose.yml",
            "--sync-method",
            "none",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_verify_sync_requires_paths() {
        assert!(Cli::try_parse_from(["stackshift", "verify-sync", "--host", "alpha"]).is_err());
    }
}
