//! Migration manager for moving a Compose stack between hosts
//!
//! Handles:
//! - Working out which volumes and bind mounts a stack owns
//! - Making sure the source containers are down and the data has settled
//! - Archiving, shipping and unpacking the data
//! - Rewriting the Compose file for the target layout
//!
//! Steps run strictly in order and the first failure ends the migration.
//! Nothing already done is undone; an archive left behind on the source is
//! logged so it can be removed by hand.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use stackshift_common::validation::{validate_remote_path, validate_stack_name};
use stackshift_common::{
    ExcludeConfig, HostDescriptor, Settings, SyncMethod, SyncVerificationResult, TransferResult,
    VolumeInventory, format_bytes, format_duration,
};

use crate::archive::{
    cleanup_archive, create_volume_archive, extract_archive, get_volume_locations, verify_archive,
};
use crate::compose::{ComposeVolumes, engine_volume_name};
use crate::containers::{ensure_containers_stopped, verify_containers_stopped};
use crate::error::{MigrationError, Result};
use crate::remote::{CommandRunner, ProcessRunner, RemoteExec};
use crate::sync::SyncVerifier;
use crate::target::{
    RestoreDestination, RestoreEntry, STAGING_DIR_NAME, plan_target_paths,
    prepare_target_directories, restore_from_staging, stack_directory,
    update_compose_for_migration,
};
use crate::transfer::{TransferCoordinator, TransferOptions};

/// Caller choices for one migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Kill running source containers instead of refusing to migrate
    pub force_stop: bool,
    /// Only inspect the source and preview the rewritten Compose file
    pub dry_run: bool,
    pub sync_method: SyncMethod,
    /// Compress the rsync stream
    pub compress: bool,
    /// Archive exclusions on top of the built-in ones
    pub extra_exclusions: Vec<String>,
    /// Delete the archives from both hosts once unpacked
    pub cleanup_archives: bool,
    /// Skip filesystem sync verification
    pub skip_sync: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            force_stop: false,
            dry_run: false,
            sync_method: SyncMethod::Auto,
            compress: true,
            extra_exclusions: Vec::new(),
            cleanup_archives: true,
            skip_sync: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub source: HostDescriptor,
    pub target: HostDescriptor,
    pub stack_name: String,
    pub compose_content: String,
    pub options: MigrationOptions,
}

/// Time spent in one migration step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: &'static str,
    pub elapsed: Duration,
}

/// What a migration did
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub stack_name: String,
    pub source_host: String,
    pub target_host: String,
    pub started_at: DateTime<Utc>,
    pub inventory: VolumeInventory,
    /// Volume name or bind source -> path on the source host
    pub volume_paths: BTreeMap<String, String>,
    /// Archive path on the source host
    pub archive_path: Option<String>,
    pub transfer: Option<TransferResult>,
    pub sync: Option<SyncVerificationResult>,
    pub updated_compose: String,
    pub target_dir: String,
    pub dry_run: bool,
    pub duration: Duration,
    pub steps: Vec<StepRecord>,
}

impl MigrationReport {
    fn new(request: &MigrationRequest, target_dir: String) -> Self {
        Self {
            stack_name: request.stack_name.clone(),
            source_host: request.source.id.clone(),
            target_host: request.target.id.clone(),
            started_at: Utc::now(),
            inventory: VolumeInventory::default(),
            volume_paths: BTreeMap::new(),
            archive_path: None,
            transfer: None,
            sync: None,
            updated_compose: request.compose_content.clone(),
            target_dir,
            dry_run: request.options.dry_run,
            duration: Duration::ZERO,
            steps: Vec::new(),
        }
    }

    fn record(&mut self, name: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        log::debug!("Step '{}' finished in {}", name, format_duration(elapsed));
        self.steps.push(StepRecord { name, elapsed });
    }
}

/// Source paths resolved in step 3, split by how they are restored
#[derive(Debug, Default)]
struct ResolvedPaths {
    /// Absolute bind sources
    binds: Vec<String>,
    /// Engine volume name -> mount point on the source
    volumes: BTreeMap<String, String>,
}

impl ResolvedPaths {
    fn all(&self) -> Vec<String> {
        self.binds
            .iter()
            .chain(self.volumes.values())
            .cloned()
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.volumes.is_empty()
    }
}

/// Drives stack migrations between hosts
#[derive(Clone)]
pub struct MigrationManager {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    verifier: SyncVerifier,
}

impl std::fmt::Debug for MigrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationManager")
            .field("settings", &self.settings)
            .finish()
    }
}

impl MigrationManager {
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>) -> Self {
        let verifier = SyncVerifier::new(settings.sync.clone());
        Self {
            settings,
            runner,
            verifier,
        }
    }

    /// Manager that runs real ssh processes
    pub fn with_process_runner(settings: Settings) -> Self {
        Self::new(settings, Arc::new(ProcessRunner))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Executor for short commands on `host`
    pub fn exec(&self, host: &HostDescriptor) -> RemoteExec {
        RemoteExec::for_host(host, self.runner.clone()).with_timeout(self.settings.command_timeout())
    }

    fn coordinator(&self) -> TransferCoordinator {
        TransferCoordinator::new(self.runner.clone(), self.settings.transfer_timeout())
    }

    fn appdata_path<'a>(&'a self, host: &'a HostDescriptor) -> &'a str {
        host.appdata_path
            .as_deref()
            .unwrap_or(&self.settings.appdata_path)
    }

    /// Migrate one stack and log a one-line JSON summary of the outcome
    pub async fn migrate_stack(&self, request: MigrationRequest) -> Result<MigrationReport> {
        let started = Instant::now();
        let result = self.run_migration(&request, started).await;

        let summary = match &result {
            Ok(report) => json!({
                "stack": report.stack_name,
                "source": report.source_host,
                "target": report.target_host,
                "dry_run": report.dry_run,
                "success": true,
                "duration_secs": report.duration.as_secs_f64(),
                "paths": report.volume_paths.len(),
                "files_transferred": report.transfer.as_ref().map(|t| t.stats.files_transferred),
                "bytes_transferred": report.transfer.as_ref().map(|t| t.stats.total_size),
                "sync_method": report.sync.as_ref().map(|s| s.method),
                "target_dir": report.target_dir,
            }),
            Err(e) => json!({
                "stack": request.stack_name,
                "source": request.source.id,
                "target": request.target.id,
                "dry_run": request.options.dry_run,
                "success": false,
                "duration_secs": started.elapsed().as_secs_f64(),
                "error_kind": e.kind(),
                "error": e.to_string(),
            }),
        };
        log::info!(target: "summary", "{}", summary);

        result
    }

    async fn run_migration(&self, request: &MigrationRequest, started: Instant) -> Result<MigrationReport> {
        let options = &request.options;
        let stack = request.stack_name.as_str();

        validate_stack_name(stack).map_err(|reason| MigrationError::InvalidInput { reason })?;
        validate_remote_path(&self.settings.temp_dir).map_err(|reason| MigrationError::InvalidInput {
            reason: format!("temp_dir: {reason}"),
        })?;

        let target_dir = stack_directory(self.appdata_path(&request.target), stack);
        let mut report = MigrationReport::new(request, target_dir.clone());

        let source = self.exec(&request.source);
        let target = self.exec(&request.target);

        log::info!(
            "Migrating stack '{}' from {} to {}{}",
            stack,
            request.source.id,
            request.target.id,
            if options.dry_run { " (dry run)" } else { "" }
        );

        // 1. What does the stack own?
        let step = Instant::now();
        let parsed = ComposeVolumes::parse(&request.compose_content)?;
        report.inventory = parsed.inventory;
        report.record("parse_compose", step);

        // 2. Source containers must be down
        let step = Instant::now();
        if options.dry_run {
            let outcome = verify_containers_stopped(&source, stack, false).await?;
            if !outcome.all_stopped {
                log::warn!(
                    "Dry run: {} container(s) would have to be stopped first",
                    outcome.running_containers.len()
                );
            }
        } else {
            ensure_containers_stopped(&source, stack, options.force_stop).await?;
        }
        report.record("verify_stopped", step);

        // 3. Resolve real source paths
        let step = Instant::now();
        let resolved = self.resolve_paths(&source, stack, &report.inventory).await;
        let planned = plan_target_paths(&resolved.binds, &target_dir)?;

        for bind in &resolved.binds {
            report.volume_paths.insert(bind.clone(), bind.clone());
        }
        for (name, path) in &resolved.volumes {
            report.volume_paths.insert(name.clone(), path.clone());
        }

        let missing: Vec<String> = self
            .verifier
            .verify_path_accessibility(&source, &resolved.all())
            .await
            .into_iter()
            .filter(|(_, accessible)| !accessible)
            .map(|(path, _)| path)
            .collect();
        if !missing.is_empty() {
            if options.dry_run {
                log::warn!("Dry run: source paths not accessible: {}", missing.join(", "));
            } else {
                return Err(MigrationError::VolumeExtraction {
                    reason: format!("source paths not accessible: {}", missing.join(", ")),
                });
            }
        }
        report.record("resolve_paths", step);

        if options.dry_run {
            report.updated_compose =
                update_compose_for_migration(&request.compose_content, &resolved.binds, &target_dir);
            report.duration = started.elapsed();
            log::info!(
                "Dry run complete: {} path(s) would move to {}:{}",
                report.volume_paths.len(),
                request.target.id,
                target_dir
            );
            return Ok(report);
        }

        let paths = resolved.all();
        let mut target_archive = None;

        if resolved.is_empty() {
            log::info!("Stack '{}' has no data to move", stack);
        } else {
            // 4. Let pending writes land
            if options.skip_sync {
                log::warn!("Skipping filesystem sync verification");
            } else {
                let step = Instant::now();
                let sync = self
                    .verifier
                    .wait_for_sync(&source, &paths, options.sync_method)
                    .await?;
                report.sync = Some(sync);
                report.record("wait_for_sync", step);
            }

            // 5. Archive on the source and push it to the target
            let step = Instant::now();
            let coordinator = self.coordinator();
            let source_long = coordinator.exec_for(&request.source);

            let exclusions = ExcludeConfig::with_extra(
                request
                    .source
                    .exclude
                    .iter()
                    .chain(options.extra_exclusions.iter()),
            );
            let archive = create_volume_archive(
                &source_long,
                &paths,
                stack,
                &self.settings.temp_dir,
                &exclusions,
            )
            .await?;
            report.archive_path = Some(archive.clone());

            let shipped = self
                .ship_archive(&coordinator, &source_long, request, &archive)
                .await;
            let (transfer, remote_archive) = match shipped {
                Ok(shipped) => shipped,
                Err(e) => {
                    log_leftover_archives(request, Some(&archive), None);
                    return Err(e);
                }
            };
            log::info!(
                "Shipped {} in {}",
                format_bytes(transfer.stats.total_size),
                format_duration(step.elapsed())
            );
            report.transfer = Some(transfer);
            target_archive = Some(remote_archive);
            report.record("archive_and_transfer", step);
        }

        // 6-8. Lay the data out on the target
        let placed = self
            .place_on_target(
                request,
                &target,
                &resolved,
                &planned,
                target_archive.as_deref(),
                &mut report,
            )
            .await;
        if let Err(e) = placed {
            log_leftover_archives(
                request,
                report.archive_path.as_deref(),
                target_archive.as_deref(),
            );
            return Err(e);
        }

        // 9. Cleanup
        if let Some(remote_archive) = target_archive.filter(|_| options.cleanup_archives) {
            let step = Instant::now();
            let leftovers = [
                (&source, &request.source, report.archive_path.clone()),
                (&target, &request.target, Some(remote_archive)),
            ];
            for (exec, host, archive) in leftovers {
                let Some(archive) = archive else { continue };
                if let Err(e) = cleanup_archive(exec, &archive).await {
                    log::warn!("Failed to remove {} from {}: {}", archive, host.id, e);
                }
            }
            report.record("cleanup", step);
        }

        report.duration = started.elapsed();
        log::info!(
            "Stack '{}' migrated to {}:{} in {}",
            stack,
            request.target.id,
            target_dir,
            format_duration(report.duration)
        );
        Ok(report)
    }

    /// Create the stack directory, rewrite the Compose file and unpack the
    /// shipped archive into place
    async fn place_on_target(
        &self,
        request: &MigrationRequest,
        target: &RemoteExec,
        resolved: &ResolvedPaths,
        planned: &BTreeMap<String, String>,
        target_archive: Option<&str>,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let stack = request.stack_name.as_str();

        // 6. Target directory
        let step = Instant::now();
        let target_dir =
            prepare_target_directories(target, self.appdata_path(&request.target), stack).await?;
        report.record("prepare_target", step);

        // 7. Compose rewrite
        let step = Instant::now();
        report.updated_compose =
            update_compose_for_migration(&request.compose_content, &resolved.binds, &target_dir);
        report.record("rewrite_compose", step);

        // 8. Unpack into place
        let Some(remote_archive) = target_archive else {
            return Ok(());
        };
        let step = Instant::now();
        let target_long = self.coordinator().exec_for(&request.target);
        let staging = format!("{target_dir}/{STAGING_DIR_NAME}");

        extract_archive(&target_long, remote_archive, &staging).await?;

        let mut entries: Vec<RestoreEntry> = resolved
            .binds
            .iter()
            .filter_map(|bind| {
                planned.get(bind).map(|dest| RestoreEntry {
                    source_path: bind.clone(),
                    destination: RestoreDestination::Path(dest.clone()),
                })
            })
            .collect();
        entries.extend(resolved.volumes.iter().map(|(name, path)| RestoreEntry {
            source_path: path.clone(),
            destination: RestoreDestination::Volume(name.clone()),
        }));

        restore_from_staging(&target_long, &staging, &entries).await?;
        report.record("restore", step);
        Ok(())
    }

    /// Named volume mount points and absolute bind sources on the source host
    async fn resolve_paths(
        &self,
        source: &RemoteExec,
        stack: &str,
        inventory: &VolumeInventory,
    ) -> ResolvedPaths {
        let mut resolved = ResolvedPaths::default();

        for bind in &inventory.bind_mounts {
            if bind.starts_with('/') {
                resolved.binds.push(bind.clone());
            } else {
                log::warn!("Skipping relative bind mount {} (not migrated)", bind);
            }
        }

        let engine_names: Vec<String> = inventory
            .named_volumes
            .iter()
            .map(|volume| engine_volume_name(stack, volume, inventory))
            .collect();
        resolved.volumes = get_volume_locations(source, &engine_names).await;

        resolved
    }

    /// Check the archive and rsync it into the target's temp dir. Returns the
    /// transfer result and the archive path on the target.
    async fn ship_archive(
        &self,
        coordinator: &TransferCoordinator,
        source_long: &RemoteExec,
        request: &MigrationRequest,
        archive: &str,
    ) -> Result<(TransferResult, String)> {
        verify_archive(source_long, archive).await?;

        let temp_dir = self.settings.temp_dir.trim_end_matches('/');
        let file_name = archive.rsplit('/').next().unwrap_or(archive);
        let remote_archive = format!("{temp_dir}/{file_name}");

        let transfer = coordinator
            .transfer_with_rsync(
                &request.source,
                &request.target,
                archive,
                &format!("{temp_dir}/"),
                TransferOptions {
                    compress: request.options.compress,
                    delete: false,
                    dry_run: false,
                },
            )
            .await?;

        Ok((transfer, remote_archive))
    }
}

/// Nothing is rolled back, so tell the operator which archives remain
fn log_leftover_archives(
    request: &MigrationRequest,
    source_archive: Option<&str>,
    target_archive: Option<&str>,
) {
    if let Some(archive) = source_archive {
        log::error!(
            "Archive {} was left on {}; remove it once the failure is resolved",
            archive,
            request.source.id
        );
    }
    if let Some(archive) = target_archive {
        log::error!("Archive copy {} was left on {}", archive, request.target.id);
    }
}
