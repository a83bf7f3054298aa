//! Filesystem sync verification
//!
//! Before data leaves a host we want some assurance that nothing is still
//! being written to it. There is no portable way to ask a remote system
//! "are all writes flushed?", so several strategies are tried depending on
//! what tools the host has:
//!
//! - `sync`: call `sync` and confirm the paths are still accessible
//! - `checksum`: sampled content checksums must repeat across rounds
//! - `size`: directory sizes must repeat across rounds
//! - `simple`: a few blind `sync` calls, used as a last resort
//!
//! Polling strategies share one retry loop with exponential backoff bounded
//! by a wall-clock budget.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use stackshift_common::{SyncMethod, SyncSettings, SyncVerificationResult};
use tokio::time::Instant;

use crate::error::FilesystemSyncError;
use crate::remote::{RemoteExec, shell_join, shell_quote};

/// At most this many paths are measured by the checksum and size strategies
pub const MAX_VERIFIED_PATHS: usize = 10;

/// Files sampled per path for the rolling checksum
pub const CHECKSUM_SAMPLE_FILES: usize = 10;

/// Consecutive matching checksum readings required
const CHECKSUM_STABLE_MATCHES: u32 = 2;

/// Consecutive matching size readings required. Size is a weaker signal
/// than content, so it needs more confirmation.
const SIZE_STABLE_MATCHES: u32 = 3;

const SIMPLE_SYNC_CALLS: u32 = 3;
const SIMPLE_SYNC_INTERVAL: Duration = Duration::from_secs(1);
const SIMPLE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Exponential backoff between polling rounds
#[derive(Debug, Clone)]
struct Backoff {
    delay: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay = Duration::try_from_secs_f64(self.delay.as_secs_f64() * self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        current
    }
}

/// Retry state of one polling run: elapsed budget, attempt count and the
/// current backoff delay.
#[derive(Debug)]
struct PollState {
    started: Instant,
    budget: Duration,
    attempts: u32,
    backoff: Backoff,
}

impl PollState {
    fn new(settings: &SyncSettings) -> Self {
        Self {
            started: Instant::now(),
            budget: settings.max_wait_time(),
            attempts: 0,
            backoff: Backoff {
                delay: settings.initial_delay(),
                max: settings.max_delay(),
                factor: settings.backoff_factor,
            },
        }
    }

    /// Start another round if the budget allows it
    fn begin_round(&mut self) -> bool {
        if self.started.elapsed() >= self.budget {
            return false;
        }
        self.attempts += 1;
        true
    }

    async fn pause(&mut self) {
        tokio::time::sleep(self.backoff.next_delay()).await;
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Counts consecutive identical readings
#[derive(Debug)]
struct StabilityTracker {
    previous: Option<String>,
    matches: u32,
    required: u32,
}

impl StabilityTracker {
    fn new(required: u32) -> Self {
        Self {
            previous: None,
            matches: 0,
            required,
        }
    }

    /// Record a reading, returns true once enough consecutive readings matched
    fn observe(&mut self, reading: String) -> bool {
        if self.previous.as_deref() == Some(reading.as_str()) {
            self.matches += 1;
        } else {
            self.matches = 0;
            self.previous = Some(reading);
        }
        self.matches >= self.required
    }

    /// Forget progress after a failed measurement
    fn reset(&mut self) {
        self.previous = None;
        self.matches = 0;
    }
}

/// Hash a per-path reading map into one fingerprint
fn fingerprint(readings: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, value) in readings {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// Parse `path<TAB>value` lines
fn parse_readings(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (path, value) = line.split_once('\t')?;
            Some((path.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Confirms remote paths have stopped changing
#[derive(Debug, Clone)]
pub struct SyncVerifier {
    settings: SyncSettings,
}

impl Default for SyncVerifier {
    fn default() -> Self {
        Self::new(SyncSettings::default())
    }
}

impl SyncVerifier {
    pub fn new(settings: SyncSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Wait until `paths` are stable on the remote host
    ///
    /// An empty path list succeeds immediately with method `none`. Otherwise
    /// `method` must be `auto` or a concrete strategy. A strategy that does
    /// not converge within the budget returns an error; there is no
    /// unsuccessful `Ok` result.
    pub async fn wait_for_sync(
        &self,
        remote: &RemoteExec,
        paths: &[String],
        method: SyncMethod,
    ) -> Result<SyncVerificationResult, FilesystemSyncError> {
        if paths.is_empty() {
            return Ok(SyncVerificationResult::nothing_to_verify());
        }

        let (method, checksum_tool) = match method {
            SyncMethod::Auto => self.detect_method(remote).await,
            SyncMethod::Checksum => (SyncMethod::Checksum, self.checksum_tool(remote).await),
            SyncMethod::None => return Err(unsupported_method(method)),
            other => (other, None),
        };

        log::info!(
            "[{}] Verifying filesystem sync of {} path(s) using {}",
            remote.label(),
            paths.len(),
            method
        );

        let result = match method {
            SyncMethod::Sync => self.sync_polling(remote, paths).await,
            SyncMethod::Checksum => self.checksum_stability(remote, paths, checksum_tool).await,
            SyncMethod::Size => self.size_stability(remote, paths).await,
            SyncMethod::Simple => Ok(self.simple_fallback(remote).await),
            SyncMethod::None | SyncMethod::Auto => Err(unsupported_method(method)),
        };

        match &result {
            Ok(r) => log::info!(
                "[{}] Filesystem stable ({}, {} attempts, {:?})",
                remote.label(),
                r.method,
                r.attempts,
                r.duration
            ),
            Err(e) => log::error!("[{}] {}", remote.label(), e),
        }

        result
    }

    /// Check that each path exists on the remote host
    pub async fn verify_path_accessibility(
        &self,
        remote: &RemoteExec,
        paths: &[String],
    ) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for path in paths {
            let accessible = match remote.run(&format!("test -e {}", shell_quote(path))).await {
                Ok(output) => output.success(),
                Err(e) => {
                    log::warn!("[{}] Could not check {}: {}", remote.label(), path, e);
                    false
                }
            };
            results.insert(path.clone(), accessible);
        }
        results
    }

    /// Pick the richest strategy the host supports, with the checksum tool
    /// found along the way
    async fn detect_method(&self, remote: &RemoteExec) -> (SyncMethod, Option<&'static str>) {
        if remote.has_command("sync").await {
            return (SyncMethod::Sync, None);
        }
        match self.checksum_tool(remote).await {
            Some(tool) => (SyncMethod::Checksum, Some(tool)),
            None => (SyncMethod::Size, None),
        }
    }

    async fn checksum_tool(&self, remote: &RemoteExec) -> Option<&'static str> {
        for tool in ["md5sum", "sha256sum"] {
            if remote.has_command(tool).await {
                return Some(tool);
            }
        }
        None
    }

    fn failure(
        &self,
        method: SyncMethod,
        poll: &PollState,
        details: String,
    ) -> FilesystemSyncError {
        FilesystemSyncError {
            method,
            duration: poll.elapsed(),
            attempts: poll.attempts,
            details,
        }
    }

    fn success(
        &self,
        method: SyncMethod,
        poll: &PollState,
        details: serde_json::Value,
    ) -> SyncVerificationResult {
        SyncVerificationResult {
            success: true,
            duration: poll.elapsed(),
            attempts: poll.attempts,
            method,
            details,
        }
    }

    async fn sync_polling(
        &self,
        remote: &RemoteExec,
        paths: &[String],
    ) -> Result<SyncVerificationResult, FilesystemSyncError> {
        let mut poll = PollState::new(&self.settings);
        let access_check = format!("ls -d {} >/dev/null", shell_join(paths));
        let mut last_error = String::from("no attempt completed");

        while poll.begin_round() {
            match remote.run("sync").await {
                Ok(output) if output.success() => match remote.run(&access_check).await {
                    Ok(output) if output.success() => {
                        return Ok(self.success(
                            SyncMethod::Sync,
                            &poll,
                            json!({ "message": "sync completed and paths accessible", "paths": paths.len() }),
                        ));
                    }
                    Ok(output) => {
                        last_error = format!("paths not accessible: {}", output.error_text());
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Ok(output) => last_error = format!("sync failed: {}", output.error_text()),
                Err(e) => last_error = e.to_string(),
            }

            log::debug!(
                "[{}] sync round {} failed: {}",
                remote.label(),
                poll.attempts,
                last_error
            );
            poll.pause().await;
        }

        Err(self.failure(
            SyncMethod::Sync,
            &poll,
            format!(
                "sync verification timed out after {:?}: {}",
                self.settings.max_wait_time(),
                last_error
            ),
        ))
    }

    fn capped<'a>(&self, remote: &RemoteExec, paths: &'a [String]) -> &'a [String] {
        if paths.len() > MAX_VERIFIED_PATHS {
            log::warn!(
                "[{}] Measuring only the first {} of {} paths",
                remote.label(),
                MAX_VERIFIED_PATHS,
                paths.len()
            );
            &paths[..MAX_VERIFIED_PATHS]
        } else {
            paths
        }
    }

    async fn checksum_stability(
        &self,
        remote: &RemoteExec,
        paths: &[String],
        tool: Option<&str>,
    ) -> Result<SyncVerificationResult, FilesystemSyncError> {
        let paths = self.capped(remote, paths);
        let tool = tool.unwrap_or("md5sum");
        let command = checksum_command(paths, tool);
        self.poll_stability(remote, paths, &command, SyncMethod::Checksum, CHECKSUM_STABLE_MATCHES)
            .await
    }

    async fn size_stability(
        &self,
        remote: &RemoteExec,
        paths: &[String],
    ) -> Result<SyncVerificationResult, FilesystemSyncError> {
        let paths = self.capped(remote, paths);
        let command = size_command(paths);
        let result = self
            .poll_stability(remote, paths, &command, SyncMethod::Size, SIZE_STABLE_MATCHES)
            .await?;

        match remote.run("sync").await {
            Ok(output) if output.success() => {}
            Ok(output) => log::warn!(
                "[{}] Final sync after size stability failed: {}",
                remote.label(),
                output.error_text()
            ),
            Err(e) => log::warn!("[{}] Final sync after size stability failed: {}", remote.label(), e),
        }

        Ok(result)
    }

    /// Shared loop of the checksum and size strategies
    async fn poll_stability(
        &self,
        remote: &RemoteExec,
        paths: &[String],
        command: &str,
        method: SyncMethod,
        required: u32,
    ) -> Result<SyncVerificationResult, FilesystemSyncError> {
        let mut poll = PollState::new(&self.settings);
        let mut tracker = StabilityTracker::new(required);
        let mut last_problem: Option<String> = None;

        while poll.begin_round() {
            let reading = match remote.run(command).await {
                Ok(output) if output.success() => {
                    let readings = parse_readings(&output.stdout);
                    let missing: Vec<&String> = paths
                        .iter()
                        .filter(|p| readings.get(*p).is_none_or(|v| v.is_empty()))
                        .collect();
                    if missing.is_empty() {
                        Ok(readings)
                    } else {
                        Err(format!("no reading for {}", shell_join(missing)))
                    }
                }
                Ok(output) => Err(output.error_text()),
                Err(e) => Err(e.to_string()),
            };

            match reading {
                Ok(readings) => {
                    last_problem = None;
                    let print = fingerprint(&readings);
                    log::debug!(
                        "[{}] {} round {}: {} (matches {}/{})",
                        remote.label(),
                        method,
                        poll.attempts,
                        &print[..12],
                        tracker.matches,
                        required
                    );
                    if tracker.observe(print.clone()) {
                        return Ok(self.success(
                            method,
                            &poll,
                            json!({
                                "message": format!("{} stable across {} consecutive readings", method, required + 1),
                                "fingerprint": print,
                                "readings": readings,
                            }),
                        ));
                    }
                }
                Err(problem) => {
                    log::debug!(
                        "[{}] {} round {} failed: {}",
                        remote.label(),
                        method,
                        poll.attempts,
                        problem
                    );
                    tracker.reset();
                    last_problem = Some(problem);
                }
            }

            poll.pause().await;
        }

        let details = match last_problem {
            Some(problem) => format!(
                "{} readings did not stabilize within {:?}: {}",
                method,
                self.settings.max_wait_time(),
                problem
            ),
            None => format!(
                "{} readings did not stabilize within {:?}",
                method,
                self.settings.max_wait_time()
            ),
        };
        Err(self.failure(method, &poll, details))
    }

    async fn simple_fallback(&self, remote: &RemoteExec) -> SyncVerificationResult {
        let started = Instant::now();
        for round in 1..=SIMPLE_SYNC_CALLS {
            if let Err(e) = remote.run("sync").await {
                log::debug!("[{}] blind sync {} failed: {}", remote.label(), round, e);
            }
            tokio::time::sleep(SIMPLE_SYNC_INTERVAL).await;
        }
        tokio::time::sleep(SIMPLE_SETTLE_DELAY).await;

        SyncVerificationResult {
            success: true,
            duration: started.elapsed(),
            attempts: SIMPLE_SYNC_CALLS,
            method: SyncMethod::Simple,
            details: json!({ "message": "blind sync fallback, stability not measured" }),
        }
    }
}

/// `none` describes an empty path list and cannot be requested
fn unsupported_method(method: SyncMethod) -> FilesystemSyncError {
    FilesystemSyncError {
        method,
        duration: Duration::ZERO,
        attempts: 0,
        details: format!("'{method}' is not a verification strategy; use --skip-sync to skip the check"),
    }
}

/// One `path<TAB>checksum` line per path. The checksum covers the first few
/// files (sorted) under the path, hashed again into a single digest.
fn checksum_command(paths: &[String], tool: &str) -> String {
    format!(
        "for p in {paths}; do printf '%s\\t%s\\n' \"$p\" \"$(find \"$p\" -type f -print0 2>/dev/null | sort -z | head -z -n {limit} | xargs -0 -r {tool} 2>/dev/null | {tool} | cut -d' ' -f1)\"; done",
        paths = shell_join(paths),
        limit = CHECKSUM_SAMPLE_FILES,
        tool = tool,
    )
}

/// One `path<TAB>bytes` line per path
fn size_command(paths: &[String]) -> String {
    format!(
        "for p in {}; do printf '%s\\t%s\\n' \"$p\" \"$(du -sb \"$p\" 2>/dev/null | cut -f1)\"; done",
        shell_join(paths)
    )
}
