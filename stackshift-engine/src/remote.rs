//! Remote command execution
//!
//! Every operation in the engine talks to hosts through a [`RemoteExec`]: a
//! command prefix (normally an `ssh` invocation) plus a [`CommandRunner`] that
//! actually spawns processes. The runner is a trait so the engine can be
//! driven by scripted outputs in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stackshift_common::HostDescriptor;
use tokio::process::Command;

use crate::error::{MigrationError, Result};

/// Timeout used when a caller does not configure one
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured result of one command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stderr if present, otherwise stdout, trimmed
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Spawns a command given as an argument vector
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as local child processes
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| MigrationError::InvalidInput {
            reason: "empty command".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| MigrationError::Timeout {
                command: argv.join(" "),
                after: timeout,
            })?
            .map_err(|source| MigrationError::Spawn {
                program: program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote and join several values with spaces
pub fn shell_join<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| shell_quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Options shared by every ssh invocation
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=accept-new",
    "-o",
    "ConnectTimeout=10",
];

/// Build the argument vector that runs a shell command on `host` over ssh
pub fn ssh_prefix(host: &HostDescriptor) -> Vec<String> {
    let mut argv: Vec<String> = std::iter::once("ssh")
        .chain(SSH_OPTIONS.iter().copied())
        .map(String::from)
        .collect();

    argv.push("-p".to_string());
    argv.push(host.port.to_string());

    if let Some(key) = &host.identity_file {
        argv.push("-i".to_string());
        argv.push(key.to_string_lossy().into_owned());
    }

    argv.push(host.ssh_target());
    argv
}

/// Executes shell command lines on one host
#[derive(Clone)]
pub struct RemoteExec {
    label: String,
    prefix: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl std::fmt::Debug for RemoteExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExec")
            .field("label", &self.label)
            .field("prefix", &self.prefix)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteExec {
    pub fn new(label: impl Into<String>, prefix: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            label: label.into(),
            prefix,
            runner,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Executor for a host reached over ssh
    pub fn for_host(host: &HostDescriptor, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(host.id.clone(), ssh_prefix(host), runner)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host label used in log lines
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Run a shell command line, returning its output whatever the exit code
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut argv = self.prefix.clone();
        argv.push(command.to_string());
        log::debug!("[{}] $ {}", self.label, command);
        self.runner.run(&argv, self.timeout).await
    }

    /// Run a shell command line and fail on nonzero exit
    pub async fn run_checked(&self, command: &str) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        if !output.success() {
            return Err(MigrationError::RemoteCommand {
                command: command.to_string(),
                reason: output.error_text(),
            });
        }
        Ok(output)
    }

    /// True if the remote host has `tool` on its PATH
    pub async fn has_command(&self, tool: &str) -> bool {
        match self
            .run(&format!("command -v {} >/dev/null 2>&1", shell_quote(tool)))
            .await
        {
            Ok(output) => output.success(),
            Err(e) => {
                log::debug!("[{}] probe for {} failed: {}", self.label, tool, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted command runner for tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Rule {
        needle: String,
        responses: VecDeque<CommandOutput>,
    }

    /// Replies to commands by substring match. Rules are checked in the order
    /// they were added; a rule's responses are consumed in order and the last
    /// one repeats. Unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, needle: &str, output: CommandOutput) -> Self {
            self.on_sequence(needle, vec![output])
        }

        pub fn on_sequence(self, needle: &str, outputs: Vec<CommandOutput>) -> Self {
            self.rules
                .lock()
                .unwrap()
                .push(Rule {
                    needle: needle.to_string(),
                    responses: outputs.into(),
                });
            self
        }

        /// Every command line seen so far, prefix included
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, needle: &str) -> usize {
            self.calls().iter().filter(|c| c.contains(needle)).count()
        }

        pub fn into_exec(self) -> (Arc<ScriptedRunner>, RemoteExec) {
            let runner = Arc::new(self);
            let exec = RemoteExec::new(
                "test",
                vec!["ssh".to_string(), "deploy@test".to_string()],
                runner.clone(),
            );
            (runner, exec)
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, argv: &[String], _timeout: Duration) -> Result<CommandOutput> {
            let line = argv.join(" ");
            self.calls.lock().unwrap().push(line.clone());

            let mut rules = self.rules.lock().unwrap();
            for rule in rules.iter_mut() {
                if line.contains(&rule.needle) {
                    let output = if rule.responses.len() > 1 {
                        rule.responses.pop_front()
                    } else {
                        rule.responses.front().cloned()
                    };
                    return Ok(output.unwrap_or_default());
                }
            }
            Ok(CommandOutput::default())
        }
    }
}
