//! Base command execution abstraction
//!
//! Provides the foundational trait for executing external commands, enabling
//! dependency injection for testing. A non-zero exit status is never an error
//! at this layer: callers inspect [`CommandOutput`] themselves.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(status_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Errors raised only when the process could not be run at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command execution failed: {message}")]
    ExecutionFailed { message: String },
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("IO error: {message}")]
    Io { message: String },
}

/// Trait for executing external commands
///
/// Every component that talks to the version-control CLI or the review CLI
/// goes through this trait, so a scripted executor can stand in for both.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        working_dir: &Path,
    ) -> Result<CommandOutput, CommandError>;
}

/// Real implementation backed by `tokio::process::Command`
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandExecutor {
    timeout: Option<Duration>,
}

impl ProcessCommandExecutor {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        working_dir: &Path,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            // Never block on credential prompts
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GH_PROMPT_DISABLED", "1")
            .kill_on_drop(true);

        tracing::debug!(program, args = ?args, dir = %working_dir.display(), "Executing command");

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| CommandError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })?,
            None => command.output().await,
        }
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CommandError::CommandNotFound {
                    command: program.to_string(),
                }
            } else {
                CommandError::Io {
                    message: e.to_string(),
                }
            }
        })?;

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Scripted executor for tests and simulations.
///
/// Responses are keyed by `"program arg1 arg2 ..."`. Exact keys win over
/// prefix rules; the longest matching prefix wins among prefix rules. Each key
/// holds a queue of responses and the last one repeats once the queue drains.
/// Every invocation is recorded so tests can assert on ordering.
pub struct ScriptedCommandExecutor {
    exact: Mutex<HashMap<String, VecDeque<Result<CommandOutput, CommandError>>>>,
    prefixes: Mutex<Vec<(String, VecDeque<Result<CommandOutput, CommandError>>)>>,
    fallback: Option<CommandOutput>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCommandExecutor {
    /// Unmatched commands fail with `CommandNotFound`.
    pub fn new() -> Self {
        Self {
            exact: Mutex::new(HashMap::new()),
            prefixes: Mutex::new(Vec::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Unmatched commands succeed with empty output.
    pub fn permissive() -> Self {
        Self {
            fallback: Some(CommandOutput::ok("")),
            ..Self::new()
        }
    }

    pub fn expect_command(self, program: &str, args: &[&str], response: CommandOutput) -> Self {
        self.push_exact(Self::key(program, args), Ok(response));
        self
    }

    pub fn expect_error(self, program: &str, args: &[&str], error: CommandError) -> Self {
        self.push_exact(Self::key(program, args), Err(error));
        self
    }

    /// Match any command line starting with `prefix` (e.g. `"git commit -m"`).
    pub fn expect_prefix(self, prefix: &str, response: CommandOutput) -> Self {
        self.push_prefix(prefix, Ok(response));
        self
    }

    pub fn expect_prefix_error(self, prefix: &str, error: CommandError) -> Self {
        self.push_prefix(prefix, Err(error));
        self
    }

    fn push_exact(&self, key: String, response: Result<CommandOutput, CommandError>) {
        let mut exact = self.exact.lock().unwrap_or_else(|e| e.into_inner());
        exact.entry(key).or_default().push_back(response);
    }

    fn push_prefix(&self, prefix: &str, response: Result<CommandOutput, CommandError>) {
        let mut prefixes = self.prefixes.lock().unwrap_or_else(|e| e.into_inner());
        match prefixes.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, queue)) => queue.push_back(response),
            None => prefixes.push((prefix.to_string(), VecDeque::from([response]))),
        }
    }

    fn key(program: &str, args: &[&str]) -> String {
        if args.is_empty() {
            program.to_string()
        } else {
            format!("{} {}", program, args.join(" "))
        }
    }

    fn next_from(
        queue: &mut VecDeque<Result<CommandOutput, CommandError>>,
    ) -> Option<Result<CommandOutput, CommandError>> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    /// All command lines executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Index of the first call starting with `prefix`.
    pub fn position_of(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    /// Number of calls starting with `prefix`.
    pub fn count_of(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[&str],
        _working_dir: &Path,
    ) -> Result<CommandOutput, CommandError> {
        let key = Self::key(program, args);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        if let Some(queue) = self
            .exact
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&key)
        {
            if let Some(response) = Self::next_from(queue) {
                return response;
            }
        }

        {
            let mut prefixes = self.prefixes.lock().unwrap_or_else(|e| e.into_inner());
            let best = prefixes
                .iter_mut()
                .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            if let Some((_, queue)) = best {
                if let Some(response) = Self::next_from(queue) {
                    return response;
                }
            }
        }

        match &self.fallback {
            Some(output) => Ok(output.clone()),
            None => Err(CommandError::CommandNotFound {
                command: program.to_string(),
            }),
        }
    }
}
