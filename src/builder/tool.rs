//! External build tool execution
//!
//! Package managers run as child processes with a working directory and an
//! environment. Exit status decides success; stdout and stderr are captured so
//! failures can show the tail of the output.

use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Max number of output lines to include in tool error messages.
const TOOL_ERROR_TAIL_LINES: usize = 50;

/// Extract the useful tail of tool output for error diagnostics.
///
/// Combines stdout and stderr, then returns the last `TOOL_ERROR_TAIL_LINES`
/// lines so error messages are actionable without being overwhelming.
pub(crate) fn tool_error_output(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let total = lines.len();
    let tail: Vec<&str> = if total > TOOL_ERROR_TAIL_LINES {
        lines[total - TOOL_ERROR_TAIL_LINES..].to_vec()
    } else {
        lines
    };
    tail.join("\n")
}

/// One command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// What the command is for, used in error messages ("installing requirements")
    pub purpose: String,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, purpose: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            purpose: purpose.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Value following `flag` in the argument list
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Program and arguments as a single display string
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, -1 when killed by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Output tail for diagnostics
    pub fn tail(&self) -> String {
        tool_error_output(&self.stdout, &self.stderr)
    }
}

/// Runs external package-manager commands
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Run a command to completion. A non-zero exit is not an error here;
    /// only a failure to start the process is.
    async fn run(&self, invocation: &ToolInvocation) -> KilnResult<ToolOutput>;
}

/// Run a command and turn a non-zero exit into [`KilnError::ToolFailed`]
pub async fn run_checked(tool: &dyn BuildTool, invocation: &ToolInvocation) -> KilnResult<ToolOutput> {
    let output = tool.run(invocation).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(KilnError::tool_failed(
            &invocation.program,
            &invocation.purpose,
            output.code,
            output.tail(),
        ))
    }
}

/// Runs commands as child processes of kiln
#[derive(Debug, Default, Clone)]
pub struct ProcessTool;

impl ProcessTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BuildTool for ProcessTool {
    async fn run(&self, invocation: &ToolInvocation) -> KilnResult<ToolOutput> {
        debug!(
            command = %invocation.command_line(),
            cwd = %invocation.cwd.display(),
            "running build tool"
        );

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    KilnError::ToolNotFound {
                        name: invocation.program.clone(),
                        hint: "Install it or set its path in the kiln config".to_string(),
                    }
                } else {
                    KilnError::command_failed(invocation.command_line(), e)
                }
            })?;

        Ok(ToolOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
