//! Out-of-process execution of commitment checks.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::core::commitment::{Check, CommitmentStatus};
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Result of one check. `status` is always `Passed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub status: CommitmentStatus,
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn passed() -> Self {
        Self {
            status: CommitmentStatus::Passed,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: CommitmentStatus::Failed,
            detail: Some(detail.into()),
        }
    }
}

/// Executes checks in isolation from the agent. Implementations block;
/// callers run them off the async executor.
pub trait CheckRunner: Send + Sync {
    fn run(&self, check: &Check, request: &CheckRequest) -> Result<CheckOutcome>;
}

/// Runs `shell` checks through a configured shell prefix.
pub struct ShellCheckRunner {
    shell: Vec<String>,
}

impl ShellCheckRunner {
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }
}

impl Default for ShellCheckRunner {
    fn default() -> Self {
        Self::new(vec!["sh".to_string(), "-c".to_string()])
    }
}

impl CheckRunner for ShellCheckRunner {
    #[instrument(skip_all, fields(check = %check, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, check: &Check, request: &CheckRequest) -> Result<CheckOutcome> {
        match check {
            Check::Shell { command } => {
                let (program, prefix) = self
                    .shell
                    .split_first()
                    .ok_or_else(|| anyhow!("shell prefix is empty"))?;
                let mut cmd = Command::new(program);
                cmd.args(prefix).arg(command).current_dir(&request.workdir);
                let output =
                    run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)?;
                let excerpt = output.excerpt(request.output_limit_bytes);
                if output.timed_out {
                    return Ok(CheckOutcome::failed(format!(
                        "timed out after {}s",
                        request.timeout.as_secs()
                    )));
                }
                debug!(exit_code = ?output.status.code(), "check finished");
                if output.status.success() {
                    Ok(CheckOutcome {
                        status: CommitmentStatus::Passed,
                        detail: (!excerpt.is_empty()).then_some(excerpt),
                    })
                } else {
                    Ok(CheckOutcome::failed(format!(
                        "exit status {:?}\n{excerpt}",
                        output.status.code()
                    )))
                }
            }
            Check::PathExists { path } => {
                let full = request.workdir.join(path);
                if full.exists() {
                    Ok(CheckOutcome::passed())
                } else {
                    Ok(CheckOutcome::failed(format!("{} does not exist", path.display())))
                }
            }
        }
    }
}
