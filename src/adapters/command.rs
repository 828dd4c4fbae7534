//! Decision system backed by a local program.
//!
//! The request is written to the program's stdin as JSON and the response is
//! read from stdout. Failures are classified for the retry policy:
//! - timeout, or exit code 75 (`EX_TEMPFAIL`): transient
//! - failure to spawn, any other exit code, unparseable output: fatal

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{parse_response, DecisionSystem};
use crate::domain::{DecisionError, DecisionRequest, DecisionResponse};

/// Exit code a program uses to ask for a retry
pub const EXIT_TEMPFAIL: i32 = 75;

pub struct CommandDecision {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDecision {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl DecisionSystem for CommandDecision {
    fn name(&self) -> &str {
        "command"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| DecisionError::fatal(format!("Failed to serialize request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DecisionError::fatal(format!("Failed to spawn '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                // The program may exit without reading its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(DecisionError::transient(format!(
                        "Failed to write to '{}' stdin: {}",
                        self.program, e
                    )))
                }
            }
            // Drop stdin to signal EOF
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                DecisionError::transient(format!(
                    "'{}' timed out after {:?}",
                    self.program, self.timeout
                ))
            })?
            .map_err(|e| {
                DecisionError::transient(format!("Failed to wait for '{}': {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            let message = format!(
                "'{}' failed with exit code {}: {}",
                self.program,
                exit_code,
                stderr.trim()
            );
            return Err(if exit_code == EXIT_TEMPFAIL {
                DecisionError::transient(message)
            } else {
                DecisionError::fatal(message)
            });
        }

        let value = serde_json::from_slice(&output.stdout).map_err(|e| {
            DecisionError::fatal(format!("'{}' returned invalid JSON: {}", self.program, e))
        })?;

        debug!(program = %self.program, row = %request.row_key, "Command decision returned");
        Ok(parse_response(value))
    }
}
