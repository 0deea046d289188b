//! External encoder process management.
//!
//! Every capture invocation in the service goes through this module, so all
//! of them share one lifecycle contract: spawn with captured stderr, quit
//! over stdin, kill after a bounded timeout.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

/// Errors that can occur while driving an encoder process.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture process exited with {0}")]
    Failed(std::process::ExitStatus),

    #[error("capture process overran its {0:?} budget")]
    Overrun(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One spawned external encoder invocation.
pub struct ManagedProcess {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ManagedProcess {
    /// Spawn the encoder with stdin piped for the quit command. Stderr is
    /// drained into debug logs from a background task; encoder chatter is
    /// diagnostic, never an error path.
    pub fn start(program: &str, args: &[String], label: &str) -> Result<Self, CaptureError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            let label = label.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %label, "{line}");
                }
            });
        }

        debug!(process = %label, program, pid = child.id(), "Encoder process started");
        Ok(Self {
            label: label.to_string(),
            child,
            stdin,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Two-phase stop: ask the encoder to quit over stdin so it can finalize
    /// its output file, then kill once the timeout elapses.
    ///
    /// Returns `true` when the process exited within the budget.
    pub async fn stop_gracefully(&mut self, timeout: Duration) -> bool {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!(process = %self.label, error = %e, "Quit command not delivered");
            }
            let _ = stdin.flush().await;
            // Dropping stdin closes the pipe, which also ends encoders that
            // only watch for EOF.
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(process = %self.label, %status, "Encoder exited");
                true
            }
            Ok(Err(e)) => {
                warn!(process = %self.label, error = %e, "Failed waiting for encoder");
                false
            }
            Err(_) => {
                warn!(
                    process = %self.label,
                    timeout_ms = timeout.as_millis() as u64,
                    "Encoder ignored quit command, killing"
                );
                if let Err(e) = self.child.start_kill() {
                    warn!(process = %self.label, error = %e, "Kill failed");
                }
                let _ = self.child.wait().await;
                false
            }
        }
    }
}

/// Run a short-lived capture to completion, killing it if it overruns the
/// budget. Used for page clips, which self-bound rather than expose
/// cancellation.
pub async fn run_bounded(
    program: &str,
    args: &[String],
    budget: Duration,
    label: &str,
) -> Result<(), CaptureError> {
    debug!(process = %label, program, "Bounded capture started");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CaptureError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

    match tokio::time::timeout(budget, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(CaptureError::Failed(status)),
        Ok(Err(e)) => Err(CaptureError::Io(e)),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(CaptureError::Overrun(budget))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_stop_on_quit() {
        // cat exits as soon as its stdin closes.
        let mut process = ManagedProcess::start("cat", &[], "test-cat").unwrap();
        assert!(process.stop_gracefully(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_forced_kill_after_timeout() {
        let mut process =
            ManagedProcess::start("sleep", &["30".to_string()], "test-sleep").unwrap();
        assert!(!process.stop_gracefully(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = ManagedProcess::start("definitely-not-an-encoder", &[], "test-missing");
        assert!(matches!(result, Err(CaptureError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_run_bounded_success() {
        run_bounded("true", &[], Duration::from_secs(2), "test-true")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_bounded_nonzero_exit() {
        let result = run_bounded("false", &[], Duration::from_secs(2), "test-false").await;
        assert!(matches!(result, Err(CaptureError::Failed(_))));
    }

    #[tokio::test]
    async fn test_run_bounded_overrun_is_killed() {
        let result = run_bounded(
            "sleep",
            &["30".to_string()],
            Duration::from_millis(100),
            "test-overrun",
        )
        .await;
        assert!(matches!(result, Err(CaptureError::Overrun(_))));
    }
}
