//! External capture producer process
//!
//! Spawns the producer with piped stdio. Its stdout carries the framed
//! control/PCM stream, stdin takes commands, and stderr is drained into
//! the log.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::ProducerConfig;
use crate::error::TransportError;

/// A running producer and its pipes
pub struct ProducerProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl ProducerProcess {
    /// Spawn the configured producer.
    ///
    /// The child is killed if the handle is dropped without a shutdown.
    pub fn spawn(config: &ProducerConfig) -> Result<Self, TransportError> {
        let spawn_error = |reason: String| TransportError::Spawn {
            path: config.executable.display().to_string(),
            reason,
        };

        let mut child = Command::new(&config.executable)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout not captured".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        tracing::info!(
            "Spawned producer {} (pid {:?})",
            config.executable.display(),
            child.id()
        );

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "producer", "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Producer stderr closed: {}", e);
                break;
            }
        }
    }
}
