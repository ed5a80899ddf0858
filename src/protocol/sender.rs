//! Outbound control commands
//!
//! Not real-time. A failed write is reported to the caller and never
//! retried here.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::protocol::messages::Command;

/// Writes newline-delimited JSON commands to the producer's stdin
pub struct CommandSender<W> {
    writer: W,
    commands_sent: u64,
}

impl<W: AsyncWrite + Unpin> CommandSender<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            commands_sent: 0,
        }
    }

    /// Serialize and write one command, flushing so the producer sees it now
    pub async fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        let line = command.to_line()?;
        tracing::debug!("-> producer: {}", String::from_utf8_lossy(&line).trim_end());

        self.writer.write_all(&line).await.map_err(map_write_error)?;
        self.writer.flush().await.map_err(map_write_error)?;

        self.commands_sent += 1;
        Ok(())
    }

    /// Number of commands written successfully
    pub fn commands_sent(&self) -> u64 {
        self.commands_sent
    }

    /// Shut down the write half, signalling EOF to the producer
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await.map_err(map_write_error)
    }
}

fn map_write_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::NotConnected => TransportError::ChannelClosed,
        _ => TransportError::WriteFailed(e),
    }
}
