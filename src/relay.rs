//! Relay I/O loop
//!
//! One task owns the [`CaptureSession`]: it reads the producer's stdout
//! and serves commands from [`RelayHandle`]s, so every state transition
//! happens in a single context.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::audio::render::RenderLink;
use crate::config::AppConfig;
use crate::error::{CommandError, Error, Result, TransportError};
use crate::producer::ProducerProcess;
use crate::protocol::{AudioSession, CommandSender, PidInput};
use crate::session::{CaptureSession, SessionObserver, SessionOptions, SessionState, UiEvent};

/// Bytes requested per read from the producer
const READ_CHUNK: usize = 16 * 1024;

enum RelayCommand {
    GetAudioSessions {
        reply: oneshot::Sender<Result<()>>,
    },
    StartCapture {
        pid: u32,
        reply: oneshot::Sender<Result<u32>>,
    },
    StopCapture {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable control handle for a running relay
#[derive(Clone)]
pub struct RelayHandle {
    commands: UnboundedSender<RelayCommand>,
    observer: SessionObserver,
}

impl RelayHandle {
    /// Ask the producer for its audio sessions; the answer arrives as
    /// [`UiEvent::AudioSessions`].
    pub async fn get_audio_sessions(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(RelayCommand::GetAudioSessions { reply })?;
        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    /// Start capturing `pid`. Invalid ids are rejected without touching the relay.
    pub async fn start_capture(&self, pid: impl Into<PidInput>) -> Result<u32> {
        let pid = pid.into().resolve()?;
        if let Some(active) = self.observer.state().active_pid() {
            return Err(CommandError::CaptureInProgress(active).into());
        }

        let (reply, rx) = oneshot::channel();
        self.request(RelayCommand::StartCapture { pid, reply })?;
        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    pub async fn stop_capture(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(RelayCommand::StopCapture { reply })?;
        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    /// Stop any capture, ask the producer to quit and wait for the relay to finish
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(RelayCommand::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn observer(&self) -> &SessionObserver {
        &self.observer
    }

    pub fn state(&self) -> SessionState {
        self.observer.state()
    }

    pub fn audio_sessions(&self) -> Vec<AudioSession> {
        self.observer.audio_sessions()
    }

    fn request(&self, command: RelayCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Transport(TransportError::ChannelClosed))
    }
}

/// Spawn the configured producer and relay its stream
pub fn spawn_producer_relay(
    config: &AppConfig,
    render: RenderLink,
) -> Result<(RelayHandle, UnboundedReceiver<UiEvent>)> {
    let producer = ProducerProcess::spawn(&config.producer)?;
    Ok(spawn_relay(
        producer.stdout,
        producer.stdin,
        Some(producer.child),
        render,
        SessionOptions::from(config),
        config.producer.shutdown_grace(),
    ))
}

/// Relay over an arbitrary byte transport.
///
/// `child`, when given, is reaped (or killed after `shutdown_grace`) on shutdown.
pub fn spawn_relay<R, W>(
    reader: R,
    writer: W,
    child: Option<Child>,
    render: RenderLink,
    options: SessionOptions,
    shutdown_grace: Duration,
) -> (RelayHandle, UnboundedReceiver<UiEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (events_tx, events_rx) = unbounded_channel();
    let (commands_tx, commands_rx) = unbounded_channel();

    let session = CaptureSession::new(CommandSender::new(writer), render, events_tx, options);
    let handle = RelayHandle {
        commands: commands_tx,
        observer: session.observer(),
    };

    let relay = RelayLoop {
        reader,
        session,
        commands: commands_rx,
        child,
        shutdown_grace,
    };
    tokio::spawn(relay.run());

    (handle, events_rx)
}

struct RelayLoop<R, W> {
    reader: R,
    session: CaptureSession<W>,
    commands: UnboundedReceiver<RelayCommand>,
    child: Option<Child>,
    shutdown_grace: Duration,
}

impl<R, W> RelayLoop<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut reader_open = true;

        loop {
            tokio::select! {
                read = self.reader.read_buf(&mut buf), if reader_open => match read {
                    Ok(0) => {
                        reader_open = false;
                        self.session.transport_closed("producer stdout reached EOF");
                    }
                    Ok(_) => {
                        self.session.ingest(buf.split().freeze());
                        buf.reserve(READ_CHUNK);
                    }
                    Err(e) => {
                        reader_open = false;
                        let err = TransportError::ReadFailed(e);
                        self.session.transport_closed(&err.to_string());
                    }
                },
                command = self.commands.recv() => match command {
                    Some(RelayCommand::GetAudioSessions { reply }) => {
                        let result = self.session.request_sessions().await.map_err(Error::from);
                        let _ = reply.send(result);
                    }
                    Some(RelayCommand::StartCapture { pid, reply }) => {
                        let result = self.session.start_capture(pid).await;
                        let _ = reply.send(result);
                    }
                    Some(RelayCommand::StopCapture { reply }) => {
                        let result = self.session.stop_capture().await.map_err(Error::from);
                        let _ = reply.send(result);
                    }
                    Some(RelayCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        tracing::debug!("Relay loop finished");
    }

    /// `stop-capture`, `quit`, then give the producer a grace period before killing it
    async fn shutdown(&mut self) {
        tracing::info!("Shutting down relay");

        if let Err(e) = self.session.stop_capture().await {
            tracing::debug!("stop-capture during shutdown failed: {}", e);
        }
        if let Err(e) = self.session.quit().await {
            tracing::debug!("quit during shutdown failed: {}", e);
        }

        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("Producer exited with {}", status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for producer: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Producer still running after {:?}, killing it",
                    self.shutdown_grace
                );
                if let Err(e) = child.kill().await {
                    tracing::error!("Failed to kill producer: {}", e);
                }
            }
        }
    }
}
