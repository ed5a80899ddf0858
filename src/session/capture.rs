//! Format-aware capture session
//!
//! Single authority over the capture format and the sample ring: it
//! routes decoded control events through the state machine, creates a
//! fresh ring and render consumer for every announced format, and tears
//! both down on stop, on `capture-stopped`, on producer errors and when
//! the transport closes. Runs entirely in the I/O context.

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::UnboundedSender;

use crate::audio::buffer::{sample_ring, RingStats, SampleProducer};
use crate::audio::pcm::PcmConverter;
use crate::audio::render::{MonoDownmix, RenderConsumer, RenderLink};
use crate::config::AppConfig;
use crate::error::{CommandError, Result, TransportError};
use crate::protocol::{
    AudioSession, CaptureFormat, Command, CommandSender, ControlEvent, PidInput,
    ProducerDiagnostic, StreamDecoder, StreamItem, StreamMode,
};
use crate::session::state::{SessionObserver, SessionState, UiEvent};

/// Session tuning taken from the application config
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub safety_margin_secs: f32,
    pub max_block_frames: usize,
    pub mono_downmix: MonoDownmix,
    pub forward_pcm: bool,
    pub max_line_bytes: usize,
    /// Rate the output stream runs at, when playback is enabled
    pub output_sample_rate: Option<u32>,
}

impl From<&AppConfig> for SessionOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            safety_margin_secs: config.buffer.safety_margin_secs,
            max_block_frames: config.buffer.max_block_frames,
            mono_downmix: config.playback.mono_downmix,
            forward_pcm: config.events.forward_pcm,
            max_line_bytes: config.protocol.max_line_bytes,
            output_sample_rate: config
                .playback
                .enabled
                .then_some(config.playback.sample_rate),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Capture session bound to one producer transport
pub struct CaptureSession<W> {
    state: SessionState,
    sessions: Vec<AudioSession>,
    decoder: StreamDecoder,
    pcm: PcmConverter,
    /// Write half of the active ring; `None` unless streaming
    ring: Option<SampleProducer>,
    render: RenderLink,
    sender: CommandSender<W>,
    events: UnboundedSender<UiEvent>,
    observer: SessionObserver,
    options: SessionOptions,
    overflow_reported: bool,
    /// Local stop sent, producer's `capture-stopped` not seen yet
    stop_pending: bool,
    malformed_lines: u64,
}

impl<W: AsyncWrite + Unpin> CaptureSession<W> {
    pub fn new(
        sender: CommandSender<W>,
        render: RenderLink,
        events: UnboundedSender<UiEvent>,
        options: SessionOptions,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            sessions: Vec::new(),
            decoder: StreamDecoder::new(options.max_line_bytes),
            pcm: PcmConverter::new(),
            ring: None,
            render,
            sender,
            events,
            observer: SessionObserver::default(),
            options,
            overflow_reported: false,
            stop_pending: false,
            malformed_lines: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last process list reported by the producer
    pub fn audio_sessions(&self) -> &[AudioSession] {
        &self.sessions
    }

    /// Shared read-only view for other contexts
    pub fn observer(&self) -> SessionObserver {
        self.observer.clone()
    }

    pub fn decoder_mode(&self) -> StreamMode {
        self.decoder.mode()
    }

    pub fn ring_stats(&self) -> Option<RingStats> {
        self.ring.as_ref().map(SampleProducer::stats)
    }

    /// Control lines dropped as malformed so far
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }

    /// Ask the producer for the current list of audio sessions
    pub async fn request_sessions(&mut self) -> std::result::Result<(), TransportError> {
        self.sender.send(&Command::GetAudioSessions).await
    }

    /// `Idle --start(pid)--> Negotiating`.
    ///
    /// The pid is validated before anything is written. Returns the
    /// numeric pid the producer was asked to capture.
    pub async fn start_capture(&mut self, pid: impl Into<PidInput>) -> Result<u32> {
        let pid = pid.into().resolve()?;
        if let Some(active) = self.state.active_pid() {
            return Err(CommandError::CaptureInProgress(active).into());
        }

        self.sender.send(&Command::StartCapture { pid }).await?;
        tracing::info!("Requested capture of pid {}", pid);
        self.stop_pending = false;
        self.decoder.expect_format(true);
        self.set_state(SessionState::Negotiating { pid });
        Ok(pid)
    }

    /// Stop locally right away, then tell the producer.
    ///
    /// Local state does not wait for `capture-stopped`.
    pub async fn stop_capture(&mut self) -> std::result::Result<(), TransportError> {
        if self.state.is_capturing() {
            tracing::info!("Stopping capture ({})", self.state.name());
            self.stop_pending = true;
        }
        self.teardown();
        self.decoder.enter_control_mode();
        self.sender.send(&Command::StopCapture).await
    }

    /// Ask the producer process to exit
    pub async fn quit(&mut self) -> std::result::Result<(), TransportError> {
        self.sender.send(&Command::Quit).await?;
        self.sender.close().await
    }

    /// Feed one chunk read from the producer
    pub fn ingest(&mut self, chunk: Bytes) {
        for item in self.decoder.decode(chunk) {
            match item {
                StreamItem::Control(event) => self.handle_event(event),
                StreamItem::Pcm(bytes) => self.handle_pcm(bytes),
                StreamItem::Malformed(err) => {
                    self.malformed_lines += 1;
                    if self.stop_pending {
                        // Audio still in flight ahead of `capture-stopped`
                        tracing::debug!("Skipping trailing capture data: {}", err);
                    } else {
                        tracing::warn!("Dropping malformed control message: {}", err);
                    }
                }
            }
        }
    }

    /// The producer's stdout closed or failed: force `Idle` and report it.
    pub fn transport_closed(&mut self, reason: &str) {
        tracing::error!("Producer transport closed: {}", reason);
        self.stop_pending = false;
        self.teardown();
        self.decoder.enter_control_mode();
        self.emit(UiEvent::CpaError(
            ProducerDiagnostic::local(format!("producer transport closed: {}", reason)).payload,
        ));
    }

    fn handle_event(&mut self, event: ControlEvent) {
        tracing::debug!("<- producer: {}", event.kind());
        match event {
            ControlEvent::SessionsList(sessions) => {
                tracing::info!("Producer reported {} audio sessions", sessions.len());
                self.sessions = sessions.clone();
                self.observer.set_sessions(sessions.clone());
                self.emit(UiEvent::AudioSessions(sessions));
            }
            ControlEvent::FormatAnnounced(format) => match self.state {
                SessionState::Negotiating { pid } | SessionState::Streaming { pid, .. } => {
                    self.begin_streaming(pid, format);
                    self.emit(UiEvent::CaptureFormat(format));
                }
                // The decoder was not armed, so it is still in control mode.
                SessionState::Idle if self.stop_pending => {
                    tracing::debug!(
                        "Ignoring capture format {}Hz/{}ch announced after a local stop",
                        format.sample_rate,
                        format.channels
                    );
                }
                SessionState::Idle => {
                    tracing::warn!(
                        "Ignoring capture format {}Hz/{}ch announced while idle",
                        format.sample_rate,
                        format.channels
                    );
                }
            },
            ControlEvent::CaptureStopped => {
                if self.state.is_capturing() {
                    tracing::info!("Producer stopped capture");
                }
                self.stop_pending = false;
                self.teardown();
                self.emit(UiEvent::CaptureStopped);
            }
            ControlEvent::Error(diag) => {
                tracing::warn!(
                    "Producer error: {}",
                    diag.message.as_deref().unwrap_or("<no message>")
                );
                if self.state.is_capturing() {
                    self.teardown();
                }
                self.emit(UiEvent::CpaError(diag.payload));
            }
        }
    }

    fn handle_pcm(&mut self, bytes: Bytes) {
        let Some(ring) = self.ring.as_mut() else {
            tracing::debug!("Discarding {} PCM bytes outside a capture", bytes.len());
            return;
        };

        let samples = self.pcm.convert(&bytes);
        let written = ring.push(samples);
        if written < samples.len() && !self.overflow_reported {
            self.overflow_reported = true;
            tracing::warn!(
                "Sample ring full, dropping {} samples (render side is not keeping up)",
                samples.len() - written
            );
        }

        if self.options.forward_pcm {
            self.emit(UiEvent::PcmData(bytes));
        }
    }

    /// `Negotiating --capture-format--> Streaming`: fresh ring and consumer for `format`
    fn begin_streaming(&mut self, pid: u32, format: CaptureFormat) {
        self.release_ring();

        let capacity = format.ring_capacity(self.options.safety_margin_secs);
        let (producer, consumer) = sample_ring(capacity);
        self.render.attach(RenderConsumer::new(
            consumer,
            format,
            self.options.mono_downmix,
            self.options.max_block_frames,
        ));
        self.ring = Some(producer);
        self.pcm.reset();
        self.overflow_reported = false;

        tracing::info!(
            "Streaming pid {} at {}Hz, {} channels (ring {} samples)",
            pid,
            format.sample_rate,
            format.channels,
            capacity
        );
        if let Some(output_rate) = self.options.output_sample_rate {
            if output_rate != format.sample_rate {
                tracing::info!(
                    "Capture runs at {}Hz, output at {}Hz: resampling in the render path",
                    format.sample_rate,
                    output_rate
                );
            }
        }
        self.set_state(SessionState::Streaming { pid, format });
    }

    /// Drop the ring and render consumer and return to `Idle`
    fn teardown(&mut self) {
        self.release_ring();
        self.decoder.expect_format(false);
        self.render.detach();
        self.pcm.reset();
        self.set_state(SessionState::Idle);
    }

    fn release_ring(&mut self) {
        if let Some(ring) = self.ring.take() {
            let stats = ring.stats();
            tracing::info!(
                "Capture ring released: {} samples dropped, {} underruns, {} unread",
                stats.dropped_samples,
                stats.underruns,
                stats.available
            );
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session {} -> {}", self.state.name(), state.name());
        }
        self.state = state;
        self.observer.set_state(state);
    }

    fn emit(&self, event: UiEvent) {
        // The UI may have gone away; the session keeps running regardless.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::render::{render_link, RenderEndpoint};
    use crate::error::Error;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const FORMAT_LINE: &[u8] =
        b"{\"type\":\"capture-format\",\"data\":{\"sampleRate\":48000,\"channels\":2}}\n";

    struct Harness {
        session: CaptureSession<DuplexStream>,
        producer_stdin: BufReader<DuplexStream>,
        endpoint: RenderEndpoint,
        events: UnboundedReceiver<UiEvent>,
    }

    fn harness() -> Harness {
        let (writer, reader) = tokio::io::duplex(4096);
        let (link, endpoint) = render_link();
        let (events_tx, events) = unbounded_channel();
        let session = CaptureSession::new(
            CommandSender::new(writer),
            link,
            events_tx,
            SessionOptions::default(),
        );
        Harness {
            session,
            producer_stdin: BufReader::new(reader),
            endpoint,
            events,
        }
    }

    impl Harness {
        async fn next_command(&mut self) -> String {
            let mut line = String::new();
            self.producer_stdin.read_line(&mut line).await.unwrap();
            line
        }

        async fn streaming(&mut self, pid: u32) {
            self.session.start_capture(pid).await.unwrap();
            self.next_command().await;
            self.session.ingest(Bytes::from_static(FORMAT_LINE));
        }
    }

    #[tokio::test]
    async fn test_sessions_list_is_observable() {
        let mut h = harness();
        h.session.request_sessions().await.unwrap();
        assert_eq!(h.next_command().await, "{\"type\":\"get-audio-sessions\"}\n");

        h.session.ingest(Bytes::from_static(
            b"{\"type\":\"audio-sessions\",\"data\":[{\"pid\":123,\"processName\":\"chrome\"}]}\n",
        ));

        let expected = vec![AudioSession {
            pid: 123,
            process_name: "chrome".into(),
            device: None,
        }];
        assert_eq!(h.session.audio_sessions(), &expected[..]);
        assert_eq!(h.session.observer().audio_sessions(), expected);
        assert_eq!(h.events.try_recv().unwrap(), UiEvent::AudioSessions(expected));
        assert!(h.session.state().is_idle());
    }

    #[tokio::test]
    async fn test_start_coerces_text_pid() {
        let mut h = harness();
        let pid = h.session.start_capture("456").await.unwrap();

        assert_eq!(pid, 456);
        assert_eq!(
            h.next_command().await,
            "{\"type\":\"start-capture\",\"pid\":456}\n"
        );
        assert_eq!(h.session.state(), SessionState::Negotiating { pid: 456 });
    }

    #[tokio::test]
    async fn test_invalid_pid_is_rejected_before_send() {
        let mut h = harness();
        let result = h.session.start_capture("chrome").await;

        assert!(matches!(
            result,
            Err(Error::Command(CommandError::InvalidPid(_)))
        ));
        assert!(h.session.state().is_idle());

        let mut line = String::new();
        let read = tokio::time::timeout(
            Duration::from_millis(20),
            h.producer_stdin.read_line(&mut line),
        )
        .await;
        assert!(read.is_err(), "nothing should have been written");
    }

    #[tokio::test]
    async fn test_start_while_capturing_is_rejected() {
        let mut h = harness();
        h.session.start_capture(1u32).await.unwrap();
        let result = h.session.start_capture(2u32).await;
        assert!(matches!(
            result,
            Err(Error::Command(CommandError::CaptureInProgress(1)))
        ));
    }

    #[tokio::test]
    async fn test_format_then_pcm_reaches_render() {
        let mut h = harness();
        h.session.start_capture(77u32).await.unwrap();
        h.next_command().await;

        let mut chunk = FORMAT_LINE.to_vec();
        chunk.extend_from_slice(&[0x01, 0x00, 0x02, 0x00]);
        h.session.ingest(Bytes::from(chunk));

        let format = CaptureFormat::new(48000, 2).unwrap();
        assert_eq!(h.session.state(), SessionState::Streaming { pid: 77, format });
        assert_eq!(h.session.decoder_mode(), StreamMode::Streaming);
        assert_eq!(h.session.ring_stats().unwrap().available, 2);
        assert_eq!(h.session.ring_stats().unwrap().capacity, 480_000);

        let mut out = [0.0f32; 2];
        h.endpoint.render_interleaved(&mut out, 2);
        assert_eq!(out, [1.0 / 32768.0, 2.0 / 32768.0]);

        assert_eq!(h.events.try_recv().unwrap(), UiEvent::CaptureFormat(format));
        assert_eq!(
            h.events.try_recv().unwrap(),
            UiEvent::PcmData(Bytes::from_static(&[0x01, 0x00, 0x02, 0x00]))
        );
    }

    #[tokio::test]
    async fn test_stop_mid_stream_is_immediate() {
        let mut h = harness();
        h.streaming(5).await;
        h.session.ingest(Bytes::from(vec![0x10; 64]));

        h.session.stop_capture().await.unwrap();
        assert!(h.session.state().is_idle());
        assert_eq!(h.session.observer().state(), SessionState::Idle);
        assert_eq!(h.session.decoder_mode(), StreamMode::Control);
        assert!(h.session.ring_stats().is_none());

        let mut out = [1.0f32; 8];
        h.endpoint.render_interleaved(&mut out, 2);
        assert_eq!(out, [0.0; 8]);
        assert!(!h.endpoint.is_attached());

        assert_eq!(h.next_command().await, "{\"type\":\"stop-capture\"}\n");
    }

    #[tokio::test]
    async fn test_capture_stopped_tears_down() {
        let mut h = harness();
        h.streaming(5).await;
        h.session.stop_capture().await.unwrap();
        h.next_command().await;

        // Trailing PCM ahead of the acknowledgement is skipped.
        let mut chunk = vec![0x33, 0x7b, 0x00];
        chunk.extend_from_slice(b"{\"type\":\"capture-stopped\"}\n");
        h.session.ingest(Bytes::from(chunk));

        assert!(h.session.state().is_idle());
        let mut saw_stopped = false;
        while let Ok(event) = h.events.try_recv() {
            saw_stopped |= event == UiEvent::CaptureStopped;
        }
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn test_producer_error_while_negotiating() {
        let mut h = harness();
        h.session.start_capture(9u32).await.unwrap();
        h.session.ingest(Bytes::from_static(
            b"{\"type\":\"error\",\"message\":\"Process with PID 9 has no active audio session or does not exist.\"}\n",
        ));

        assert!(h.session.state().is_idle());
        match h.events.try_recv().unwrap() {
            UiEvent::CpaError(payload) => assert_eq!(payload["type"], "error"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_while_idle_keeps_state() {
        let mut h = harness();
        h.session.ingest(Bytes::from_static(
            b"{\"type\":\"error\",\"message\":\"Capture is not in progress.\"}\n",
        ));
        assert!(h.session.state().is_idle());
        assert!(matches!(h.events.try_recv(), Ok(UiEvent::CpaError(_))));
    }

    #[tokio::test]
    async fn test_format_while_idle_is_ignored() {
        let mut h = harness();
        let mut chunk = FORMAT_LINE.to_vec();
        chunk.extend_from_slice(&[0x01, 0x00, 0x0a]);
        chunk.extend_from_slice(b"{\"type\":\"capture-stopped\"}\n");
        h.session.ingest(Bytes::from(chunk));

        assert!(h.session.state().is_idle());
        assert_eq!(h.session.decoder_mode(), StreamMode::Control);
        assert_eq!(h.events.try_recv().unwrap(), UiEvent::CaptureStopped);
        assert!(h.events.try_recv().is_err());
    }

    fn sine_pcm(len: usize) -> Vec<u8> {
        (0..len / 2)
            .flat_map(|i| (((i as f32 * 0.05).sin() * 12000.0) as i16).to_le_bytes())
            .collect()
    }

    #[tokio::test]
    async fn test_stop_while_negotiating_keeps_acknowledgement_for_any_chunking() {
        let mut stream = FORMAT_LINE.to_vec();
        stream.extend_from_slice(&sine_pcm(128 * 1024));
        stream.extend_from_slice(b"{\"type\":\"capture-stopped\"}\n");
        let format_end = FORMAT_LINE.len();

        for cut in [None, Some(format_end), Some(format_end + 4096), Some(stream.len() - 5)] {
            let mut h = harness();
            h.session.start_capture(1u32).await.unwrap();
            h.next_command().await;
            h.session.stop_capture().await.unwrap();
            h.next_command().await;

            match cut {
                None => h.session.ingest(Bytes::from(stream.clone())),
                Some(at) => {
                    h.session.ingest(Bytes::copy_from_slice(&stream[..at]));
                    h.session.ingest(Bytes::copy_from_slice(&stream[at..]));
                }
            }

            let events: Vec<UiEvent> = std::iter::from_fn(|| h.events.try_recv().ok()).collect();
            assert_eq!(events, vec![UiEvent::CaptureStopped], "cut at {:?}", cut);
            assert!(h.session.state().is_idle());
            assert_eq!(h.session.decoder_mode(), StreamMode::Control);
        }
    }

    #[tokio::test]
    async fn test_in_flight_pcm_after_stop_is_skipped_quietly() {
        let mut h = harness();
        h.streaming(3).await;
        h.session.stop_capture().await.unwrap();
        h.next_command().await;
        assert!(h.session.stop_pending);

        let mut trailing = sine_pcm(64 * 1024);
        trailing.push(b'\n');
        h.session.ingest(Bytes::from(trailing));
        assert!(h.session.malformed_lines() > 0);
        assert!(h.session.stop_pending);

        h.session.ingest(Bytes::from_static(b"{\"type\":\"capture-stopped\"}\n"));
        assert!(!h.session.stop_pending);
        assert!(h.session.state().is_idle());

        // Garbage with no stop outstanding is a real protocol fault again.
        let before = h.session.malformed_lines();
        h.session.ingest(Bytes::from_static(b"not json\n"));
        assert_eq!(h.session.malformed_lines(), before + 1);
        assert!(!h.session.stop_pending);
    }

    #[tokio::test]
    async fn test_oversized_format_is_rejected() {
        let mut h = harness();
        h.session.start_capture(1u32).await.unwrap();
        h.session.ingest(Bytes::from_static(
            b"{\"type\":\"capture-format\",\"data\":{\"sampleRate\":4000000000,\"channels\":65535}}\n",
        ));

        assert_eq!(h.session.malformed_lines(), 1);
        assert_eq!(h.session.state(), SessionState::Negotiating { pid: 1 });
        assert_eq!(h.session.decoder_mode(), StreamMode::Control);
        assert!(h.session.ring_stats().is_none());
    }

    #[tokio::test]
    async fn test_transport_closed_forces_idle() {
        let mut h = harness();
        h.streaming(5).await;

        h.session.transport_closed("stdout reached EOF");
        assert!(h.session.state().is_idle());

        let mut out = [1.0f32; 4];
        h.endpoint.render_interleaved(&mut out, 2);
        assert_eq!(out, [0.0; 4]);

        let last = std::iter::from_fn(|| h.events.try_recv().ok()).last();
        assert!(matches!(last, Some(UiEvent::CpaError(_))));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_counted() {
        let mut h = harness();
        h.session.ingest(Bytes::from_static(b"not json\n{\"type\":\"capture-stopped\"}\n"));
        assert_eq!(h.session.malformed_lines(), 1);
        assert_eq!(h.events.try_recv().unwrap(), UiEvent::CaptureStopped);
    }
}
