//! # Process Audio Relay
//!
//! Relays audio captured from a single process by an external producer
//! program into the local audio output, and reports capture status to a
//! UI layer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    PRODUCER (process-audio-capture)                  │
//! │        stdin: JSON commands        stdout: JSON lines, then PCM      │
//! └───────────────▲──────────────────────────────────┬───────────────────┘
//!                 │                                  │
//!                 │ {"type":"start-capture",...}\n   │ {"type":"capture-format",...}\n
//!                 │                                  │ s16le interleaved PCM ...
//! ┌───────────────┼──────────────────────────────────┼───────────────────┐
//! │  I/O TASK     │                                  ▼                   │
//! │  ┌────────────┴─────────┐          ┌─────────────────────────────┐   │
//! │  │ CommandSender        │          │ StreamDecoder               │   │
//! │  │ (protocol::sender)   │          │ control mode / PCM mode     │   │
//! │  └────────────▲─────────┘          └──────────────┬──────────────┘   │
//! │               │                                   │                  │
//! │  ┌────────────┴───────────────────────────────────▼──────────────┐   │
//! │  │ CaptureSession (session::capture)                             │   │
//! │  │   Idle ──start──▶ Negotiating ──format──▶ Streaming           │   │
//! │  │   owns the SPSC sample ring write half + PcmConverter         │   │
//! │  └──────┬──────────────────────────────┬─────────────────────────┘   │
//! │         │ UiEvent                      │ attach / detach              │
//! │         ▼                              ▼ (RenderLink)                │
//! │   audio-sessions, capture-format,  ┌──────────────────────────┐      │
//! │   pcm-data, capture-stopped,       │ SPSC ring (audio::buffer)│      │
//! │   cpa-error                        └────────────┬─────────────┘      │
//! └─────────────────────────────────────────────────┼────────────────────┘
//!                                                   │ lock-free
//! ┌─────────────────────────────────────────────────▼────────────────────┐
//! │  AUDIO CALLBACK (audio::playback)                                    │
//! │    RenderEndpoint → RenderConsumer: channel routing, silence on      │
//! │    underrun, no allocation                                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod producer;
pub mod protocol;
pub mod relay;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Output sample rate requested when nothing else is configured
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Seconds of audio the sample ring holds at the active format
    pub const DEFAULT_SAFETY_MARGIN_SECS: f32 = 5.0;

    /// Frames rendered per scratch pass in the audio callback
    pub const DEFAULT_MAX_BLOCK_FRAMES: usize = 4096;

    /// Longest accepted control line
    pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

    /// Wait after `quit` before the producer is killed
    pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 200;

    /// Producer executable looked up on `PATH` by default
    pub const DEFAULT_PRODUCER_EXECUTABLE: &str = "process-audio-capture";

    /// Pending attach/detach requests between the I/O task and the callback
    pub const RENDER_LINK_DEPTH: usize = 8;

    /// Highest sample rate accepted in a `capture-format` announcement
    pub const MAX_SAMPLE_RATE: u32 = 768_000;

    /// Highest channel count accepted in a `capture-format` announcement
    pub const MAX_CHANNELS: u16 = 32;

    /// Upper bound on a sample ring allocation (128 MiB of `f32`)
    pub const MAX_RING_SAMPLES: usize = 32 * 1024 * 1024;
}
