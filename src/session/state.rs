//! Session state, UI-facing events and the shared status snapshot

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use crate::protocol::{AudioSession, CaptureFormat};

/// Capture session state machine.
///
/// ```text
/// Idle --start(pid)--> Negotiating --capture-format--> Streaming
///   ^                      |                               |
///   +---- stop / capture-stopped / error / transport ------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No target process selected
    #[default]
    Idle,
    /// Start command sent, waiting for the format
    Negotiating { pid: u32 },
    /// Format confirmed, PCM flowing
    Streaming { pid: u32, format: CaptureFormat },
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_capturing(&self) -> bool {
        !self.is_idle()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn active_pid(&self) -> Option<u32> {
        match self {
            Self::Idle => None,
            Self::Negotiating { pid } | Self::Streaming { pid, .. } => Some(*pid),
        }
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        match self {
            Self::Streaming { format, .. } => Some(*format),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating { .. } => "negotiating",
            Self::Streaming { .. } => "streaming",
        }
    }
}

/// Events delivered to the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    AudioSessions(Vec<AudioSession>),
    CaptureFormat(CaptureFormat),
    PcmData(Bytes),
    CaptureStopped,
    /// Producer diagnostic payload, or a local terminal diagnostic
    CpaError(Value),
}

impl UiEvent {
    /// Channel name on the UI event surface
    pub fn channel(&self) -> &'static str {
        match self {
            UiEvent::AudioSessions(_) => "audio-sessions",
            UiEvent::CaptureFormat(_) => "capture-format",
            UiEvent::PcmData(_) => "pcm-data",
            UiEvent::CaptureStopped => "capture-stopped",
            UiEvent::CpaError(_) => "cpa-error",
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub sessions: Vec<AudioSession>,
}

/// Read side of the session status, shared with the UI layer.
///
/// Only the owning session writes to it.
#[derive(Debug, Clone, Default)]
pub struct SessionObserver {
    inner: Arc<RwLock<SessionSnapshot>>,
}

impl SessionObserver {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    pub fn audio_sessions(&self) -> Vec<AudioSession> {
        self.inner.read().sessions.clone()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.inner.write().state = state;
    }

    pub(crate) fn set_sessions(&self, sessions: Vec<AudioSession>) {
        self.inner.write().sessions = sessions;
    }
}
