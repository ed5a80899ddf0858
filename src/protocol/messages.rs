//! Control message types exchanged with the capture producer
//!
//! Inbound lines are parsed into a closed [`ControlEvent`] union with
//! field validation at the boundary; outbound [`Command`]s serialize to
//! single JSON lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{MAX_CHANNELS, MAX_RING_SAMPLES, MAX_SAMPLE_RATE};
use crate::error::{CommandError, ProtocolError};

/// Format of the PCM stream announced by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl CaptureFormat {
    /// Create a validated format.
    ///
    /// `sample_rate` must lie in `1..=MAX_SAMPLE_RATE` and `channels` in
    /// `1..=MAX_CHANNELS`.
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, ProtocolError> {
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(invalid(
                "capture-format",
                format!("sampleRate {} outside 1..={}", sample_rate, MAX_SAMPLE_RATE),
            ));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(invalid(
                "capture-format",
                format!("channels {} outside 1..={}", channels, MAX_CHANNELS),
            ));
        }
        Ok(Self { sample_rate, channels })
    }

    /// Ring capacity in samples holding `margin_secs` of audio at this format.
    ///
    /// Never smaller than one frame, never larger than `MAX_RING_SAMPLES`.
    pub fn ring_capacity(&self, margin_secs: f32) -> usize {
        let samples = self.sample_rate as f64 * self.channels as f64 * margin_secs.max(0.0) as f64;
        let samples = samples.ceil().min(MAX_RING_SAMPLES as f64) as usize;
        samples.max(self.channels as usize)
    }
}

/// One process with an active audio session, as reported by the producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSession {
    pub pid: u32,
    pub process_name: String,
    /// Render device the session plays on, when the producer reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// `type: "error"` message from the producer.
///
/// The full object is kept in `payload` so it can be forwarded untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerDiagnostic {
    pub message: Option<String>,
    pub code: Option<i64>,
    pub payload: Value,
}

impl ProducerDiagnostic {
    fn from_value(payload: Value) -> Self {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let code = payload.get("code").and_then(Value::as_i64);
        Self {
            message,
            code,
            payload,
        }
    }

    /// Diagnostic raised locally rather than by the producer
    pub fn local(message: impl Into<String>) -> Self {
        let message = message.into();
        let payload = serde_json::json!({ "type": "error", "message": message });
        Self {
            message: Some(message),
            code: None,
            payload,
        }
    }
}

/// A parsed inbound control message. Exactly one kind per line.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    SessionsList(Vec<AudioSession>),
    FormatAnnounced(CaptureFormat),
    CaptureStopped,
    Error(ProducerDiagnostic),
}

/// The two shapes of the `capture-format` payload seen in the wild:
/// `{sampleRate, channels}` and `{format: {sampleRate, channels, bitsPerSample}, bufferSize}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum FormatPayload {
    Nested { format: WireFormat },
    Flat(WireFormat),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFormat {
    sample_rate: u32,
    channels: u16,
    #[serde(default)]
    bits_per_sample: Option<u16>,
}

impl ControlEvent {
    /// Parse one delimited control line (without its trailing newline).
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_owned();

        match kind.as_str() {
            "audio-sessions" => {
                let data = value
                    .get("data")
                    .cloned()
                    .ok_or_else(|| invalid("audio-sessions", "missing data"))?;
                let sessions: Vec<AudioSession> = serde_json::from_value(data)
                    .map_err(|e| invalid("audio-sessions", e.to_string()))?;
                Ok(ControlEvent::SessionsList(sessions))
            }
            "capture-format" => {
                let data = value
                    .get("data")
                    .cloned()
                    .ok_or_else(|| invalid("capture-format", "missing data"))?;
                let wire = match serde_json::from_value(data)
                    .map_err(|e| invalid("capture-format", e.to_string()))?
                {
                    FormatPayload::Nested { format } => format,
                    FormatPayload::Flat(format) => format,
                };
                if let Some(bits) = wire.bits_per_sample {
                    if bits != 16 {
                        return Err(invalid(
                            "capture-format",
                            format!("unsupported bitsPerSample {}", bits),
                        ));
                    }
                }
                let format = CaptureFormat::new(wire.sample_rate, wire.channels)?;
                Ok(ControlEvent::FormatAnnounced(format))
            }
            "capture-stopped" => Ok(ControlEvent::CaptureStopped),
            "error" => Ok(ControlEvent::Error(ProducerDiagnostic::from_value(value))),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }

    /// Wire name of this event's `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::SessionsList(_) => "audio-sessions",
            ControlEvent::FormatAnnounced(_) => "capture-format",
            ControlEvent::CaptureStopped => "capture-stopped",
            ControlEvent::Error(_) => "error",
        }
    }
}

fn invalid(kind: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind,
        reason: reason.into(),
    }
}

/// Outbound command to the producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    GetAudioSessions,
    StartCapture { pid: u32 },
    StopCapture,
    Quit,
}

impl Command {
    /// Serialize as one newline-terminated JSON line
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Process id as handed over by the UI layer, which may carry it as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidInput {
    Numeric(u32),
    Text(String),
}

impl PidInput {
    /// Resolve to a numeric pid, rejecting anything that is not an unsigned integer.
    pub fn resolve(&self) -> Result<u32, CommandError> {
        match self {
            PidInput::Numeric(pid) => Ok(*pid),
            PidInput::Text(text) => text
                .trim()
                .parse::<u32>()
                .map_err(|_| CommandError::InvalidPid(text.clone())),
        }
    }
}

impl From<u32> for PidInput {
    fn from(pid: u32) -> Self {
        PidInput::Numeric(pid)
    }
}

impl From<&str> for PidInput {
    fn from(text: &str) -> Self {
        PidInput::Text(text.to_owned())
    }
}

impl From<String> for PidInput {
    fn from(text: String) -> Self {
        PidInput::Text(text)
    }
}
