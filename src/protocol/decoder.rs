//! Framed stream decoder
//!
//! The producer's stdout carries two payload kinds on one byte stream:
//! newline-terminated JSON control lines and raw s16le PCM. There is no
//! framing header. A `capture-format` line switches the stream to PCM
//! only while the decoder is armed for it (a start is pending), and only
//! a local stop switches it back, because once streaming every byte
//! (including what looks like JSON) is audio.

use bytes::{Bytes, BytesMut};

use crate::constants::DEFAULT_MAX_LINE_BYTES;
use crate::error::ProtocolError;
use crate::protocol::messages::ControlEvent;

/// Upper bound on resynchronisation attempts per malformed line
const MAX_RESYNC_ATTEMPTS: usize = 32;

/// Which payload kind the decoder currently expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Newline-delimited JSON control messages
    Control,
    /// Raw PCM, forwarded verbatim
    Streaming,
}

/// One decoded unit, in stream order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Control(ControlEvent),
    Pcm(Bytes),
    /// A control line that could not be parsed. Decoding continues.
    Malformed(ProtocolError),
}

/// Incremental decoder for the producer byte stream.
///
/// Chunks may be split anywhere; partial control lines are buffered
/// until their delimiter arrives. PCM is forwarded as soon as it is seen.
pub struct StreamDecoder {
    mode: StreamMode,
    /// Undelimited tail of the current control line
    line: BytesMut,
    max_line_bytes: usize,
    /// Skipping the rest of an oversized line
    discarding: bool,
    /// A `capture-format` line may switch to streaming
    format_armed: bool,
}

impl StreamDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            mode: StreamMode::Control,
            line: BytesMut::with_capacity(1024),
            max_line_bytes,
            discarding: false,
            format_armed: false,
        }
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Bytes buffered towards an incomplete control line
    pub fn pending_bytes(&self) -> usize {
        self.line.len()
    }

    /// Allow (or forbid) the next `capture-format` line to switch the
    /// stream to PCM. Disarmed decoders still report the announcement
    /// but keep parsing control lines.
    ///
    /// Arming is consumed by the switch.
    pub fn expect_format(&mut self, armed: bool) {
        self.format_armed = armed;
    }

    pub fn is_format_armed(&self) -> bool {
        self.format_armed
    }

    /// Return to control mode and forget any partial line.
    ///
    /// Used when capture is stopped locally without waiting for the
    /// producer's acknowledgement.
    pub fn enter_control_mode(&mut self) {
        self.mode = StreamMode::Control;
        self.line.clear();
        self.discarding = false;
    }

    /// Decode one chunk of the stream.
    pub fn decode(&mut self, chunk: Bytes) -> Vec<StreamItem> {
        let mut items = Vec::new();
        let mut offset = 0;

        while offset < chunk.len() {
            if self.mode == StreamMode::Streaming {
                items.push(StreamItem::Pcm(chunk.slice(offset..)));
                break;
            }

            let rest = &chunk[offset..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    offset += pos + 1;
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if self.line.len() + pos > self.max_line_bytes {
                        self.line.clear();
                        items.push(StreamItem::Malformed(ProtocolError::LineTooLong(
                            self.max_line_bytes,
                        )));
                        continue;
                    }
                    self.line.extend_from_slice(&rest[..pos]);
                    let line = self.line.split().freeze();
                    self.handle_line(&line, &mut items);
                }
                None => {
                    offset = chunk.len();
                    if self.discarding {
                        break;
                    }
                    if self.line.len() + rest.len() > self.max_line_bytes {
                        self.line.clear();
                        self.discarding = true;
                        items.push(StreamItem::Malformed(ProtocolError::LineTooLong(
                            self.max_line_bytes,
                        )));
                    } else {
                        self.line.extend_from_slice(rest);
                    }
                }
            }
        }

        items
    }

    fn handle_line(&mut self, line: &[u8], items: &mut Vec<StreamItem>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match parse_line(line) {
            Ok(event) => {
                match event {
                    ControlEvent::FormatAnnounced(_) if self.format_armed => {
                        self.format_armed = false;
                        self.mode = StreamMode::Streaming;
                    }
                    ControlEvent::CaptureStopped => self.mode = StreamMode::Control,
                    _ => {}
                }
                items.push(StreamItem::Control(event));
            }
            Err(err) => items.push(StreamItem::Malformed(err)),
        }
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

/// Parse a control line, retrying from later `{"` positions when the
/// line starts with bytes that are not JSON (stray PCM after a stop).
fn parse_line(line: &[u8]) -> Result<ControlEvent, ProtocolError> {
    match ControlEvent::parse(line) {
        Ok(event) => Ok(event),
        Err(err @ (ProtocolError::MalformedJson(_) | ProtocolError::InvalidUtf8)) => line
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(i, &b)| b == b'{' && line.get(i + 1) == Some(&b'"'))
            .take(MAX_RESYNC_ATTEMPTS)
            .find_map(|(i, _)| ControlEvent::parse(&line[i..]).ok())
            .ok_or(err),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::CaptureFormat;
    use proptest::prelude::*;

    const SESSIONS: &[u8] =
        b"{\"type\":\"audio-sessions\",\"data\":[{\"pid\":123,\"processName\":\"chrome\"}]}\n";
    const FORMAT: &[u8] =
        b"{\"type\":\"capture-format\",\"data\":{\"sampleRate\":48000,\"channels\":2}}\n";

    /// Merge adjacent PCM items so decodings of different chunkings compare equal
    fn normalize(items: Vec<StreamItem>) -> Vec<StreamItem> {
        let mut out: Vec<StreamItem> = Vec::new();
        for item in items {
            if let StreamItem::Pcm(next) = &item {
                if let Some(StreamItem::Pcm(prev)) = out.last_mut() {
                    let mut joined = BytesMut::from(&prev[..]);
                    joined.extend_from_slice(next);
                    *prev = joined.freeze();
                    continue;
                }
            }
            out.push(item);
        }
        out
    }

    fn armed() -> StreamDecoder {
        let mut decoder = StreamDecoder::default();
        decoder.expect_format(true);
        decoder
    }

    fn decode_chunked(stream: &[u8], cuts: &[usize]) -> Vec<StreamItem> {
        let mut decoder = StreamDecoder::new(4096);
        decoder.expect_format(true);
        let mut items = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            if cut > start && cut < stream.len() {
                items.extend(decoder.decode(Bytes::copy_from_slice(&stream[start..cut])));
                start = cut;
            }
        }
        items.extend(decoder.decode(Bytes::copy_from_slice(&stream[start..])));
        normalize(items)
    }

    #[test]
    fn test_format_then_pcm_in_one_chunk() {
        let mut stream = FORMAT.to_vec();
        stream.extend_from_slice(&[0x01, 0x00, 0x02, 0x00]);

        let mut decoder = armed();
        let items = decoder.decode(Bytes::from(stream));

        assert_eq!(
            items,
            vec![
                StreamItem::Control(ControlEvent::FormatAnnounced(CaptureFormat {
                    sample_rate: 48000,
                    channels: 2,
                })),
                StreamItem::Pcm(Bytes::from_static(&[0x01, 0x00, 0x02, 0x00])),
            ]
        );
        assert_eq!(decoder.mode(), StreamMode::Streaming);
        assert!(!decoder.is_format_armed());
    }

    #[test]
    fn test_unarmed_format_keeps_control_mode() {
        let mut stream = FORMAT.to_vec();
        stream.extend_from_slice(&[0x01, 0x00, 0x02, 0x0a]);
        stream.extend_from_slice(b"{\"type\":\"capture-stopped\"}\n");

        let mut decoder = StreamDecoder::default();
        let items = decoder.decode(Bytes::from(stream));

        assert!(matches!(
            items.first(),
            Some(StreamItem::Control(ControlEvent::FormatAnnounced(_)))
        ));
        assert_eq!(
            items.last(),
            Some(&StreamItem::Control(ControlEvent::CaptureStopped))
        );
        assert_eq!(decoder.mode(), StreamMode::Control);
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut decoder = StreamDecoder::default();
        let (head, tail) = SESSIONS.split_at(20);

        assert!(decoder.decode(Bytes::copy_from_slice(head)).is_empty());
        assert_eq!(decoder.pending_bytes(), 20);

        let items = decoder.decode(Bytes::copy_from_slice(tail));
        assert_eq!(items.len(), 1);
        assert!(matches!(
            &items[0],
            StreamItem::Control(ControlEvent::SessionsList(list)) if list[0].pid == 123
        ));
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_malformed_line_does_not_switch_mode() {
        let mut stream = b"{not json}\n".to_vec();
        stream.extend_from_slice(b"\n");
        stream.extend_from_slice(SESSIONS);

        let mut decoder = StreamDecoder::default();
        let items = decoder.decode(Bytes::from(stream));

        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], StreamItem::Malformed(ProtocolError::MalformedJson(_))));
        assert!(matches!(items[1], StreamItem::Control(ControlEvent::SessionsList(_))));
        assert_eq!(decoder.mode(), StreamMode::Control);
    }

    #[test]
    fn test_streaming_forwards_json_looking_bytes() {
        let mut decoder = armed();
        decoder.decode(Bytes::from_static(FORMAT));

        let items = decoder.decode(Bytes::from_static(b"{\"type\":\"capture-stopped\"}\n"));
        assert!(matches!(&items[..], [StreamItem::Pcm(_)]));
        assert_eq!(decoder.mode(), StreamMode::Streaming);
    }

    #[test]
    fn test_resync_after_local_stop() {
        let mut decoder = armed();
        decoder.decode(Bytes::from_static(FORMAT));
        decoder.enter_control_mode();

        let mut trailing = vec![0x13, 0xfe, 0x7b, 0x00, 0x22];
        trailing.extend_from_slice(b"{\"type\":\"capture-stopped\"}\n");
        let items = decoder.decode(Bytes::from(trailing));

        assert_eq!(items, vec![StreamItem::Control(ControlEvent::CaptureStopped)]);
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut decoder = StreamDecoder::new(32);
        let items = decoder.decode(Bytes::from_static(b"0123456789abcdef0123456789abcdefXYZ"));
        assert_eq!(items, vec![StreamItem::Malformed(ProtocolError::LineTooLong(32))]);

        // The rest of the oversized line is skipped, the next line parses.
        let items = decoder.decode(Bytes::from_static(b"more\n{\"type\":\"capture-stopped\"}\n"));
        assert_eq!(items, vec![StreamItem::Control(ControlEvent::CaptureStopped)]);
    }

    #[test]
    fn test_enter_control_mode_clears_partial_line() {
        let mut decoder = StreamDecoder::default();
        decoder.decode(Bytes::from_static(b"{\"type\":\"capt"));
        decoder.enter_control_mode();
        assert_eq!(decoder.pending_bytes(), 0);
        assert_eq!(decoder.mode(), StreamMode::Control);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(
            pcm in proptest::collection::vec(any::<u8>(), 0..256),
            cuts in proptest::collection::vec(0usize..512, 0..12),
        ) {
            let mut cuts = cuts;
            let mut stream = SESSIONS.to_vec();
            stream.extend_from_slice(b"garbage line\n");
            stream.extend_from_slice(b"{\"type\":\"error\",\"message\":\"x\"}\n");
            stream.extend_from_slice(FORMAT);
            stream.extend_from_slice(&pcm);

            cuts.sort_unstable();
            let whole = decode_chunked(&stream, &[]);
            let chunked = decode_chunked(&stream, &cuts);
            prop_assert_eq!(whole, chunked);
        }
    }
}
