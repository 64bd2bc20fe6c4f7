//! Incremental line decoder for `text/event-stream` response bodies.
//!
//! Chunks are buffered as raw bytes and only complete lines are converted to
//! text, so a multi-byte character split across two chunks decodes the same
//! as if it had arrived whole.

use bytes::BytesMut;
use tracing::warn;

const DATA_PREFIX: &[u8] = b"data: ";
const INITIAL_CAPACITY: usize = 8192;

/// Longest line held while waiting for its newline. Longer lines are dropped.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Reassembles `data: ` lines from arbitrarily fragmented body chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    /// Set while skipping the rest of an oversized line.
    discarding: bool,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            scanned: 0,
            discarding: false,
        }
    }

    /// Appends a body chunk and returns the payload of every `data: ` line it
    /// completed, in order.
    ///
    /// The trailing partial line stays buffered until a later chunk ends it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let newline_pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(newline_pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            line.truncate(newline_pos);
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_LEN {
            warn!(event = "frame_line_too_long", len = self.buffer.len());
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        payloads
    }

    /// Flushes the residual line left when the body ends without a newline.
    pub fn finish(&mut self) -> Option<String> {
        let line = self.buffer.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        data_payload(&line)
    }

    /// Number of bytes held for an incomplete line.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?;

    match std::str::from_utf8(payload) {
        Ok(text) => Some(text.to_string()),
        Err(err) => {
            warn!(event = "frame_invalid_utf8", error = %err, len = payload.len());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{FrameDecoder, MAX_LINE_LEN};
    use crate::stream::proto::{decode_frame, BookingEvent, StreamFrame};

    const STREAM: &str = concat!(
        "data: {\"type\":\"connected\",\"message\":\"ok\"}\n\n",
        ": keep-alive comment\n\n",
        "data: {\"event_class\":\"BOOKING_UPDATED\",\"event_id\":\"evt-1\",\"booking_id\":\"booking-123\",\"updated_at\":\"2024-01-01T00:00:00Z\",\"metadata\":{\"note\":\"café ☕\"}}\r\n\r\n",
        "data: {broken\n\n",
        "event: BOOKING_UPDATED\n",
        "data: {\"event_class\":\"BOOKING_UPDATED\",\"event_id\":\"evt-2\",\"booking_id\":\"booking-123\",\"transaction_id\":\"txn-2\",\"updated_at\":\"2024-01-01T00:00:01Z\",\"metadata\":{}}\n\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<BookingEvent> {
        let mut decoder = FrameDecoder::new();
        let mut payloads = Vec::new();
        for chunk in chunks {
            payloads.extend(decoder.push(chunk));
        }
        payloads.extend(decoder.finish());

        payloads
            .iter()
            .filter_map(|payload| match decode_frame(payload) {
                Ok(StreamFrame::Booking(event)) => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn whole_stream_yields_booking_events_in_order() {
        let events = decode_chunks(&[STREAM.as_bytes()]);
        let ids: Vec<_> = events.iter().map(|event| event.event_id.as_str()).collect();
        assert_eq!(ids, ["evt-1", "evt-2"]);
        assert_eq!(
            events[0].metadata.get("note").and_then(|v| v.as_str()),
            Some("café ☕")
        );
    }

    #[test]
    fn partial_line_is_held_until_newline_arrives() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":").is_empty());
        assert_eq!(decoder.buffered_len(), 14);
        let payloads = decoder.push(b"\"connected\"}\n\n");
        assert_eq!(payloads, vec!["{\"type\":\"connected\"}".to_string()]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(b"event: BOOKING_UPDATED\nid: 4\n: comment\ndata:nospace\n\n");
        assert!(payloads.is_empty());
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(b"data: {}\r\n"), vec!["{}".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_final_line() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"a\":1}").is_empty());
        assert_eq!(decoder.finish(), Some("{\"a\":1}".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn multibyte_character_split_across_chunks_survives() {
        let bytes = STREAM.as_bytes();
        let split = STREAM.find('☕').expect("marker present") + 1;
        assert_eq!(
            decode_chunks(&[&bytes[..split], &bytes[split..]]),
            decode_chunks(&[bytes])
        );
    }

    #[test]
    fn oversized_line_is_dropped_and_decoding_resumes() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: ").is_empty());
        let filler = vec![b'x'; 64 * 1024];
        let mut pushed = 0;
        while pushed <= MAX_LINE_LEN {
            assert!(decoder.push(&filler).is_empty());
            pushed += filler.len();
        }
        assert!(decoder.buffered_len() <= MAX_LINE_LEN);

        let payloads = decoder.push(b"xxx\n\ndata: {\"type\":\"connected\"}\n\n");
        assert_eq!(payloads, vec!["{\"type\":\"connected\"}".to_string()]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn byte_at_a_time_input_matches_whole_input() {
        let chunks: Vec<&[u8]> = STREAM.as_bytes().chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), decode_chunks(&[STREAM.as_bytes()]));
    }

    proptest! {
        #[test]
        fn chunking_never_changes_decoded_events(
            mut cuts in prop::collection::vec(0..STREAM.len(), 0..12)
        ) {
            cuts.sort_unstable();
            cuts.dedup();

            let bytes = STREAM.as_bytes();
            let mut chunks = Vec::with_capacity(cuts.len() + 1);
            let mut start = 0;
            for cut in cuts {
                chunks.push(&bytes[start..cut]);
                start = cut;
            }
            chunks.push(&bytes[start..]);

            prop_assert_eq!(decode_chunks(&chunks), decode_chunks(&[bytes]));
        }
    }
}
