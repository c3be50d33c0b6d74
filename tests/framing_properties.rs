//! Property-based tests for the wire layer.
//!
//! Verifies the framing invariants:
//! 1. Chunking the inbound byte stream arbitrarily never changes the
//!    decoded line sequence.
//! 2. Split outbound payloads stay within the wire limit and reassemble
//!    to the original text.
//! 3. The flood limiter never lets more than its budget through in any
//!    window.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use proptest::prelude::*;
use tokio_util::codec::Decoder;

use cinder::codec::LineCodec;
use cinder::queue::{OutboundQueue, FLOOD_LINES, MAX_WIRE_LINE};

/// Printable line content without CR/LF.
fn line_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[ -~]{0,120}").expect("valid regex")
}

/// A batch of lines plus an arbitrary chunking pattern.
fn stream_strategy() -> impl Strategy<Value = (Vec<String>, Vec<usize>)> {
    (
        prop::collection::vec(line_strategy(), 1..12),
        prop::collection::vec(1usize..32, 1..16),
    )
}

fn decode_stream(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(Some(line)) = codec.decode(buf) {
        out.push(line);
    }
    out
}

proptest! {
    #[test]
    fn prop_chunking_never_changes_decoded_lines((lines, chunks) in stream_strategy()) {
        let mut stream = Vec::new();
        for line in &lines {
            stream.extend_from_slice(line.as_bytes());
            stream.extend_from_slice(b"\r\n");
        }

        // Whole-stream reference.
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&stream[..]);
        let expect = decode_stream(&mut codec, &mut buf);

        // Chunked feed, chunk sizes cycling through the pattern.
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let mut got = Vec::new();
        let mut offset = 0;
        let mut pick = 0;
        while offset < stream.len() {
            let size = chunks[pick % chunks.len()].min(stream.len() - offset);
            pick += 1;
            buf.extend_from_slice(&stream[offset..offset + size]);
            offset += size;
            got.extend(decode_stream(&mut codec, &mut buf));
        }

        prop_assert_eq!(got, expect);
    }

    #[test]
    fn prop_split_lines_bounded_and_lossless(payload in "[ -~]{1,2000}") {
        let mut queue = OutboundQueue::new();
        queue.privmsg("#chan", &payload);

        let mut collected = String::new();
        let mut now = Instant::now();
        while !queue.is_empty() {
            for line in queue.drain(now) {
                prop_assert!(line.len() <= MAX_WIRE_LINE);
                let body = line
                    .strip_prefix("PRIVMSG #chan :")
                    .and_then(|s| s.strip_suffix("\r\n"))
                    .expect("well-formed wire line");
                collected.push_str(body);
            }
            now += Duration::from_secs(2);
        }

        // Markup rewriting is the identity for bracket-free payloads.
        if !payload.contains('[') {
            prop_assert_eq!(collected, payload);
        }
    }

    #[test]
    fn prop_flood_window_holds(count in 1usize..40) {
        let mut queue = OutboundQueue::new();
        for i in 0..count {
            queue.privmsg("#c", &format!("message {i}"));
        }

        let base = Instant::now();
        let mut emissions: Vec<(u64, usize)> = Vec::new();
        for step in 0..400u64 {
            let at_ms = step * 100;
            let sent = queue.drain(base + Duration::from_millis(at_ms)).len();
            if sent > 0 {
                emissions.push((at_ms, sent));
            }
            if queue.is_empty() {
                break;
            }
        }

        prop_assert!(queue.is_empty());

        // No 1-second window carries more than the flood budget.
        for &(start, _) in &emissions {
            let in_window: usize = emissions
                .iter()
                .filter(|&&(t, _)| t >= start && t < start + 1000)
                .map(|&(_, n)| n)
                .sum();
            prop_assert!(
                in_window <= FLOOD_LINES,
                "window at {}ms carried {} lines",
                start,
                in_window
            );
        }

        let total: usize = emissions.iter().map(|&(_, n)| n).sum();
        prop_assert_eq!(total, count);
    }
}
