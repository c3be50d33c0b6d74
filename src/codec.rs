//! Inbound line reassembly.
//!
//! [`LineCodec`] accumulates bytes until LF, then cleans the completed
//! line: CR and the formatting control bytes (bold 0x02, underline 0x1F,
//! reverse 0x16, reset 0x0F) are stripped, and mIRC colour sequences
//! (`0x03` + up to two digits + optional `,X`/`,XY`) are removed. Cleaning
//! operates on the whole line, so the output is identical no matter how the
//! byte stream was chunked.
//!
//! Oversized lines are discarded up to the next LF; malformed UTF-8 is
//! replaced rather than rejected.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Longest inbound line we will buffer before discarding.
pub const MAX_INBOUND_LINE: usize = 1024;

/// Strip CR, formatting control bytes, and colour sequences from one
/// completed line.
pub fn clean_line(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        match raw[i] {
            b'\r' | b'\n' | 0x02 | 0x1f | 0x16 | 0x0f => i += 1,
            0x03 => {
                i += 1;
                // X or XY
                if i < raw.len() && raw[i].is_ascii_digit() {
                    i += 1;
                    if i < raw.len() && raw[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                // ,X or ,XY; the comma survives when no digit follows
                if i + 1 < raw.len() && raw[i] == b',' && raw[i + 1].is_ascii_digit() {
                    i += 2;
                    if i < raw.len() && raw[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Decoder yielding cleaned lines from the inbound byte stream.
#[derive(Debug, Default)]
pub struct LineCodec {
    discarding: bool,
}

impl LineCodec {
    /// Create a codec with an empty reassembly buffer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            match buf.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    let line = buf.split_to(idx + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    return Ok(Some(clean_line(&line)));
                }
                None => {
                    if buf.len() > MAX_INBOUND_LINE {
                        // Protocol garbage, drop through the next LF
                        self.discarding = true;
                        buf.advance(buf.len());
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, bytes: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Ok(Some(line)) = codec.decode(&mut buf) {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_strip_cr_and_formatting() {
        assert_eq!(clean_line(b"PING :abc\r"), "PING :abc");
        assert_eq!(clean_line(b"\x02bold\x02 \x1fu\x1f \x16r\x16 \x0f"), "bold u r ");
    }

    #[test]
    fn test_strip_color_sequences() {
        assert_eq!(clean_line(b"\x034red"), "red");
        assert_eq!(clean_line(b"\x0304red"), "red");
        assert_eq!(clean_line(b"\x0304,07red"), "red");
        assert_eq!(clean_line(b"\x034,7red"), "red");
    }

    #[test]
    fn test_color_comma_kept_without_digit() {
        assert_eq!(clean_line(b"\x0304,x"), ",x");
        assert_eq!(clean_line(b"\x0304,"), ",");
    }

    #[test]
    fn test_decode_lines() {
        let mut codec = LineCodec::new();
        let lines = decode_all(&mut codec, b":a PRIVMSG #c :hi\r\nPING :x\r\n");
        assert_eq!(lines, vec![":a PRIVMSG #c :hi", "PING :x"]);
    }

    #[test]
    fn test_decode_partial() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PING :a"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"bc\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :abc"));
    }

    #[test]
    fn test_oversized_line_discarded() {
        let mut codec = LineCodec::new();
        let mut big = vec![b'x'; MAX_INBOUND_LINE + 10];
        let mut buf = BytesMut::from(&big[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        big.clear();
        big.extend_from_slice(b"tail\r\nPING :ok\r\n");
        buf.extend_from_slice(&big);
        // The oversized line's tail goes with it; the next line survives.
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :ok"));
    }

    #[test]
    fn test_chunking_is_invisible() {
        let stream = b":srv 001 bot :hi\r\n\x0312:alice!a@h PRIVMSG #c :he\x02llo\r\nPING :z\r\n";

        let mut whole = LineCodec::new();
        let expect = decode_all(&mut whole, stream);

        for chunk in [1usize, 2, 3, 7] {
            let mut codec = LineCodec::new();
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                buf.extend_from_slice(piece);
                while let Ok(Some(line)) = codec.decode(&mut buf) {
                    got.push(line);
                }
            }
            assert_eq!(got, expect, "chunk size {chunk}");
        }
    }
}
