//! Newline-delimited JSON framing for the extension host channel.
//!
//! Each line carries one [`Envelope`]. The codec is driven by a single
//! `FramedRead`, so partial reads are buffered in one place and lines are
//! emitted strictly in arrival order.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::ExtensionError;

const DELIMITER: u8 = b'\n';

/// Codec turning a byte stream into envelopes and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec {
    /// Offset up to which the buffer is known to hold no delimiter.
    next_index: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ExtensionError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, ExtensionError> {
        loop {
            let Some(offset) = buf[self.next_index..]
                .iter()
                .position(|b| *b == DELIMITER)
            else {
                self.next_index = buf.len();
                return Ok(None);
            };

            let line = buf.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            let line = trim_ascii(&line[..line.len() - 1]);
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Envelope>(line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    tracing::warn!(
                        len = line.len(),
                        "dropping malformed line from channel: {e}"
                    );
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, ExtensionError> {
        if let Some(envelope) = self.decode(buf)? {
            return Ok(Some(envelope));
        }
        if !buf.is_empty() {
            tracing::debug!(len = buf.len(), "discarding unterminated trailing line");
            buf.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ExtensionError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ExtensionError> {
        <Self as Encoder<&Envelope>>::encode(self, &item, dst)
    }
}

impl<'a> Encoder<&'a Envelope> for EnvelopeCodec {
    type Error = ExtensionError;

    fn encode(&mut self, item: &'a Envelope, dst: &mut BytesMut) -> Result<(), ExtensionError> {
        let bytes = serde_json::to_vec(item)?;
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::new("getInstalledExtensions", "a1"),
            Envelope::new("get-songs", "b2")
                .with_data(json!({"song": {"title": "multi\nline"}}))
                .with_extension_name("foo"),
            Envelope::new("onStarted", "c3").with_data(json!({})),
            Envelope::new("extraExtensionEvents", "d4")
                .with_data(json!({"type": "requestedSearchResult", "data": ["héllo wörld"]})),
        ]
    }

    fn encode_all(envelopes: &[Envelope]) -> Vec<u8> {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        for env in envelopes {
            codec.encode(env, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<Envelope> {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(env) = codec.decode(&mut buf).unwrap() {
                out.push(env);
            }
        }
        while let Some(env) = codec.decode_eof(&mut buf).unwrap() {
            out.push(env);
        }
        out
    }

    #[test]
    fn test_encode_appends_single_newline() {
        let bytes = encode_all(&[Envelope::new("stopProcess", "x")]);
        assert_eq!(bytes, b"{\"type\":\"stopProcess\",\"channel\":\"x\"}\n");
    }

    #[test]
    fn test_round_trip_at_every_split_point() {
        let envelopes = sample_envelopes();
        let bytes = encode_all(&envelopes);

        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[a, b]), envelopes, "split at {split}");
        }
    }

    #[test]
    fn test_round_trip_byte_by_byte() {
        let envelopes = sample_envelopes();
        let bytes = encode_all(&envelopes);
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), envelopes);
    }

    #[test]
    fn test_round_trip_uneven_chunks() {
        let envelopes = sample_envelopes();
        let bytes = encode_all(&envelopes);
        for size in [2, 3, 7, 13, 64] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(decode_chunks(&chunks), envelopes, "chunk size {size}");
        }
    }

    #[test]
    fn test_malformed_line_is_dropped_without_losing_neighbours() {
        let input = b"{\"type\":\"a\",\"channel\":\"1\"}\n{not json\n{\"type\":\"b\",\"channel\":\"2\"}\n";
        let out = decode_chunks(&[input]);
        let kinds: Vec<&str> = out.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b"]);
    }

    #[test]
    fn test_wrong_shape_json_is_dropped() {
        let input = b"[1,2,3]\n{\"type\":\"ok\",\"channel\":\"1\"}\n";
        let out = decode_chunks(&[input]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, "ok");
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let input = b"\n\r\n{\"type\":\"a\",\"channel\":\"1\"}\r\n";
        let out = decode_chunks(&[input]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, "1");
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"a\",\"chan"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"nel\":\"1\"}\n");
        let env = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(env.kind, "a");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unterminated_tail_discarded_at_eof() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"a\",\"channel\":\"1\"}"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
