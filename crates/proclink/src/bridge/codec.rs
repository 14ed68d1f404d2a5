//! Framed codec for link traffic.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! A frame whose body is not valid JSON for `T` does not poison the stream:
//! the decoder yields `Err(MalformedFrame)` as an item and keeps reading.
//! Only framing failures (truncated length prefix, oversize frame, I/O) are
//! returned as `io::Error`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side will accept.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A complete frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed frame ({len} bytes): {reason}")]
pub struct MalformedFrame {
    pub reason: String,
    pub len: usize,
}

impl MalformedFrame {
    pub fn new(reason: impl Into<String>, len: usize) -> Self {
        Self {
            reason: reason.into(),
            len,
        }
    }
}

/// Codec that frames messages with length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, MalformedFrame>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| MalformedFrame::new(e.to_string(), bytes.len()));
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Envelope;
    use serde_json::json;

    fn raw_frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn codec_roundtrip_envelope() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let env = Envelope::new("myMainEvent", json!({"some": "data", "n": [1, 2, {"x": null}]}));
        codec.encode(env.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Envelope>::new();
        let full = raw_frame(br#"{"event":"ready","data":null}"#);

        let mut buf = BytesMut::from(&full[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[6..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded.event, "ready");
    }

    #[test]
    fn malformed_body_is_an_item_not_a_stream_error() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = raw_frame(b"not json at all");
        buf.extend_from_slice(&raw_frame(br#"{"event":"after","data":1}"#));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let err = first.unwrap_err();
        assert_eq!(err.len, 15);

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.event, "after");
        assert_eq!(second.data, json!(1));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = raw_frame(br#"{"data":{"no":"event"}}"#);

        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(item.is_err());
    }
}
