//! Length-delimited JSON framing.

use super::TransportError;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Largest payload accepted in either direction (32 MiB).
pub const MAX_FRAME_LENGTH: usize = 32 * 1024 * 1024;

/// Frames `T` as a 4-byte big-endian length followed by its JSON encoding.
pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _item: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").field("max_frame_length", &MAX_FRAME_LENGTH).finish()
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_codec(),
            _item: PhantomData,
        }
    }
}

fn frame_error(err: std::io::Error) -> TransportError {
    let oversized = err.get_ref().is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
    if oversized {
        TransportError::FrameTooLarge { max: MAX_FRAME_LENGTH }
    } else {
        TransportError::Io(err)
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, TransportError> {
        match self.frames.decode(src).map_err(frame_error)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = TransportError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), TransportError> {
        let payload = encode_payload(&item)?;
        self.frames.encode(payload, dst).map_err(frame_error)
    }
}

/// JSON-encode `item`, refusing payloads over [`MAX_FRAME_LENGTH`].
pub fn encode_payload<T: Serialize>(item: &T) -> Result<Bytes, TransportError> {
    let payload = serde_json::to_vec(item)?;
    if payload.len() > MAX_FRAME_LENGTH {
        return Err(TransportError::FrameTooLarge { max: MAX_FRAME_LENGTH });
    }
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{operation, Message};
    use bytes::BufMut;

    #[test]
    fn decodes_partial_frames_once_complete() {
        let mut codec = JsonCodec::<Message>::new();
        let msg = Message::new().with_route("s", "g", "r", operation::UPDATE);
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(msg));
    }

    #[test]
    fn rejects_oversized_inbound_frame() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LENGTH + 1) as u32);
        buf.put_slice(b"{}");
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }), "{err}");
    }

    #[test]
    fn rejects_oversized_outbound_payload() {
        let big = Message::new().with_content("x".repeat(MAX_FRAME_LENGTH));
        let err = encode_payload(&big).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { max } if max == MAX_FRAME_LENGTH));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{x}");
        assert!(matches!(codec.decode(&mut buf), Err(TransportError::Decode(_))));
    }
}
