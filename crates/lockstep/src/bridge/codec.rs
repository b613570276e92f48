//! Framed codec for worker connections.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for the body. A frame on
//! the wire is a 4-byte big-endian length followed by exactly that many bytes
//! of JSON text, so the receiver always knows where a frame ends.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::frame::StateFrame;

/// Width of the length prefix in bytes.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Largest frame body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Outbound frame whose body would exceed [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Transport failures (reset, broken pipe) as opposed to bad bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Encode a frame into its complete wire form (prefix + body).
pub fn encode(frame: &StateFrame) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    <FrameCodec as Encoder<&StateFrame>>::encode(&mut FrameCodec::new(), frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one frame from `bytes`.
///
/// The buffer must hold one whole frame and nothing else: a short prefix, a
/// short body or trailing bytes are all malformed.
pub fn decode(bytes: &[u8]) -> Result<StateFrame, FrameError> {
    let mut src = bytes;
    if src.len() < LENGTH_FIELD_LEN {
        return Err(FrameError::malformed(format!(
            "truncated length prefix ({} of {LENGTH_FIELD_LEN} bytes)",
            src.len()
        )));
    }
    let len = src.get_u32() as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::malformed(format!(
            "length prefix {len} exceeds limit of {MAX_FRAME_LEN} bytes"
        )));
    }
    match src.len().cmp(&len) {
        std::cmp::Ordering::Less => Err(FrameError::malformed(format!(
            "truncated body ({} of {len} bytes)",
            src.len()
        ))),
        std::cmp::Ordering::Greater => Err(FrameError::malformed(format!(
            "{} trailing bytes after frame",
            src.len() - len
        ))),
        std::cmp::Ordering::Equal => parse_body(src),
    }
}

fn parse_body(body: &[u8]) -> Result<StateFrame, FrameError> {
    serde_json::from_slice(body).map_err(|e| FrameError::malformed(e.to_string()))
}

/// Stream codec for [`StateFrame`]s.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_LEN)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = StateFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src) {
            Ok(Some(body)) => parse_body(&body).map(Some),
            Ok(None) => Ok(None),
            // LengthDelimitedCodec reports an oversized prefix as InvalidData.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(FrameError::malformed(e.to_string()))
            }
            Err(e) => Err(FrameError::Io(e)),
        }
    }
}

impl Encoder<&StateFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &StateFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item).map_err(|e| FrameError::malformed(e.to_string()))?;
        if json.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len: json.len(),
                max: MAX_FRAME_LEN,
            });
        }
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(LENGTH_FIELD_LEN + json.len());
        dst.put_u32(json.len() as u32);
        dst.extend_from_slice(&json);
        Ok(())
    }
}

impl Encoder<StateFrame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: StateFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&StateFrame>>::encode(self, &item, dst)
    }
}
