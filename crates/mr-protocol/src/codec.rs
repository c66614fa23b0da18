//! NUL-delimited JSON framing.
//!
//! Both directions of the host socket carry JSON documents separated by a
//! single `0x00` byte. The decoder accumulates bytes, splits on NUL and
//! yields each non-empty piece as one frame; a partial trailing piece is
//! retained for the next read, so framing is insensitive to how the stream
//! fragments. JSON parsing is left to the caller: a malformed frame must
//! only fail that frame, never the connection.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Delimiter between frames.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Codec for NUL-delimited JSON frames.
///
/// `Decoder` yields raw frame bytes (delimiter stripped, empty frames
/// skipped). `Encoder` appends `json(value) + "\x00"`.
#[derive(Debug, Default)]
pub struct NulCodec;

impl Decoder for NulCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        while let Some(pos) = src.iter().position(|&b| b == FRAME_DELIMITER) {
            let frame = src.split_to(pos + 1).freeze().slice(..pos);
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

impl Encoder<&serde_json::Value> for NulCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        item: &serde_json::Value,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

/// Encode one value into a standalone delimited frame.
///
/// Used by the manual write paths, which drive `try_write` directly so they
/// can apply the short-write retry discipline.
pub fn encode_frame(value: &serde_json::Value) -> Vec<u8> {
    let mut buf = serde_json::to_vec(value).expect("JSON values always serialize");
    buf.push(FRAME_DELIMITER);
    buf
}
