//! Length-delimited JSON codec for QUIC streams.
//!
//! Wire format: 4-byte big-endian length prefix + serde JSON payload.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::Message;
use crate::params::PARAMS;
use crate::ProtocolError;

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for framing Message values over a byte stream.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > PARAMS.max_message_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: PARAMS.max_message_bytes,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let msg_bytes = src.split_to(length);

        let message: Message = serde_json::from_slice(&msg_bytes)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > PARAMS.max_message_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: PARAMS.max_message_bytes,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
