/// MongoDB wire-protocol framing
///
/// Every message starts with the standard 16-byte header
/// (`messageLength`, `requestID`, `responseTo`, `opCode`, all little-endian
/// `int32`). Bodies are opaque here; document encoding belongs to higher layers.
pub mod handshake;
#[cfg(test)]
pub(crate) mod mock;

use crate::core::codec::{Codec, Frame};
use crate::core::{HandshakeResult, DEFAULT_MAX_MESSAGE_SIZE};
use crate::error::{DriverError, DriverResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the standard message header
pub const HEADER_LENGTH: usize = 16;

pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_MSG: i32 = 2013;

/// An opcode and its opaque body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op_code: i32,
    pub body: Bytes,
}

impl Message {
    pub fn new(op_code: i32, body: impl Into<Bytes>) -> Self {
        Self {
            op_code,
            body: body.into(),
        }
    }

    /// Length of the framed message on the wire
    pub fn framed_len(&self) -> usize {
        HEADER_LENGTH + self.body.len()
    }
}

/// Header-framing codec for [`Message`]s
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_frame_length: usize,
}

impl WireCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: max_frame_length.max(HEADER_LENGTH),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Codec for WireCodec {
    type Request = Message;
    type Reply = Message;

    fn encode(&self, request: &Message, request_id: i32, dst: &mut BytesMut) -> DriverResult<()> {
        let length = i32::try_from(request.framed_len()).map_err(|_| {
            DriverError::protocol(format!(
                "message of {} bytes cannot be framed",
                request.framed_len()
            ))
        })?;

        dst.reserve(request.framed_len());
        dst.put_i32_le(length);
        dst.put_i32_le(request_id);
        dst.put_i32_le(0);
        dst.put_i32_le(request.op_code);
        dst.extend_from_slice(&request.body);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> DriverResult<Option<Frame<Message>>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let length = usize::try_from(declared).unwrap_or(0);
        if length < HEADER_LENGTH || length > self.max_frame_length {
            return Err(DriverError::protocol(format!(
                "invalid message length {} (limit {})",
                declared, self.max_frame_length
            )));
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        frame.advance(4);
        let _request_id = frame.get_i32_le();
        let response_to = frame.get_i32_le();
        let op_code = frame.get_i32_le();

        match op_code {
            OP_REPLY | OP_MSG => Ok(Some(Frame::Reply {
                response_to,
                reply: Message {
                    op_code,
                    body: frame.freeze(),
                },
            })),
            _ => Ok(Some(Frame::Other { op_code })),
        }
    }

    fn identity_request(&self) -> DriverResult<Message> {
        handshake::is_master_query()
    }

    fn parse_identity(&self, reply: &Message) -> DriverResult<HandshakeResult> {
        handshake::parse_is_master(reply)
    }
}
