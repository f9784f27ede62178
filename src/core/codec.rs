/// Message codec boundary
///
/// Connections never look inside requests or replies. Everything they need, from
/// framing to the identity handshake, goes through this trait.
use super::HandshakeResult;
use crate::error::DriverResult;
use bytes::BytesMut;

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<Rep> {
    /// Reply to the request whose id is `response_to`
    Reply { response_to: i32, reply: Rep },
    /// Any other message; logged and ignored by connections
    Other { op_code: i32 },
}

pub trait Codec: Send + Sync + 'static {
    type Request: Send + 'static;
    type Reply: Send + 'static;

    /// Append the framed bytes for `request` to `dst`.
    fn encode(&self, request: &Self::Request, request_id: i32, dst: &mut BytesMut)
        -> DriverResult<()>;

    /// Split one message off the front of `src`.
    ///
    /// `Ok(None)` means more bytes are needed; `src` must be left untouched then.
    fn decode(&self, src: &mut BytesMut) -> DriverResult<Option<Frame<Self::Reply>>>;

    /// Request that asks a server to describe itself
    fn identity_request(&self) -> DriverResult<Self::Request>;

    /// Interpret the reply to [`Codec::identity_request`].
    fn parse_identity(&self, reply: &Self::Reply) -> DriverResult<HandshakeResult>;
}
