//! DNS message inspection and transaction ID rewriting.

use bytes::BytesMut;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;

use crate::error::{ProxyError, Result};
use crate::frame::{Frame, LENGTH_PREFIX};

/// Decode `body` and return the first question's name and the transaction ID.
///
/// The name is returned exactly as decoded (fully qualified, case
/// preserved). Questions after the first are ignored.
pub fn parse_question(body: &[u8]) -> Result<(String, u16)> {
    let message =
        Message::from_bytes(body).map_err(|e| ProxyError::MalformedMessage(e.to_string()))?;

    let query = message
        .queries()
        .first()
        .ok_or_else(|| ProxyError::MalformedMessage("message has no questions".to_string()))?;

    Ok((query.name().to_ascii(), message.id()))
}

/// Return a copy of `frame` answering to transaction `new_id`.
///
/// The body has to decode exactly as for [`parse_question`]. Only the two ID
/// bytes change; the length prefix and the rest of the message are kept
/// byte for byte.
pub fn rewrite_transaction_id(frame: &Frame, new_id: u16) -> Result<Frame> {
    parse_question(frame.body())?;

    let mut wire = BytesMut::from(frame.as_bytes());
    wire[LENGTH_PREFIX..LENGTH_PREFIX + 2].copy_from_slice(&new_id.to_be_bytes());
    Frame::from_wire(wire.freeze())
}
