//! DNS-over-TCP framing (RFC 1035 section 4.2.2).
//!
//! Every message on the wire is preceded by its length as a single
//! big-endian `u16`. A [`Frame`] keeps the prefix and the body together so
//! it can be cached and written back without re-encoding.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX: usize = 2;

/// A complete length-prefixed DNS message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    wire: Bytes,
}

impl Frame {
    /// Prepend the big-endian length of `body`
    pub fn encode(body: &[u8]) -> Result<Self> {
        let len = u16::try_from(body.len()).map_err(|_| {
            ProxyError::Framing(format!(
                "message of {} bytes does not fit a 16-bit length prefix",
                body.len()
            ))
        })?;

        let mut wire = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        wire.put_u16(len);
        wire.put_slice(body);
        Ok(Self {
            wire: wire.freeze(),
        })
    }

    /// Wrap bytes that already carry a length prefix, checking it against the body
    pub fn from_wire(wire: Bytes) -> Result<Self> {
        if wire.len() < LENGTH_PREFIX {
            return Err(ProxyError::Framing(format!(
                "{} bytes is shorter than the length prefix",
                wire.len()
            )));
        }
        let declared = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        let actual = wire.len() - LENGTH_PREFIX;
        if declared != actual {
            return Err(ProxyError::Framing(format!(
                "length prefix says {} bytes, body has {}",
                declared, actual
            )));
        }
        Ok(Self { wire })
    }

    /// Prefix and body, ready to be written to a stream
    pub fn as_bytes(&self) -> &[u8] {
        &self.wire
    }

    /// The DNS message without its length prefix
    pub fn body(&self) -> &[u8] {
        &self.wire[LENGTH_PREFIX..]
    }

    /// Total size on the wire, prefix included
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }
}

/// Read exactly one frame, suspending until all of its bytes have arrived
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| framing_io("length prefix", e))?;

    let len = u16::from_be_bytes(prefix) as usize;

    let mut wire = BytesMut::zeroed(LENGTH_PREFIX + len);
    wire[..LENGTH_PREFIX].copy_from_slice(&prefix);
    reader
        .read_exact(&mut wire[LENGTH_PREFIX..])
        .await
        .map_err(|e| framing_io("message body", e))?;

    Ok(Frame {
        wire: wire.freeze(),
    })
}

/// Write a whole frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}

fn framing_io(what: &str, err: std::io::Error) -> ProxyError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProxyError::Framing(format!("stream closed while reading {}", what))
    } else {
        ProxyError::Framing(format!("failed to read {}: {}", what, err))
    }
}
