//! Packet framing: `[type:u16 BE][version:u16 BE][length:u16 BE][body]`.
//!
//! Source drives this off a hand-rolled header-peek + body-pending state
//! machine built on `recvmsg`/`sendmsg` iovecs (`packet_in`/`packet_out` in
//! `packet.c`), with reference-counted outbound packets resumed across
//! partial writes. `tokio::io::AsyncReadExt::read_exact` already retries
//! partial reads internally, so the peek/pending split collapses to two
//! straight-line reads; likewise `write_all` subsumes the iovec bookkeeping
//! for outbound packets. The wire-visible framing and ordering are unchanged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::wire::PROTOCOL_VERSION;

pub const HEADER_LEN: usize = 6;

/// Largest body we will allocate for an inbound packet. Source has no
/// explicit cap (it trusts the 16-bit length field and `calloc`s blindly);
/// since a 16-bit length already bounds this to 65535, no separate
/// configurable limit is needed.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ptype: u16,
    pub version: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn new(ptype: u16, body: impl Into<Bytes>) -> Self {
        Frame { ptype, version: PROTOCOL_VERSION, body: body.into() }
    }

    pub fn empty(ptype: u16) -> Self {
        Self::new(ptype, Bytes::new())
    }

    /// Serializes this frame to the wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        buf.put_u16(self.ptype);
        buf.put_u16(self.version);
        buf.put_u16(self.body.len() as u16);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Reads one frame from `r`, or `Ok(None)` on a clean EOF before any header
/// bytes arrive (mirrors `packet_in`'s `!br => ctx->disconnect++`).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Frame>, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtocolError::Io(e)),
    }

    let mut hdr = &header[..];
    let ptype = hdr.get_u16();
    let version = hdr.get_u16();
    let length = hdr.get_u16() as usize;

    let mut body = BytesMut::zeroed(length);
    if length > 0 {
        r.read_exact(&mut body).await?;
    }

    Ok(Some(Frame { ptype, version, body: body.freeze() }))
}

/// Writes one frame, fully draining it (the tokio equivalent of resuming a
/// partially-sent packet across `packet_out` calls until `remaining` hits 0).
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), ProtocolError> {
    w.write_all(&frame.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_frame_with_body() {
        let frame = Frame::new(0xfb84, Bytes::from_static(b"hello"));
        let encoded = frame.encode();

        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.ptype, 0xfb84);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(&decoded.body[..], b"hello");
    }

    #[tokio::test]
    async fn round_trip_empty_body() {
        let frame = Frame::empty(0x04a6);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_LEN);

        let mut cursor = std::io::Cursor::new(encoded.to_vec());
        let decoded = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decoded.body.len(), 0);
    }

    #[tokio::test]
    async fn clean_eof_before_header_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(1, Bytes::from_static(b"a")).encode());
        buf.extend_from_slice(&Frame::new(2, Bytes::from_static(b"bb")).encode());

        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let f1 = read_frame(&mut cursor).await.unwrap().unwrap();
        let f2 = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(f1.ptype, 1);
        assert_eq!(&f1.body[..], b"a");
        assert_eq!(f2.ptype, 2);
        assert_eq!(&f2.body[..], b"bb");
    }
}
