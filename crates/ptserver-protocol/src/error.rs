use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet header too short: expected 6 bytes, got {0}")]
    HeaderTooShort(usize),

    #[error("unknown packet type: 0x{0:04x}")]
    UnknownPacketType(u16),

    #[error("packet body too large: {0} bytes (max {1})")]
    BodyTooLarge(usize, usize),

    #[error("malformed record-format body: {0}")]
    MalformedRecord(String),

    #[error("obfuscation decode failed (variant {0})")]
    DecodeFailed(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
