use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while encoding or decoding a pickle
/// stream. All variants are fatal to the current `dump`/`load` call;
/// there is no partial-result recovery.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A value has no representation in the stream (no usable reduction,
    /// or a reduction of the wrong shape).
    #[error("cannot pickle {0}")]
    Pickling(String),
    /// Malformed or unsupported opcode stream.
    #[error("invalid pickle stream: {0}")]
    Unpickling(String),
    /// An opcode byte outside the protocol 0-2 set.
    #[error("unknown pickle opcode: 0x{0:02x}")]
    UnknownOpcode(u8),
    /// A GET-family opcode referenced a memo id that was never stored.
    #[error("memo id {0} not found")]
    BadPickleGet(u32),
    /// Source exhausted before an expected read completed.
    #[error("unexpected end of pickle stream")]
    UnexpectedEof,
    /// An opcode needed more operands than the stack holds.
    #[error("pickle stack underflow")]
    StackUnderflow,
    /// A PROTO byte (or a requested protocol) above the supported range.
    #[error("unsupported pickle protocol: {0}")]
    UnsupportedProtocol(u8),
    /// A text payload that is not valid UTF-8.
    #[error("invalid UTF-8 in pickle string")]
    InvalidUtf8,
    /// Numeric argument outside its representable range: negative
    /// lengths, oversized prefixes, out-of-bounds memo indices.
    #[error("value out of range: {0}")]
    OutOfRange(String),
    /// The underlying byte sink or source failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}
