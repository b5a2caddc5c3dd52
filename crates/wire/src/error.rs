//! Wire codec errors.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("trailing garbage: {0} bytes left after decode")]
    TrailingBytes(usize),

    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("length {got} exceeds limit {limit}")]
    OverLimit { got: usize, limit: usize },
}
