//! Canonical wire codec for threechain.
//!
//! Everything on the wire is little-endian and bounds-checked. The crate
//! provides:
//!
//! - [`WireEncode`] / [`WireDecode`]: the encoding trait pair, with
//!   `decode(encode(x)) == x` for every entity
//! - [`io`]: byte-level put/get helpers
//! - entity codecs for blocks, certificates, votes, proposals, commands,
//!   and finality records
//! - [`PeerMessage`] / [`ClientMessage`]: framed protocol messages

mod entities;
mod error;
pub mod io;
mod message;

pub use entities::MAX_CMD_PAYLOAD;
pub use error::WireError;
pub use io::{WireDecode, WireEncode};
pub use message::{
    decode_frame_header, ClientMessage, Opcode, PeerMessage, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD,
};
