//! Client commands.

use crate::hash::{hash_bytes, Hash};
use std::fmt;

/// An opaque client command.
///
/// The service replicates and orders commands; it never interprets the
/// payload. A command is identified by the blake3 hash of its payload,
/// computed once at construction.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    payload: Vec<u8>,
    hash: Hash,
}

impl Command {
    pub fn new(payload: Vec<u8>) -> Self {
        let hash = hash_bytes(&payload);
        Self { payload, hash }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("hash", &self.hash)
            .field("len", &self.payload.len())
            .finish()
    }
}
