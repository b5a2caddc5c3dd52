//! Consensus blocks.

use crate::hash::{hash_bytes, Hash};
use crate::identifiers::Height;
use crate::quorum_certificate::QuorumCertificate;
use std::fmt;

/// The unit of consensus.
///
/// A block references its parents and its contained commands by hash, plus
/// an optional justifying quorum certificate for an ancestor (`justify`).
/// The first parent is the *main parent*: the chain walked by the commit
/// rule. The block's identity is the blake3 digest of its canonical byte
/// form, so the reference graph is acyclic by construction.
///
/// `height` and `delivered` are local bookkeeping, not part of the identity:
/// height is derived from the main parent when the block store marks the
/// block delivered (all parents and the justify target materialized).
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    parent_hashes: Vec<Hash>,
    cmd_hashes: Vec<Hash>,
    justify: Option<QuorumCertificate>,
    hash: Hash,
    height: Height,
    delivered: bool,
}

impl Block {
    /// Build a block from its identity fields. Not yet delivered.
    pub fn new(
        parent_hashes: Vec<Hash>,
        cmd_hashes: Vec<Hash>,
        justify: Option<QuorumCertificate>,
    ) -> Self {
        let hash = Self::compute_hash(&parent_hashes, &cmd_hashes, justify.as_ref());
        Self {
            parent_hashes,
            cmd_hashes,
            justify,
            hash,
            height: Height(0),
            delivered: false,
        }
    }

    /// The unique genesis block: no parents, no commands, no certificate.
    /// Pre-delivered at height 0.
    pub fn genesis() -> Self {
        let mut blk = Self::new(vec![], vec![], None);
        blk.delivered = true;
        blk
    }

    /// Canonical hash preimage: little-endian counts followed by the raw
    /// field bytes. Covers parents, commands, and the justify certificate.
    fn compute_hash(
        parents: &[Hash],
        cmds: &[Hash],
        justify: Option<&QuorumCertificate>,
    ) -> Hash {
        let mut buf = Vec::with_capacity(8 + 32 * (parents.len() + cmds.len()));
        buf.extend_from_slice(&(parents.len() as u32).to_le_bytes());
        for p in parents {
            buf.extend_from_slice(p.as_bytes());
        }
        buf.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
        for c in cmds {
            buf.extend_from_slice(c.as_bytes());
        }
        match justify {
            None => buf.push(0),
            Some(qc) => {
                buf.push(1);
                buf.extend_from_slice(qc.block_hash.as_bytes());
                buf.extend_from_slice(&(qc.signers.len() as u32).to_le_bytes());
                for (id, sig) in &qc.signers {
                    buf.extend_from_slice(&id.0.to_le_bytes());
                    buf.extend_from_slice(sig.as_bytes());
                }
            }
        }
        hash_bytes(&buf)
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn parent_hashes(&self) -> &[Hash] {
        &self.parent_hashes
    }

    /// The main parent, `None` only for genesis.
    pub fn main_parent(&self) -> Option<Hash> {
        self.parent_hashes.first().copied()
    }

    pub fn cmd_hashes(&self) -> &[Hash] {
        &self.cmd_hashes
    }

    pub fn justify(&self) -> Option<&QuorumCertificate> {
        self.justify.as_ref()
    }

    /// Hash of the block the justify certificate points at.
    pub fn qc_ref(&self) -> Option<Hash> {
        self.justify.as_ref().map(|qc| qc.block_hash)
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty()
    }

    /// Record delivery at the given height. Called by the block store once
    /// all dependencies are materialized; idempotent marking is enforced
    /// there.
    pub fn mark_delivered(&mut self, height: Height) {
        self.height = height;
        self.delivered = true;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash)
            .field("height", &self.height.0)
            .field("parents", &self.parent_hashes.len())
            .field("cmds", &self.cmd_hashes.len())
            .field("justify", &self.qc_ref())
            .field("delivered", &self.delivered)
            .finish()
    }
}
