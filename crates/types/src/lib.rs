//! Core types for threechain consensus.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Primitives**: [`Hash`], Ed25519 keys and signatures
//! - **Identifiers**: [`ReplicaId`], [`Height`]
//! - **Consensus entities**: [`Command`], [`Block`], [`QuorumCertificate`],
//!   [`Vote`], [`Proposal`], [`Finality`]
//! - **Configuration**: [`ReplicaSet`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained and depends on no other workspace crates,
//! making it the foundation layer. Entities reference each other by hash;
//! the block store owns the canonical instances.

mod block;
mod command;
mod crypto;
mod finality;
mod hash;
mod identifiers;
mod quorum_certificate;
mod replica_set;

pub use block::Block;
pub use command::Command;
pub use crypto::{verify, CryptoError, PublicKey, SecretKey, Signature};
pub use finality::{Decision, Finality};
pub use hash::{hash_bytes, Hash};
pub use identifiers::{Height, ReplicaId};
pub use quorum_certificate::{QcError, QuorumCertificate};
pub use replica_set::{ReplicaInfo, ReplicaSet, ReplicaSetError};

/// A replica's vote for a block.
///
/// The signature covers the 32-byte block hash. `bqc_hash` names the branch
/// head the voter was extending, so the recipient can materialize the same
/// branch before counting the vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    /// Replica that cast this vote.
    pub voter: ReplicaId,
    /// Hash of the block voted for.
    pub blk_hash: Hash,
    /// The voter's branch-head hash at voting time.
    pub bqc_hash: Hash,
    /// Signature over `blk_hash`.
    pub signature: Signature,
}

impl Vote {
    /// Create and sign a vote.
    pub fn new(voter: ReplicaId, blk_hash: Hash, bqc_hash: Hash, key: &SecretKey) -> Self {
        let signature = key.sign(blk_hash.as_bytes());
        Self {
            voter,
            blk_hash,
            bqc_hash,
            signature,
        }
    }

    /// Check the vote signature against the voter's public key.
    pub fn verify(&self, public_key: &PublicKey) -> Result<(), CryptoError> {
        verify(public_key, self.blk_hash.as_bytes(), &self.signature)
    }
}

/// A proposer's announcement of a new block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// The proposing replica.
    pub proposer: ReplicaId,
    /// The proposer's branch-head hash (the QC it extends).
    pub bqc_hash: Hash,
    /// The proposed block, carried in full.
    pub block: Block,
}
