//! Vote accumulation and QC minting.

use std::collections::BTreeMap;
use threechain_types::{Hash, QuorumCertificate, ReplicaId, Signature};
use tracing::debug;

/// Collects verified votes for one block and mints its quorum certificate
/// exactly once.
///
/// Only signature-verified votes enter; duplicates fold silently. The
/// `BTreeMap` keeps signers ordered by replica id, which is the canonical
/// certificate order.
#[derive(Debug)]
pub struct VoteSet {
    blk_hash: Hash,
    votes: BTreeMap<ReplicaId, Signature>,
    minted: bool,
}

impl VoteSet {
    pub fn new(blk_hash: Hash) -> Self {
        Self {
            blk_hash,
            votes: BTreeMap::new(),
            minted: false,
        }
    }

    /// Record a verified vote. Returns `false` for duplicates.
    pub fn add(&mut self, voter: ReplicaId, signature: Signature) -> bool {
        if self.votes.contains_key(&voter) {
            return false;
        }
        self.votes.insert(voter, signature);
        true
    }

    pub fn contains(&self, voter: ReplicaId) -> bool {
        self.votes.contains_key(&voter)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn is_minted(&self) -> bool {
        self.minted
    }

    /// Mint the certificate if the quorum threshold is met and it has not
    /// been minted before. At most one certificate ever leaves a vote set.
    pub fn try_mint(&mut self, threshold: usize) -> Option<QuorumCertificate> {
        if self.minted || self.votes.len() < threshold {
            return None;
        }
        self.minted = true;
        debug!(
            blk = %self.blk_hash.short(),
            votes = self.votes.len(),
            threshold,
            "minting quorum certificate"
        );
        Some(QuorumCertificate::new(
            self.blk_hash,
            self.votes.iter().map(|(id, sig)| (*id, *sig)).collect(),
        ))
    }
}
