//! Quorum certificates.

use crate::crypto::{verify, Signature};
use crate::hash::Hash;
use crate::identifiers::ReplicaId;
use crate::replica_set::ReplicaSet;
use thiserror::Error;

/// Reasons a quorum certificate fails verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QcError {
    #[error("quorum certificate has {got} signers, need {need}")]
    BelowQuorum { got: usize, need: usize },

    #[error("duplicate signer {0}")]
    DuplicateSigner(ReplicaId),

    #[error("signer {0} is not in the replica set")]
    UnknownSigner(ReplicaId),

    #[error("signature from {0} does not verify")]
    BadSignature(ReplicaId),
}

/// Attestation that at least `2f + 1` distinct replicas voted for a block.
///
/// The certificate carries the quorum's individual signatures, each covering
/// the 32-byte block hash, sorted by replica id. Minting happens exactly once
/// per block, in the vote accumulator, from signatures that were already
/// verified individually; `verify` re-checks everything and is what remote
/// replicas run on certificates embedded in blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumCertificate {
    /// The block this certificate attests to.
    pub block_hash: Hash,
    /// `(replica, signature)` pairs, strictly ascending by replica id.
    pub signers: Vec<(ReplicaId, Signature)>,
}

impl QuorumCertificate {
    /// Build a certificate from collected signatures. Sorts by replica id.
    pub fn new(block_hash: Hash, mut signers: Vec<(ReplicaId, Signature)>) -> Self {
        signers.sort_by_key(|(id, _)| *id);
        Self {
            block_hash,
            signers,
        }
    }

    /// Verify the certificate against the replica-set configuration.
    ///
    /// Checks the signer count against the quorum threshold, signer
    /// distinctness and membership, and every signature.
    pub fn verify(&self, replicas: &ReplicaSet) -> Result<(), QcError> {
        let need = replicas.quorum_threshold();
        if self.signers.len() < need {
            return Err(QcError::BelowQuorum {
                got: self.signers.len(),
                need,
            });
        }

        let mut last: Option<ReplicaId> = None;
        for (id, sig) in &self.signers {
            if last == Some(*id) {
                return Err(QcError::DuplicateSigner(*id));
            }
            last = Some(*id);

            let key = replicas
                .public_key(*id)
                .ok_or(QcError::UnknownSigner(*id))?;
            verify(&key, self.block_hash.as_bytes(), sig)
                .map_err(|_| QcError::BadSignature(*id))?;
        }
        Ok(())
    }
}
