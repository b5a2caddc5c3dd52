//! Replica-set configuration.

use crate::crypto::PublicKey;
use crate::identifiers::ReplicaId;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors constructing a replica set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicaSetError {
    #[error("replica set is empty")]
    Empty,

    #[error("replica ids must be contiguous from 0, found {0} at position {1}")]
    NonContiguous(ReplicaId, usize),
}

/// A single replica's identity: index, network address, public key.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub addr: SocketAddr,
    pub public_key: PublicKey,
}

/// The ordered, static replica list for a run.
///
/// With `n` replicas the system tolerates `f = ⌊(n - 1) / 3⌋` Byzantine
/// participants and a quorum is `2f + 1` votes.
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    replicas: Vec<ReplicaInfo>,
}

impl ReplicaSet {
    pub fn new(replicas: Vec<ReplicaInfo>) -> Result<Self, ReplicaSetError> {
        if replicas.is_empty() {
            return Err(ReplicaSetError::Empty);
        }
        for (i, r) in replicas.iter().enumerate() {
            if r.id.0 as usize != i {
                return Err(ReplicaSetError::NonContiguous(r.id, i));
            }
        }
        Ok(Self { replicas })
    }

    /// Total number of replicas `n`.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Maximum number of Byzantine replicas tolerated: `⌊(n - 1) / 3⌋`.
    pub fn faulty_allowance(&self) -> usize {
        (self.replicas.len() - 1) / 3
    }

    /// Votes required to mint a quorum certificate: `2f + 1`.
    pub fn quorum_threshold(&self) -> usize {
        2 * self.faulty_allowance() + 1
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        (id.0 as usize) < self.replicas.len()
    }

    pub fn get(&self, id: ReplicaId) -> Option<&ReplicaInfo> {
        self.replicas.get(id.0 as usize)
    }

    pub fn public_key(&self, id: ReplicaId) -> Option<PublicKey> {
        self.get(id).map(|r| r.public_key)
    }

    pub fn addr(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.get(id).map(|r| r.addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.iter()
    }

    /// All replica ids except `me` (broadcast targets).
    pub fn peers_of(&self, me: ReplicaId) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas
            .iter()
            .map(|r| r.id)
            .filter(move |id| *id != me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    fn info(i: u16) -> ReplicaInfo {
        ReplicaInfo {
            id: ReplicaId(i),
            addr: format!("127.0.0.1:{}", 9000 + i).parse().unwrap(),
            public_key: SecretKey::from_bytes(&[i as u8 + 1; 32]).public_key(),
        }
    }

    #[test]
    fn thresholds() {
        let set = ReplicaSet::new((0..4).map(info).collect()).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.faulty_allowance(), 1);
        assert_eq!(set.quorum_threshold(), 3);

        let degenerate = ReplicaSet::new(vec![info(0)]).unwrap();
        assert_eq!(degenerate.faulty_allowance(), 0);
        assert_eq!(degenerate.quorum_threshold(), 1);

        let seven = ReplicaSet::new((0..7).map(info).collect()).unwrap();
        assert_eq!(seven.faulty_allowance(), 2);
        assert_eq!(seven.quorum_threshold(), 5);
    }

    #[test]
    fn rejects_gaps() {
        let mut infos: Vec<_> = (0..3).map(info).collect();
        infos[2].id = ReplicaId(5);
        assert!(matches!(
            ReplicaSet::new(infos),
            Err(ReplicaSetError::NonContiguous(_, 2))
        ));
    }

    #[test]
    fn peers_excludes_self() {
        let set = ReplicaSet::new((0..4).map(info).collect()).unwrap();
        let peers: Vec<_> = set.peers_of(ReplicaId(1)).collect();
        assert_eq!(peers, vec![ReplicaId(0), ReplicaId(2), ReplicaId(3)]);
    }
}
