//! Finality records returned to clients.

use crate::hash::Hash;
use crate::identifiers::ReplicaId;
use std::fmt;

/// Outcome code carried in a [`Finality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Decision {
    /// The replica contacted is not the current proposer; `decided_by`
    /// carries the proposer to retry at.
    NotProposer = -1,
    /// The command's block was rejected.
    Rejected = 0,
    /// The command was executed by the replicated state machine.
    Committed = 1,
}

impl Decision {
    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            -1 => Some(Decision::NotProposer),
            0 => Some(Decision::Rejected),
            1 => Some(Decision::Committed),
            _ => None,
        }
    }
}

/// Proof of a command's fate, sent to the submitting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finality {
    /// Replica answering: the executing replica for a commit, or the
    /// proposer to retry at for `NotProposer`.
    pub decided_by: ReplicaId,
    pub decision: Decision,
    /// Hash of the committed block; zero for `NotProposer`.
    pub blk_hash: Hash,
    pub cmd_hash: Hash,
    /// Position of the command inside the committed block.
    pub position: u32,
}

impl Finality {
    pub fn committed(decided_by: ReplicaId, blk_hash: Hash, cmd_hash: Hash, position: u32) -> Self {
        Self {
            decided_by,
            decision: Decision::Committed,
            blk_hash,
            cmd_hash,
            position,
        }
    }

    /// The sentinel returned by a replica that is not the current proposer.
    pub fn not_proposer(proposer: ReplicaId, cmd_hash: Hash) -> Self {
        Self {
            decided_by: proposer,
            decision: Decision::NotProposer,
            blk_hash: Hash::ZERO,
            cmd_hash,
            position: 0,
        }
    }
}

impl fmt::Display for Finality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<fin {:?} decided_by={} blk={} cmd={} pos={}>",
            self.decision,
            self.decided_by,
            self.blk_hash.short(),
            self.cmd_hash.short(),
            self.position
        )
    }
}
