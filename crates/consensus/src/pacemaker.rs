//! Proposer-election policies.
//!
//! A pacemaker decides who proposes and when. The consensus core is policy
//! agnostic: it consults the pacemaker for the current proposer, the vote
//! target, and the parent list, and forwards liveness signals (QC
//! completion, impeachment) to it. The round-robin variant below is the
//! default; other policies implement the same trait.

use threechain_core::{Action, Event};
use threechain_store::BlockStore;
use threechain_types::{Hash, ReplicaId};
use tracing::{debug, info};

/// Proposer-election policy surfaced to the consensus core.
///
/// `beat` is the propose-permission signal: it emits a `BeatReady` event
/// when this replica may propose now, and nothing for a non-proposer (the
/// never-resolving case). The command pipeline parks drained batches until
/// a beat arrives.
pub trait Pacemaker: Send {
    /// The current proposer.
    fn proposer(&self) -> ReplicaId;

    /// Request permission to propose. Emits `Event::BeatReady` via
    /// `Action::EnqueueInternal` when this replica is the proposer.
    fn beat(&mut self) -> Vec<Action>;

    /// The replica the next vote should be sent to.
    fn next_proposer(&mut self, last_proposer: ReplicaId) -> ReplicaId;

    /// External liveness signal: the current proposer is suspected failed.
    /// Advances the round.
    fn impeach(&mut self) -> Vec<Action>;

    /// A quorum certificate completed for `blk_hash`; the pacemaker may
    /// grant a beat so the proposer keeps the pipeline moving.
    fn on_qc_finish(&mut self, blk_hash: Hash) -> Vec<Action>;

    /// Parent list for the next proposal. The main parent (first entry) is
    /// the current branch head.
    fn parents(&self, store: &BlockStore, bqc: Hash, b_exec: Hash) -> Vec<Hash>;
}

/// Deterministic round-robin rotation: the proposer for round `r` is
/// replica `r mod n`. The round advances only on impeachment.
pub struct RoundRobinPacemaker {
    id: ReplicaId,
    n: u16,
    round: u64,
    /// Maximum parents per block; `None` = unlimited.
    parent_limit: Option<usize>,
}

impl RoundRobinPacemaker {
    pub fn new(id: ReplicaId, n: u16, parent_limit: Option<usize>) -> Self {
        Self {
            id,
            n,
            round: 0,
            parent_limit,
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    fn is_proposer(&self) -> bool {
        self.proposer() == self.id
    }
}

impl Pacemaker for RoundRobinPacemaker {
    fn proposer(&self) -> ReplicaId {
        ReplicaId((self.round % self.n as u64) as u16)
    }

    fn beat(&mut self) -> Vec<Action> {
        if self.is_proposer() {
            debug!(round = self.round, "beat granted");
            vec![Action::EnqueueInternal {
                event: Event::BeatReady { round: self.round },
            }]
        } else {
            vec![]
        }
    }

    fn next_proposer(&mut self, _last_proposer: ReplicaId) -> ReplicaId {
        self.proposer()
    }

    fn impeach(&mut self) -> Vec<Action> {
        self.round += 1;
        info!(
            round = self.round,
            proposer = %self.proposer(),
            "impeached previous proposer, round advanced"
        );
        self.beat()
    }

    fn on_qc_finish(&mut self, _blk_hash: Hash) -> Vec<Action> {
        self.beat()
    }

    fn parents(&self, store: &BlockStore, bqc: Hash, b_exec: Hash) -> Vec<Hash> {
        let limit = self.parent_limit.unwrap_or(usize::MAX).max(1);
        let mut parents = Vec::new();
        let mut cursor = bqc;
        loop {
            parents.push(cursor);
            if parents.len() >= limit || cursor == b_exec {
                break;
            }
            match store.find_blk(&cursor).and_then(|b| b.main_parent()) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        parents
    }
}
