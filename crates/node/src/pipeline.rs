//! Command pipeline: admission, batching, finality futures.
//!
//! Client commands enter here, get drained into fixed-size batches once
//! enough accumulate, and wait for a pacemaker beat before becoming a
//! proposal. Two tables map command hashes to the client requests waiting
//! on them:
//!
//! - `decision_waiting`: requests submitted at this replica while it was
//!   the proposer, resolved by the commit sweep
//! - `unconfirmed`: requests submitted while some other replica was the
//!   proposer; answered immediately with a not-proposer sentinel and again
//!   once the command's commit propagates here

use std::collections::{HashMap, VecDeque};
use threechain_core::{Action, RequestId};
use threechain_store::BlockStore;
use threechain_types::{Finality, Hash, ReplicaId};
use tracing::{debug, info, trace};

/// Queue depths and counters for the periodic stat dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStatus {
    pub cmd_pending: usize,
    pub batches_waiting: usize,
    pub decision_waiting: usize,
    pub unconfirmed: usize,
    pub decided: u64,
}

/// The command pipeline of one replica.
pub struct CommandPipeline {
    id: ReplicaId,
    blk_size: usize,

    /// Admitted commands not yet drained into a batch.
    cmd_pending: VecDeque<Hash>,

    /// Drained batches waiting for a beat.
    batches_waiting: VecDeque<Vec<Hash>>,

    /// Command hash → client requests resolved at commit time.
    decision_waiting: HashMap<Hash, Vec<RequestId>>,

    /// Command hash → client requests from the not-proposer path.
    unconfirmed: HashMap<Hash, Vec<RequestId>>,

    decided: u64,
    window_decided: u64,
}

impl CommandPipeline {
    pub fn new(id: ReplicaId, blk_size: usize) -> Self {
        Self {
            id,
            blk_size: blk_size.max(1),
            cmd_pending: VecDeque::new(),
            batches_waiting: VecDeque::new(),
            decision_waiting: HashMap::new(),
            unconfirmed: HashMap::new(),
            decided: 0,
            window_decided: 0,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            cmd_pending: self.cmd_pending.len(),
            batches_waiting: self.batches_waiting.len(),
            decision_waiting: self.decision_waiting.len(),
            unconfirmed: self.unconfirmed.len(),
            decided: self.decided,
        }
    }

    /// Commands decided since the last stat dump; resets the window.
    pub fn take_window_decided(&mut self) -> u64 {
        std::mem::take(&mut self.window_decided)
    }

    /// Admit a command while this replica is the proposer.
    ///
    /// Registers the request in `decision_waiting` (coalescing duplicate
    /// submissions of the same command) and reports whether a full batch
    /// is ready for a beat request.
    pub fn admit(&mut self, cmd_hash: Hash, request: RequestId) -> bool {
        self.decision_waiting
            .entry(cmd_hash)
            .or_default()
            .push(request);
        self.cmd_pending.push_back(cmd_hash);
        trace!(cmd = %cmd_hash.short(), pending = self.cmd_pending.len(), "command admitted");

        if self.cmd_pending.len() >= self.blk_size {
            let batch: Vec<Hash> = self.cmd_pending.drain(..self.blk_size).collect();
            debug!(cmds = batch.len(), "batch drained, awaiting beat");
            self.batches_waiting.push_back(batch);
            true
        } else {
            false
        }
    }

    /// Register a not-proposer submission: the caller already answered
    /// with the sentinel; a second response goes out when the command's
    /// commit propagates here.
    pub fn register_unconfirmed(&mut self, cmd_hash: Hash, request: RequestId) {
        self.unconfirmed.entry(cmd_hash).or_default().push(request);
    }

    /// Take the oldest batch waiting for a beat.
    pub fn take_batch(&mut self) -> Option<Vec<Hash>> {
        self.batches_waiting.pop_front()
    }

    /// A block was executed by the commit sweep: resolve every finality
    /// future for its commands, in block order.
    ///
    /// This is the replicated state machine execution point; the command
    /// payloads stay opaque.
    pub fn on_executed(&mut self, blk_hash: Hash, store: &BlockStore) -> Vec<Action> {
        let Some(blk) = store.find_blk(&blk_hash) else {
            return vec![];
        };

        let mut actions = Vec::new();
        for (pos, cmd_hash) in blk.cmd_hashes().iter().enumerate() {
            let fin = Finality::committed(self.id, blk_hash, *cmd_hash, pos as u32);
            info!(fin = %fin, "replicated");
            self.decided += 1;
            self.window_decided += 1;

            for request in self
                .decision_waiting
                .remove(cmd_hash)
                .into_iter()
                .flatten()
                .chain(self.unconfirmed.remove(cmd_hash).into_iter().flatten())
            {
                actions.push(Action::RespondClient {
                    request,
                    finality: fin.clone(),
                });
            }
        }
        actions
    }
}
