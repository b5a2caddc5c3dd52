//! HotStuff consensus state machine.
//!
//! This module implements the three-phase pipelined consensus rule as a
//! synchronous, event-driven model. Inputs arrive only after the fetch
//! engine has materialized their referenced blocks; outputs are actions the
//! runner executes.

use crate::pacemaker::Pacemaker;
use crate::vote_set::VoteSet;
use std::collections::{HashMap, HashSet};
use threechain_core::{Action, Event, OutboundMessage};
use threechain_store::BlockStore;
use threechain_types::{
    Block, Hash, Proposal, QuorumCertificate, ReplicaId, ReplicaSet, SecretKey, Vote,
};
use tracing::{debug, info, trace, warn};

/// Running totals kept for the periodic stat dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusStats {
    /// Blocks proposed by this replica.
    pub proposed: u64,
    /// Votes cast by this replica.
    pub voted: u64,
    /// Blocks executed against the replicated state machine.
    pub executed: u64,
}

/// HotStuff consensus state machine.
///
/// Handles proposal processing, the voting rule, vote accumulation into
/// quorum certificates, and the three-chain commit rule.
///
/// # State Machine Flow
///
/// 1. **Proposal delivered** → apply the voting rule, vote to the next
///    proposer, advance the branch head, run the commit rule
/// 2. **Vote delivered** → verify the signature off-loop, accumulate,
///    mint a QC at quorum (once), grant the pacemaker a beat
/// 3. **Beat + pending batch** → build and broadcast a new block
///
/// All blocks referenced here are the canonical delivered instances in the
/// block store; the state machine itself only holds hashes.
pub struct HotStuffState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    id: ReplicaId,
    signing_key: SecretKey,
    replicas: ReplicaSet,

    // ═══════════════════════════════════════════════════════════════════════
    // Chain State
    // ═══════════════════════════════════════════════════════════════════════
    /// Highest-QC block hash: the branch head this replica extends.
    bqc: Hash,

    /// The certificate justifying `bqc`. `None` only while `bqc` is
    /// genesis.
    high_qc: Option<QuorumCertificate>,

    /// Locked block: highest block with a QC-on-QC. The voting rule
    /// refuses branches that do not extend it unless they carry a higher
    /// justify.
    b_lock: Hash,

    /// Highest executed block.
    b_exec: Hash,

    /// Height of the most recently voted block. Votes only go to strictly
    /// higher blocks, so a replica votes at most once per height.
    vheight: u64,

    // ═══════════════════════════════════════════════════════════════════════
    // Pending State
    // ═══════════════════════════════════════════════════════════════════════
    /// Vote accumulators by block hash.
    vote_sets: HashMap<Hash, VoteSet>,

    /// Votes handed to the verification pool and not yet answered.
    /// Deduplicates concurrent verification of the same (block, voter).
    pending_vote_verifications: HashSet<(Hash, ReplicaId)>,

    stats: ConsensusStats,
}

impl HotStuffState {
    /// Create a state machine rooted at genesis.
    pub fn new(id: ReplicaId, signing_key: SecretKey, replicas: ReplicaSet) -> Self {
        let genesis = Block::genesis().hash();
        Self {
            id,
            signing_key,
            replicas,
            bqc: genesis,
            high_qc: None,
            b_lock: genesis,
            b_exec: genesis,
            vheight: 0,
            vote_sets: HashMap::new(),
            pending_vote_verifications: HashSet::new(),
            stats: ConsensusStats::default(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    pub fn bqc(&self) -> Hash {
        self.bqc
    }

    pub fn b_lock(&self) -> Hash {
        self.b_lock
    }

    pub fn b_exec(&self) -> Hash {
        self.b_exec
    }

    pub fn vheight(&self) -> u64 {
        self.vheight
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats
    }

    /// Pending vote-set count, for the stat dump.
    pub fn vote_set_count(&self) -> usize {
        self.vote_sets.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposal Handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a proposal whose block and branch-QC reference are delivered.
    ///
    /// Applies the voting rule, routes the vote to the next proposer,
    /// advances the branch head, and runs the commit rule.
    pub fn on_proposal_ready(
        &mut self,
        proposal: Proposal,
        store: &mut BlockStore,
        pmaker: &mut dyn Pacemaker,
    ) -> Vec<Action> {
        let blk_hash = proposal.block.hash();
        let Some(height) = store.blk_height(&blk_hash) else {
            // The fetch engine only emits ProposalReady after delivery, so
            // this indicates eviction raced the proposal. Drop it.
            warn!(blk = %blk_hash.short(), "proposal block not delivered, dropping");
            return vec![];
        };
        let height = height.0;

        debug!(
            blk = %blk_hash.short(),
            height,
            proposer = %proposal.proposer,
            "processing proposal"
        );

        let mut actions = Vec::new();

        // Voting rule: strictly higher than anything voted before, and
        // either extending the locked branch or carrying a justify above
        // the lock.
        let lock_height = store.blk_height(&self.b_lock).map_or(0, |h| h.0);
        let justify_height = store
            .find_blk(&blk_hash)
            .and_then(|b| b.qc_ref())
            .and_then(|t| store.blk_height(&t))
            .map_or(0, |h| h.0);
        let opinion = height > self.vheight
            && (self.extends(blk_hash, self.b_lock, store) || justify_height > lock_height);

        if opinion {
            self.vheight = height;
            self.stats.voted += 1;
            let vote = Vote::new(self.id, blk_hash, self.bqc, &self.signing_key);
            actions.extend(self.do_vote(proposal.proposer, vote, pmaker));
        } else {
            trace!(
                blk = %blk_hash.short(),
                height,
                vheight = self.vheight,
                "voting rule rejected proposal"
            );
        }

        // Advance the branch head from the block's justify, then try to
        // commit along the new branch.
        if let Some(qc) = store.find_blk(&blk_hash).and_then(|b| b.justify()).cloned() {
            self.update_high_qc(qc, store);
        }
        actions.extend(self.try_commit(store));
        actions
    }

    /// Route a vote to the next proposer, short-circuiting locally when
    /// that is us.
    fn do_vote(
        &mut self,
        last_proposer: ReplicaId,
        vote: Vote,
        pmaker: &mut dyn Pacemaker,
    ) -> Vec<Action> {
        let target = pmaker.next_proposer(last_proposer);
        if target == self.id {
            vec![Action::EnqueueInternal {
                event: Event::VoteReady { vote },
            }]
        } else {
            vec![Action::SendReplica {
                to: target,
                message: OutboundMessage::Vote(vote),
            }]
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vote Handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a vote whose referenced blocks are delivered. Hands the
    /// signature to the verification pool; counting happens in
    /// [`on_vote_verified`](Self::on_vote_verified).
    pub fn on_vote_ready(&mut self, vote: Vote) -> Vec<Action> {
        let Some(public_key) = self.replicas.public_key(vote.voter) else {
            warn!(voter = %vote.voter, "vote from unknown replica, dropping");
            return vec![];
        };

        // Duplicate folding: already counted, already minted, or already
        // in flight to the verifier.
        let key = (vote.blk_hash, vote.voter);
        if let Some(set) = self.vote_sets.get(&vote.blk_hash) {
            if set.is_minted() || set.contains(vote.voter) {
                trace!(voter = %vote.voter, blk = %vote.blk_hash.short(), "duplicate vote");
                return vec![];
            }
        }
        if !self.pending_vote_verifications.insert(key) {
            return vec![];
        }

        vec![Action::VerifyVote { vote, public_key }]
    }

    /// Handle a vote signature verification result. Accumulates valid
    /// votes and mints the block's QC at quorum, exactly once.
    pub fn on_vote_verified(
        &mut self,
        vote: Vote,
        valid: bool,
        store: &mut BlockStore,
        pmaker: &mut dyn Pacemaker,
    ) -> Vec<Action> {
        self.pending_vote_verifications
            .remove(&(vote.blk_hash, vote.voter));

        if !valid {
            warn!(
                voter = %vote.voter,
                blk = %vote.blk_hash.short(),
                "vote signature invalid, discarding"
            );
            return vec![];
        }

        let set = self
            .vote_sets
            .entry(vote.blk_hash)
            .or_insert_with(|| VoteSet::new(vote.blk_hash));
        if !set.add(vote.voter, vote.signature) {
            return vec![];
        }
        trace!(
            voter = %vote.voter,
            blk = %vote.blk_hash.short(),
            votes = set.len(),
            "vote counted"
        );

        let threshold = self.replicas.quorum_threshold();
        let Some(qc) = set.try_mint(threshold) else {
            return vec![];
        };

        info!(
            blk = %vote.blk_hash.short(),
            votes = threshold,
            "quorum certificate formed"
        );
        self.on_qc_finish(qc, store, pmaker)
    }

    /// A QC just completed: raise the branch head, let the pacemaker beat,
    /// and re-run the commit rule.
    fn on_qc_finish(
        &mut self,
        qc: QuorumCertificate,
        store: &mut BlockStore,
        pmaker: &mut dyn Pacemaker,
    ) -> Vec<Action> {
        let blk_hash = qc.block_hash;
        self.update_high_qc(qc, store);
        let mut actions = pmaker.on_qc_finish(blk_hash);
        actions.extend(self.try_commit(store));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════

    /// Build, store, and broadcast a new block for a drained command batch.
    ///
    /// The parent list comes from the pacemaker; its head is the branch
    /// head, so every parent is already delivered locally and the new block
    /// delivers trivially.
    pub fn on_propose(
        &mut self,
        cmds: Vec<Hash>,
        parents: Vec<Hash>,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        if parents.is_empty() {
            warn!("pacemaker returned no parents, skipping proposal");
            return vec![];
        }

        let block = Block::new(parents, cmds, self.high_qc.clone());
        let blk_hash = store.add_blk(block);
        if let Err(e) = store.mark_blk_delivered(&blk_hash) {
            // The pacemaker's parent list is drawn from the delivered
            // branch; failure here means consensus state is corrupt.
            panic!("own proposal failed delivery: {e}");
        }
        self.stats.proposed += 1;

        let proposal = Proposal {
            proposer: self.id,
            bqc_hash: self.bqc,
            block: store.find_blk(&blk_hash).cloned().expect("just stored"),
        };

        info!(
            blk = %blk_hash.short(),
            height = store.blk_height(&blk_hash).map_or(0, |h| h.0),
            cmds = proposal.block.cmd_hashes().len(),
            "proposing block"
        );

        vec![
            Action::Broadcast {
                message: OutboundMessage::Propose(proposal.clone()),
            },
            // Process our own proposal through the normal path: it applies
            // the voting rule and self-votes.
            Action::EnqueueInternal {
                event: Event::ProposalReady { proposal },
            },
        ]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain Rules
    // ═══════════════════════════════════════════════════════════════════════

    /// Does `blk` extend `ancestor` through main-parent links?
    fn extends(&self, blk: Hash, ancestor: Hash, store: &BlockStore) -> bool {
        let Some(ancestor_height) = store.blk_height(&ancestor) else {
            return false;
        };
        let mut cursor = blk;
        loop {
            if cursor == ancestor {
                return true;
            }
            let Some(b) = store.find_blk(&cursor) else {
                return false;
            };
            if !b.is_delivered() || b.height() <= ancestor_height {
                return false;
            }
            match b.main_parent() {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    /// Raise the branch head if `qc` certifies a higher delivered block.
    fn update_high_qc(&mut self, qc: QuorumCertificate, store: &BlockStore) {
        let Some(target_height) = store.blk_height(&qc.block_hash) else {
            // Justify target exists but is undelivered; a branch head we
            // cannot walk from is useless, so keep the current one.
            return;
        };
        let current = store.blk_height(&self.bqc).map_or(0, |h| h.0);
        if target_height.0 > current {
            trace!(
                blk = %qc.block_hash.short(),
                height = target_height.0,
                "branch head advanced"
            );
            self.bqc = qc.block_hash;
            self.high_qc = Some(qc);
        }
    }

    /// The three-chain commit rule, walked from the branch head.
    ///
    /// With `b` the branch head, `b′ = b.justify` and `b″ = b′.justify`:
    /// the lock advances to `b′` when `b′` is `b`'s direct parent, and `b″`
    /// commits when additionally `b″` is `b′`'s direct parent. Committing
    /// executes `b″` and every uncommitted ancestor, oldest first.
    fn try_commit(&mut self, store: &mut BlockStore) -> Vec<Action> {
        let Some(b) = store.find_blk(&self.bqc) else {
            return vec![];
        };
        let Some(b_prime_hash) = b.qc_ref() else {
            return vec![];
        };
        if b.main_parent() != Some(b_prime_hash) {
            return vec![];
        }

        // Consecutive two-chain: advance the lock monotonically.
        let lock_height = store.blk_height(&self.b_lock).map_or(0, |h| h.0);
        if store.blk_height(&b_prime_hash).map_or(0, |h| h.0) > lock_height {
            debug!(blk = %b_prime_hash.short(), "lock advanced");
            self.b_lock = b_prime_hash;
        }

        let Some(b_prime) = store.find_blk(&b_prime_hash) else {
            return vec![];
        };
        let Some(b_dprime_hash) = b_prime.qc_ref() else {
            return vec![];
        };
        if b_prime.main_parent() != Some(b_dprime_hash) {
            return vec![];
        }

        // Consecutive three-chain: b″ is final.
        self.commit_sweep(b_dprime_hash, store)
    }

    /// Execute `tip` and all its uncommitted ancestors, oldest first.
    /// Committed height never regresses.
    fn commit_sweep(&mut self, tip: Hash, store: &mut BlockStore) -> Vec<Action> {
        let exec_height = store.blk_height(&self.b_exec).map_or(0, |h| h.0);
        let tip_height = store.blk_height(&tip).map_or(0, |h| h.0);
        if tip == self.b_exec || tip_height <= exec_height {
            return vec![];
        }

        let mut batch = Vec::new();
        let mut cursor = tip;
        while cursor != self.b_exec {
            let blk = store
                .find_blk(&cursor)
                .unwrap_or_else(|| panic!("committed ancestor {cursor} missing from store"));
            if blk.height().0 <= exec_height {
                // The walk passed the executed height without meeting
                // b_exec: two conflicting blocks committed at the same
                // position. Unrecoverable safety failure.
                panic!(
                    "commit of {} conflicts with executed block {}",
                    tip, self.b_exec
                );
            }
            batch.push(cursor);
            cursor = blk.main_parent().expect("non-genesis committed block");
        }

        self.b_exec = tip;
        self.stats.executed += batch.len() as u64;
        info!(
            tip = %tip.short(),
            height = tip_height,
            blocks = batch.len(),
            "commit sweep"
        );

        // Ancestor-first execution order.
        batch
            .into_iter()
            .rev()
            .map(|blk_hash| Action::EnqueueInternal {
                event: Event::BlockExecuted { blk_hash },
            })
            .collect()
    }
}
