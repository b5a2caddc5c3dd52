//! Safety and commit-rule tests for the HotStuff state machine.
//!
//! These tests drive a single replica's state machine with hand-built
//! chains, the way the fetch engine would after delivery: blocks are
//! inserted into the store and marked delivered in dependency order before
//! the corresponding proposal is processed.

use threechain_consensus::{HotStuffState, Pacemaker, RoundRobinPacemaker};
use threechain_core::{Action, Event, OutboundMessage};
use threechain_store::BlockStore;
use threechain_types::{
    Block, Hash, Proposal, QuorumCertificate, ReplicaId, ReplicaInfo, ReplicaSet, SecretKey, Vote,
};

struct Harness {
    keys: Vec<SecretKey>,
    replicas: ReplicaSet,
    store: BlockStore,
}

impl Harness {
    fn new(n: u16) -> Self {
        let keys: Vec<SecretKey> = (0..n)
            .map(|i| SecretKey::from_bytes(&[i as u8 + 1; 32]))
            .collect();
        let replicas = ReplicaSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ReplicaInfo {
                    id: ReplicaId(i as u16),
                    addr: format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
                    public_key: k.public_key(),
                })
                .collect(),
        )
        .unwrap();
        Self {
            keys,
            replicas,
            store: BlockStore::with_genesis(),
        }
    }

    fn state(&self, id: u16) -> HotStuffState {
        HotStuffState::new(
            ReplicaId(id),
            self.keys[id as usize].clone(),
            self.replicas.clone(),
        )
    }

    fn qc(&self, blk_hash: Hash, signer_count: usize) -> QuorumCertificate {
        QuorumCertificate::new(
            blk_hash,
            (0..signer_count)
                .map(|i| (ReplicaId(i as u16), self.keys[i].sign(blk_hash.as_bytes())))
                .collect(),
        )
    }

    /// Insert a delivered block extending `parent`, optionally justified.
    fn deliver_block(
        &mut self,
        parent: Hash,
        cmds: Vec<Hash>,
        justify: Option<QuorumCertificate>,
    ) -> Hash {
        let hash = self.store.add_blk(Block::new(vec![parent], cmds, justify));
        self.store.mark_blk_delivered(&hash).unwrap();
        hash
    }

    fn proposal(&self, proposer: u16, blk_hash: Hash, bqc_hash: Hash) -> Proposal {
        Proposal {
            proposer: ReplicaId(proposer),
            bqc_hash,
            block: self.store.find_blk(&blk_hash).cloned().unwrap(),
        }
    }
}

fn executed_hashes(actions: &[Action]) -> Vec<Hash> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::EnqueueInternal {
                event: Event::BlockExecuted { blk_hash },
            } => Some(*blk_hash),
            _ => None,
        })
        .collect()
}

fn vote_actions(actions: &[Action]) -> Vec<&Vote> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::SendReplica {
                message: OutboundMessage::Vote(v),
                ..
            } => Some(v),
            Action::EnqueueInternal {
                event: Event::VoteReady { vote },
            } => Some(vote),
            _ => None,
        })
        .collect()
}

/// Build the chain genesis ← b1 ← b2 ← ... ← bk where each block's justify
/// certifies its direct parent, and return the block hashes.
fn consecutive_chain(h: &mut Harness, len: usize) -> Vec<Hash> {
    let genesis = Block::genesis().hash();
    let mut hashes = Vec::new();
    let mut parent = genesis;
    for i in 0..len {
        let justify = if parent == genesis {
            None
        } else {
            Some(h.qc(parent, 3))
        };
        let cmds = vec![threechain_types::hash_bytes(&[i as u8])];
        parent = h.deliver_block(parent, cmds, justify);
        hashes.push(parent);
    }
    hashes
}

#[test]
fn three_chain_commits_oldest_block() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 4);
    let mut state = h.state(3);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(3), 4, None);

    // b1..b3 commit nothing: no three-chain yet.
    for (i, blk) in chain[..3].iter().enumerate() {
        let bqc = if i == 0 { Block::genesis().hash() } else { chain[i - 1] };
        let actions = state.on_proposal_ready(h.proposal(0, *blk, bqc), &mut h.store, &mut pm);
        assert!(executed_hashes(&actions).is_empty(), "premature commit");
    }
    assert_eq!(state.bqc(), chain[1]);
    assert_eq!(state.b_lock(), chain[0]);

    // b4 carries QC(b3): the chain b1 ← b2 ← b3 is consecutive, b1 commits.
    let actions = state.on_proposal_ready(
        h.proposal(0, chain[3], chain[2]),
        &mut h.store,
        &mut pm,
    );
    assert_eq!(executed_hashes(&actions), vec![chain[0]]);
    assert_eq!(state.b_exec(), chain[0]);
    assert_eq!(state.b_lock(), chain[1]);
    assert_eq!(state.bqc(), chain[2]);
}

#[test]
fn commit_sweep_executes_ancestors_oldest_first() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 5);
    let mut state = h.state(3);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(3), 4, None);

    // Deliver the proposals out of band up to b3, without the intermediate
    // commits ever firing (no three-chain until b4).
    for (i, blk) in chain[..3].iter().enumerate() {
        let bqc = if i == 0 { Block::genesis().hash() } else { chain[i - 1] };
        state.on_proposal_ready(h.proposal(0, *blk, bqc), &mut h.store, &mut pm);
    }

    // Skip straight to b5: its justify raises bqc to b4, whose two
    // predecessor links commit b1 *and* b2 in one sweep, oldest first.
    let actions = state.on_proposal_ready(
        h.proposal(0, chain[4], chain[3]),
        &mut h.store,
        &mut pm,
    );
    assert_eq!(executed_hashes(&actions), vec![chain[0], chain[1]]);
    assert_eq!(state.b_exec(), chain[1]);
}

#[test]
fn votes_go_to_the_next_proposer() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 1);
    let mut state = h.state(3);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(3), 4, None);

    let actions = state.on_proposal_ready(
        h.proposal(0, chain[0], Block::genesis().hash()),
        &mut h.store,
        &mut pm,
    );
    let votes = vote_actions(&actions);
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].blk_hash, chain[0]);
    assert_eq!(votes[0].voter, ReplicaId(3));
    // Round-robin at round 0: votes are addressed to replica 0.
    assert!(actions.iter().any(|a| matches!(
        a,
        Action::SendReplica {
            to: ReplicaId(0),
            message: OutboundMessage::Vote(_)
        }
    )));
    assert_eq!(state.vheight(), 1);
}

#[test]
fn equivocating_proposals_get_at_most_one_vote() {
    let mut h = Harness::new(4);
    let genesis = Block::genesis().hash();
    let b1 = h.deliver_block(genesis, vec![threechain_types::hash_bytes(b"a")], None);
    let b1_twin = h.deliver_block(genesis, vec![threechain_types::hash_bytes(b"b")], None);
    assert_ne!(b1, b1_twin);

    let mut state = h.state(3);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(3), 4, None);

    let first = state.on_proposal_ready(h.proposal(0, b1, genesis), &mut h.store, &mut pm);
    assert_eq!(vote_actions(&first).len(), 1);

    // Same height, different block: the voting rule refuses.
    let second = state.on_proposal_ready(h.proposal(0, b1_twin, genesis), &mut h.store, &mut pm);
    assert!(vote_actions(&second).is_empty());
    assert_eq!(state.vheight(), 1);
}

#[test]
fn locked_branch_refuses_conflicting_chain_with_low_justify() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 4);
    let mut state = h.state(3);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(3), 4, None);

    for (i, blk) in chain.iter().enumerate() {
        let bqc = if i == 0 { Block::genesis().hash() } else { chain[i - 1] };
        state.on_proposal_ready(h.proposal(0, *blk, bqc), &mut h.store, &mut pm);
    }
    assert_eq!(state.b_lock(), chain[1]);
    assert_eq!(state.vheight(), 4);

    // A conflicting branch splitting off below the lock, justified only by
    // an old certificate. Tall enough to clear vheight, but it neither
    // extends the lock nor carries a higher justify - no vote.
    let low_qc = h.qc(chain[0], 3);
    let mut tip = chain[0];
    for i in 0..4 {
        tip = h.deliver_block(
            tip,
            vec![threechain_types::hash_bytes(&[0xf0 + i as u8])],
            Some(low_qc.clone()),
        );
    }
    let actions = state.on_proposal_ready(h.proposal(1, tip, chain[0]), &mut h.store, &mut pm);
    assert!(vote_actions(&actions).is_empty());
}

#[test]
fn conflicting_chain_with_higher_justify_unlocks() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 3);
    let mut state = h.state(3);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(3), 4, None);

    for (i, blk) in chain.iter().enumerate() {
        let bqc = if i == 0 { Block::genesis().hash() } else { chain[i - 1] };
        state.on_proposal_ready(h.proposal(0, *blk, bqc), &mut h.store, &mut pm);
    }
    assert_eq!(state.b_lock(), chain[0]);

    // A fork rooted at genesis: it does not extend the locked block at
    // all, but its tip carries a justify certifying chain[2], higher than
    // the lock. The second arm of the voting rule accepts it.
    let genesis = Block::genesis().hash();
    let mut tip = genesis;
    for i in 0..3 {
        tip = h.deliver_block(
            tip,
            vec![threechain_types::hash_bytes(&[0xa0 + i as u8])],
            None,
        );
    }
    let fork_tip = h.deliver_block(
        tip,
        vec![threechain_types::hash_bytes(b"fork")],
        Some(h.qc(chain[2], 3)),
    );
    let actions =
        state.on_proposal_ready(h.proposal(1, fork_tip, chain[2]), &mut h.store, &mut pm);
    assert_eq!(vote_actions(&actions).len(), 1);
}

#[test]
fn quorum_mints_once_and_grants_beat() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 1);
    // Replica 0 is the round-0 proposer, so QC completion grants it a beat.
    let mut state = h.state(0);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(0), 4, None);

    let mut minted_beats = 0;
    for voter in 0..3u16 {
        let vote = Vote::new(
            ReplicaId(voter),
            chain[0],
            Block::genesis().hash(),
            &h.keys[voter as usize],
        );
        let ready = state.on_vote_ready(vote.clone());
        assert!(matches!(ready[0], Action::VerifyVote { .. }));
        let actions = state.on_vote_verified(vote, true, &mut h.store, &mut pm);
        minted_beats += actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    Action::EnqueueInternal {
                        event: Event::BeatReady { .. }
                    }
                )
            })
            .count();
    }
    assert_eq!(minted_beats, 1, "QC must mint exactly once");
    assert_eq!(state.bqc(), chain[0]);

    // A late fourth vote folds silently: the certificate is already
    // minted, so it is not even re-verified.
    let vote = Vote::new(
        ReplicaId(3),
        chain[0],
        Block::genesis().hash(),
        &h.keys[3],
    );
    assert!(state.on_vote_ready(vote).is_empty());
}

#[test]
fn duplicate_and_unknown_votes_fold_silently() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 1);
    let mut state = h.state(0);

    let vote = Vote::new(
        ReplicaId(1),
        chain[0],
        Block::genesis().hash(),
        &h.keys[1],
    );
    assert_eq!(state.on_vote_ready(vote.clone()).len(), 1);
    // Same vote again while verification is pending: folded.
    assert!(state.on_vote_ready(vote).is_empty());

    // A voter outside the replica set is dropped.
    let stranger = SecretKey::from_bytes(&[99; 32]);
    let bad = Vote::new(ReplicaId(9), chain[0], Block::genesis().hash(), &stranger);
    assert!(state.on_vote_ready(bad).is_empty());
}

#[test]
fn invalid_signature_is_discarded_without_state_change() {
    let mut h = Harness::new(4);
    let chain = consecutive_chain(&mut h, 1);
    let mut state = h.state(0);
    let mut pm = RoundRobinPacemaker::new(ReplicaId(0), 4, None);

    let vote = Vote::new(
        ReplicaId(1),
        chain[0],
        Block::genesis().hash(),
        &h.keys[1],
    );
    state.on_vote_ready(vote.clone());
    let actions = state.on_vote_verified(vote.clone(), false, &mut h.store, &mut pm);
    assert!(actions.is_empty());

    // The same vote may be re-submitted and verified later.
    assert_eq!(state.on_vote_ready(vote).len(), 1);
}

#[test]
fn own_proposal_is_broadcast_and_self_processed() {
    let mut h = Harness::new(4);
    let mut state = h.state(0);
    let pm = RoundRobinPacemaker::new(ReplicaId(0), 4, None);

    let cmds = vec![threechain_types::hash_bytes(b"cmd")];
    let parents = pm.parents(&h.store, state.bqc(), state.b_exec());
    let actions = state.on_propose(cmds, parents, &mut h.store);

    let mut saw_broadcast = false;
    let mut saw_ready = false;
    for a in &actions {
        match a {
            Action::Broadcast {
                message: OutboundMessage::Propose(p),
            } => {
                saw_broadcast = true;
                assert_eq!(p.proposer, ReplicaId(0));
                assert!(h.store.is_blk_delivered(&p.block.hash()));
            }
            Action::EnqueueInternal {
                event: Event::ProposalReady { .. },
            } => saw_ready = true,
            _ => {}
        }
    }
    assert!(saw_broadcast && saw_ready);
}
