//! Fetch and delivery engine.
//!
//! Before the consensus core sees a proposal or vote, every block it
//! references must be *delivered*: present locally with all transitive
//! dependencies delivered and the block itself sanity-checked. This engine
//! owns that pipeline:
//!
//! - **Fetch contexts** (`blk_fetch_waiting`): one per outstanding hash,
//!   coalescing concurrent fetchers. Each tracks a candidate replica set
//!   and rotates to the next candidate when a request times out.
//! - **Delivery contexts** (`blk_delivery_waiting`): one per hash being
//!   delivered, tracking outstanding dependencies (parent deliveries plus
//!   the justify-target fetch) and the verification stage.
//! - **Parked inputs**: proposals and votes suspended until the hashes
//!   they reference deliver; re-emitted as internal events on resolution.
//!
//! The dependency graph is a DAG (a block's hash covers its parents'
//! hashes, so a cycle would need a hash preimage), which makes the
//! recursive completion below terminate. `on_deliver` fires for a block
//! strictly after all its ancestors, exactly once per hash.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use threechain_core::{Action, Event, OutboundMessage};
use threechain_store::BlockStore;
use threechain_types::{Block, Hash, Proposal, ReplicaId, Vote};
use tracing::{debug, trace, warn};

/// Configuration for the fetch engine.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// How long to wait for a requested block before rotating to the next
    /// candidate replica.
    pub fetch_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(1),
        }
    }
}

/// Queue depths and counters for the periodic stat dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchStatus {
    /// Outstanding block fetch contexts.
    pub blk_fetch_waiting: usize,
    /// Outstanding command fetch contexts.
    pub cmd_fetch_waiting: usize,
    /// Outstanding delivery contexts.
    pub blk_delivery_waiting: usize,
    /// Parked proposals/votes.
    pub parked: usize,
    /// Blocks fetched since startup.
    pub fetched: u64,
    /// Blocks delivered since startup.
    pub delivered: u64,
}

/// Windowed counters, reset by each stat dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchWindow {
    pub fetched: u64,
    pub delivered: u64,
}

/// Result of a command fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdFetch {
    /// The command is in the store.
    Ready,
    /// Interest registered; resolves when the command arrives locally.
    /// The peer protocol carries blocks only, so commands materialize via
    /// client submission.
    Pending,
}

/// One outstanding fetch: candidate replicas and a rotation cursor.
#[derive(Debug)]
struct FetchCtx {
    candidates: Vec<ReplicaId>,
    cursor: usize,
    /// When the in-flight request expires; `None` while no candidate is
    /// known yet.
    deadline: Option<Duration>,
}

impl FetchCtx {
    fn new() -> Self {
        Self {
            candidates: Vec::new(),
            cursor: 0,
            deadline: None,
        }
    }
}

/// A single outstanding dependency of a delivery.
///
/// The same hash can be owed twice with different obligations: a justify
/// target that is also a parent must be *delivered* for the parent edge
/// but merely *fetched* for the certificate edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Dep {
    Deliver(Hash),
    Fetch(Hash),
}

/// Delivery progress for one block hash.
#[derive(Debug)]
enum DeliveryStage {
    /// Waiting for the block bytes themselves.
    AwaitingBlock,
    /// Block fetched; waiting on parent deliveries and the justify fetch.
    AwaitingDeps { outstanding: HashSet<Dep> },
    /// Dependencies resolved; justify certificate out for verification.
    Verifying,
}

/// A protocol input suspended on deliveries.
#[derive(Debug)]
enum ParkedInput {
    Proposal(Proposal),
    Vote(Vote),
}

#[derive(Debug)]
struct Parked {
    outstanding: HashSet<Hash>,
    input: ParkedInput,
}

/// The fetch/delivery engine. All state is mutated on the event loop.
pub struct FetchEngine {
    config: FetchConfig,

    blk_fetch_waiting: HashMap<Hash, FetchCtx>,
    cmd_fetch_waiting: HashMap<Hash, u32>,
    blk_delivery_waiting: HashMap<Hash, DeliveryStage>,

    /// parent hash → delivery contexts waiting on its *delivery*.
    deliver_dependents: HashMap<Hash, Vec<Hash>>,
    /// hash → delivery contexts waiting on its *fetch* (justify targets).
    fetch_dependents: HashMap<Hash, Vec<Hash>>,

    parked: HashMap<u64, Parked>,
    park_dependents: HashMap<Hash, Vec<u64>>,
    next_park: u64,

    /// Current time, set by the runner before each handler.
    now: Duration,

    fetched: u64,
    delivered: u64,
    window: FetchWindow,
}

impl FetchEngine {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            blk_fetch_waiting: HashMap::new(),
            cmd_fetch_waiting: HashMap::new(),
            blk_delivery_waiting: HashMap::new(),
            deliver_dependents: HashMap::new(),
            fetch_dependents: HashMap::new(),
            parked: HashMap::new(),
            park_dependents: HashMap::new(),
            next_park: 0,
            now: Duration::ZERO,
            fetched: 0,
            delivered: 0,
            window: FetchWindow::default(),
        }
    }

    /// Update the engine's clock. Called by the runner before handlers.
    pub fn set_now(&mut self, now: Duration) {
        self.now = now;
    }

    pub fn status(&self) -> FetchStatus {
        FetchStatus {
            blk_fetch_waiting: self.blk_fetch_waiting.len(),
            cmd_fetch_waiting: self.cmd_fetch_waiting.len(),
            blk_delivery_waiting: self.blk_delivery_waiting.len(),
            parked: self.parked.len(),
            fetched: self.fetched,
            delivered: self.delivered,
        }
    }

    /// Windowed counters since the last call; resets the window.
    pub fn take_window(&mut self) -> FetchWindow {
        std::mem::take(&mut self.window)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol Inputs
    // ═══════════════════════════════════════════════════════════════════════

    /// A proposal arrived: materialize its block and branch-QC reference,
    /// then release it to consensus as `ProposalReady`.
    pub fn on_proposal(
        &mut self,
        proposal: Proposal,
        from: ReplicaId,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        // The block itself travels with the proposal.
        let mut actions = self.on_block(proposal.block.clone(), Some(from), store);

        let needed = [proposal.block.hash(), proposal.bqc_hash];
        actions.extend(self.park(
            ParkedInput::Proposal(proposal),
            &needed,
            from,
            store,
        ));
        actions
    }

    /// A vote arrived: materialize both referenced blocks, then release it
    /// as `VoteReady`.
    pub fn on_vote(&mut self, vote: Vote, from: ReplicaId, store: &mut BlockStore) -> Vec<Action> {
        let needed = [vote.blk_hash, vote.bqc_hash];
        self.park(ParkedInput::Vote(vote), &needed, from, store)
    }

    /// Blocks arrived in a `RESP_BLOCK`.
    pub fn on_blocks(
        &mut self,
        blocks: Vec<Block>,
        from: ReplicaId,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        for blk in blocks {
            actions.extend(self.on_block(blk, Some(from), store));
        }
        actions
    }

    /// Serve a `REQ_BLOCK`: reply with the stored blocks, skipping unknown
    /// hashes.
    pub fn serve_block_request(
        &self,
        hashes: Vec<Hash>,
        from: ReplicaId,
        store: &BlockStore,
    ) -> Vec<Action> {
        let blocks: Vec<Block> = hashes
            .iter()
            .filter_map(|h| store.find_blk(h).cloned())
            .collect();
        trace!(
            peer = %from,
            asked = hashes.len(),
            served = blocks.len(),
            "serving block request"
        );
        vec![Action::SendReplica {
            to: from,
            message: OutboundMessage::BlockResponse(blocks),
        }]
    }

    /// Periodic timeout scan: rotate expired fetches to their next
    /// candidate and re-request.
    pub fn on_tick(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let now = self.now;
        for (hash, ctx) in self.blk_fetch_waiting.iter_mut() {
            let Some(deadline) = ctx.deadline else {
                continue;
            };
            if now < deadline || ctx.candidates.is_empty() {
                continue;
            }
            ctx.cursor = (ctx.cursor + 1) % ctx.candidates.len();
            let target = ctx.candidates[ctx.cursor];
            ctx.deadline = Some(now + self.config.fetch_timeout);
            debug!(blk = %hash.short(), peer = %target, "fetch timed out, rotating candidate");
            actions.push(Action::SendReplica {
                to: target,
                message: OutboundMessage::BlockRequest(vec![*hash]),
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Command Fetch (local-only resolution)
    // ═══════════════════════════════════════════════════════════════════════

    /// Coalesced command fetch, symmetric to block fetch. Commands only
    /// arrive through client submission, so a pending fetch resolves on
    /// [`on_cmd_stored`](Self::on_cmd_stored).
    pub fn fetch_cmd(&mut self, hash: Hash, store: &BlockStore) -> CmdFetch {
        if store.is_cmd_fetched(&hash) {
            return CmdFetch::Ready;
        }
        *self.cmd_fetch_waiting.entry(hash).or_insert(0) += 1;
        CmdFetch::Pending
    }

    /// A command landed in the store; resolve any waiting fetches.
    /// Returns the number of coalesced waiters released.
    pub fn on_cmd_stored(&mut self, hash: Hash) -> u32 {
        self.cmd_fetch_waiting.remove(&hash).unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Verification Callback
    // ═══════════════════════════════════════════════════════════════════════

    /// The worker pool finished verifying a block's justify certificate.
    pub fn on_justify_verified(
        &mut self,
        blk_hash: Hash,
        valid: bool,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        match self.blk_delivery_waiting.get(&blk_hash) {
            Some(DeliveryStage::Verifying) => {}
            _ => {
                trace!(blk = %blk_hash.short(), "stale verification result");
                return vec![];
            }
        }
        if valid {
            self.complete_delivery(blk_hash, store)
        } else {
            warn!(blk = %blk_hash.short(), "justify certificate invalid, dropping block");
            self.reject_delivery(blk_hash);
            vec![]
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fetch / Delivery Internals
    // ═══════════════════════════════════════════════════════════════════════

    /// Suspend `input` until every hash in `needed` is delivered.
    fn park(
        &mut self,
        input: ParkedInput,
        needed: &[Hash],
        hint: ReplicaId,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut outstanding = HashSet::new();
        for h in needed {
            if store.is_blk_delivered(h) {
                continue;
            }
            actions.extend(self.ensure_delivery(*h, Some(hint), store));
            // Delivery may have completed synchronously.
            if store.is_blk_delivered(h) {
                continue;
            }
            // Or been rejected synchronously (invalid block): the input
            // can never be released, so drop it now.
            if !self.blk_delivery_waiting.contains_key(h) {
                warn!(blk = %h.short(), "input references an invalid block, dropping");
                return actions;
            }
            outstanding.insert(*h);
        }

        if outstanding.is_empty() {
            actions.push(Action::EnqueueInternal {
                event: Self::ready_event(input),
            });
            return actions;
        }

        let id = self.next_park;
        self.next_park += 1;
        for h in &outstanding {
            self.park_dependents.entry(*h).or_default().push(id);
        }
        trace!(park = id, waiting = outstanding.len(), "input parked on delivery");
        self.parked.insert(id, Parked { outstanding, input });
        actions
    }

    fn ready_event(input: ParkedInput) -> Event {
        match input {
            ParkedInput::Proposal(proposal) => Event::ProposalReady { proposal },
            ParkedInput::Vote(vote) => Event::VoteReady { vote },
        }
    }

    /// Ensure a delivery context exists for `hash` (coalescing) and drive
    /// it as far as current knowledge allows.
    fn ensure_delivery(
        &mut self,
        hash: Hash,
        hint: Option<ReplicaId>,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        if store.is_blk_delivered(&hash) {
            return vec![];
        }
        if self.blk_delivery_waiting.contains_key(&hash) {
            // Already in flight; at most contribute a fetch candidate.
            return self.ensure_fetch(hash, hint, store);
        }

        if store.is_blk_fetched(&hash) {
            self.blk_delivery_waiting
                .insert(hash, DeliveryStage::AwaitingBlock);
            self.advance_to_deps(hash, hint, store)
        } else {
            self.blk_delivery_waiting
                .insert(hash, DeliveryStage::AwaitingBlock);
            self.ensure_fetch(hash, hint, store)
        }
    }

    /// Ensure a fetch context exists for `hash`; attach the hinted
    /// candidate and request immediately from a fresh candidate.
    fn ensure_fetch(
        &mut self,
        hash: Hash,
        hint: Option<ReplicaId>,
        store: &BlockStore,
    ) -> Vec<Action> {
        if store.is_blk_fetched(&hash) {
            return vec![];
        }
        let ctx = self
            .blk_fetch_waiting
            .entry(hash)
            .or_insert_with(FetchCtx::new);

        let mut actions = Vec::new();
        if let Some(peer) = hint {
            let fresh = !ctx.candidates.contains(&peer);
            if fresh {
                ctx.candidates.push(peer);
            }
            // Fire immediately when this is the first usable candidate.
            if ctx.deadline.is_none() {
                ctx.cursor = ctx.candidates.len() - 1;
                ctx.deadline = Some(self.now + self.config.fetch_timeout);
                debug!(blk = %hash.short(), peer = %peer, "requesting block");
                actions.push(Action::SendReplica {
                    to: peer,
                    message: OutboundMessage::BlockRequest(vec![hash]),
                });
            }
        }
        actions
    }

    /// A block arrived (via proposal or response): resolve its fetch and
    /// advance every delivery that was waiting on it.
    fn on_block(
        &mut self,
        blk: Block,
        from: Option<ReplicaId>,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        let newly_fetched = !store.is_blk_fetched(&blk.hash());
        let hash = store.add_blk(blk);
        if newly_fetched {
            self.fetched += 1;
            self.window.fetched += 1;
            trace!(blk = %hash.short(), "fetched");
        }

        // Resolve the fetch context.
        self.blk_fetch_waiting.remove(&hash);

        let mut actions = Vec::new();

        // Deliveries waiting on this hash as a justify-target fetch.
        if let Some(children) = self.fetch_dependents.remove(&hash) {
            for child in children {
                actions.extend(self.resolve_dep(child, Dep::Fetch(hash), store));
            }
        }

        // The delivery of this very block can now look at dependencies.
        if matches!(
            self.blk_delivery_waiting.get(&hash),
            Some(DeliveryStage::AwaitingBlock)
        ) {
            actions.extend(self.advance_to_deps(hash, from, store));
        }

        actions
    }

    /// Move a fetched block's delivery from `AwaitingBlock` to
    /// `AwaitingDeps`, registering and kicking off every missing
    /// dependency; straight through to verification when nothing is
    /// missing.
    fn advance_to_deps(
        &mut self,
        hash: Hash,
        hint: Option<ReplicaId>,
        store: &mut BlockStore,
    ) -> Vec<Action> {
        let Some(blk) = store.find_blk(&hash) else {
            return vec![];
        };
        let parents: Vec<Hash> = blk.parent_hashes().to_vec();
        let qc_target = blk.qc_ref();

        let mut actions = Vec::new();
        let mut outstanding = HashSet::new();

        for parent in parents {
            if store.is_blk_delivered(&parent) {
                continue;
            }
            outstanding.insert(Dep::Deliver(parent));
            self.deliver_dependents
                .entry(parent)
                .or_default()
                .push(hash);
            actions.extend(self.ensure_delivery(parent, hint, store));
            // A parent may deliver synchronously (fetched with all deps
            // already delivered); account for it right away.
            if store.is_blk_delivered(&parent) {
                outstanding.remove(&Dep::Deliver(parent));
                if let Some(deps) = self.deliver_dependents.get_mut(&parent) {
                    deps.retain(|h| *h != hash);
                }
            }
        }

        if let Some(target) = qc_target {
            if !store.is_blk_fetched(&target) {
                outstanding.insert(Dep::Fetch(target));
                self.fetch_dependents.entry(target).or_default().push(hash);
                actions.extend(self.ensure_fetch(target, hint, store));
            }
        }

        if outstanding.is_empty() {
            self.blk_delivery_waiting
                .insert(hash, DeliveryStage::AwaitingDeps {
                    outstanding: HashSet::new(),
                });
            actions.extend(self.begin_verify(hash, store));
        } else {
            self.blk_delivery_waiting
                .insert(hash, DeliveryStage::AwaitingDeps { outstanding });
        }
        actions
    }

    /// One dependency of `child` resolved; complete it when none remain.
    fn resolve_dep(&mut self, child: Hash, dep: Dep, store: &mut BlockStore) -> Vec<Action> {
        let done = match self.blk_delivery_waiting.get_mut(&child) {
            Some(DeliveryStage::AwaitingDeps { outstanding }) => {
                outstanding.remove(&dep);
                outstanding.is_empty()
            }
            _ => false,
        };
        if done {
            self.begin_verify(child, store)
        } else {
            vec![]
        }
    }

    /// All dependencies materialized: sanity-check the block and hand its
    /// justify certificate to the verification pool.
    fn begin_verify(&mut self, hash: Hash, store: &mut BlockStore) -> Vec<Action> {
        let Some(blk) = store.find_blk(&hash) else {
            return vec![];
        };

        // A parentless block claiming to be new is a forged genesis.
        if blk.is_genesis() && hash != Block::genesis().hash() {
            warn!(blk = %hash.short(), "parentless non-genesis block, dropping");
            self.reject_delivery(hash);
            return vec![];
        }

        match blk.justify().cloned() {
            Some(qc) => {
                self.blk_delivery_waiting
                    .insert(hash, DeliveryStage::Verifying);
                vec![Action::VerifyBlockJustify { blk_hash: hash, qc }]
            }
            // No certificate to check (a block extending genesis).
            None => self.complete_delivery(hash, store),
        }
    }

    /// Mark delivered, wake dependents (ancestor-first by construction),
    /// and release parked inputs.
    fn complete_delivery(&mut self, hash: Hash, store: &mut BlockStore) -> Vec<Action> {
        match store.mark_blk_delivered(&hash) {
            Ok(true) => {}
            Ok(false) => {
                // At-most-once: someone already delivered it.
                self.blk_delivery_waiting.remove(&hash);
                return vec![];
            }
            Err(e) => {
                // The engine only completes after all dependencies
                // resolved; a precondition failure is an ordering bug.
                panic!("delivery precondition violated: {e}");
            }
        }

        self.blk_delivery_waiting.remove(&hash);
        self.delivered += 1;
        self.window.delivered += 1;
        debug!(blk = %hash.short(), "block delivered");

        let mut actions = Vec::new();

        if let Some(children) = self.deliver_dependents.remove(&hash) {
            for child in children {
                actions.extend(self.resolve_dep(child, Dep::Deliver(hash), store));
            }
        }

        if let Some(park_ids) = self.park_dependents.remove(&hash) {
            for id in park_ids {
                let done = match self.parked.get_mut(&id) {
                    Some(p) => {
                        p.outstanding.remove(&hash);
                        p.outstanding.is_empty()
                    }
                    None => false,
                };
                if done {
                    let parked = self.parked.remove(&id).expect("checked above");
                    actions.push(Action::EnqueueInternal {
                        event: Self::ready_event(parked.input),
                    });
                }
            }
        }

        actions
    }

    /// Drop a failed delivery: its waiters, and every delivery that could
    /// only complete through it.
    fn reject_delivery(&mut self, hash: Hash) {
        self.blk_delivery_waiting.remove(&hash);
        self.blk_fetch_waiting.remove(&hash);

        if let Some(park_ids) = self.park_dependents.remove(&hash) {
            for id in park_ids {
                if self.parked.remove(&id).is_some() {
                    warn!(park = id, blk = %hash.short(), "dropping input parked on invalid block");
                }
            }
        }

        // A child whose parent is invalid can never deliver.
        if let Some(children) = self.deliver_dependents.remove(&hash) {
            for child in children {
                warn!(blk = %child.short(), parent = %hash.short(), "rejecting dependent delivery");
                self.reject_delivery(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threechain_types::{hash_bytes, Command, QuorumCertificate, SecretKey};

    fn engine() -> FetchEngine {
        FetchEngine::new(FetchConfig::default())
    }

    fn qc_for(hash: Hash) -> QuorumCertificate {
        let key = SecretKey::from_bytes(&[1; 32]);
        QuorumCertificate::new(hash, vec![(ReplicaId(0), key.sign(hash.as_bytes()))])
    }

    fn proposal_for(blk: &Block, bqc_hash: Hash) -> Proposal {
        Proposal {
            proposer: ReplicaId(0),
            bqc_hash,
            block: blk.clone(),
        }
    }

    fn block_requests(actions: &[Action]) -> Vec<(ReplicaId, Vec<Hash>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendReplica {
                    to,
                    message: OutboundMessage::BlockRequest(hashes),
                } => Some((*to, hashes.clone())),
                _ => None,
            })
            .collect()
    }

    fn ready_proposals(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    Action::EnqueueInternal {
                        event: Event::ProposalReady { .. }
                    }
                )
            })
            .count()
    }

    #[test]
    fn proposal_with_local_deps_is_released_immediately() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        let b1 = Block::new(vec![genesis], vec![hash_bytes(b"c")], None);
        let actions = eng.on_proposal(proposal_for(&b1, genesis), ReplicaId(1), &mut store);

        assert_eq!(ready_proposals(&actions), 1);
        assert!(store.is_blk_delivered(&b1.hash()));
        assert!(block_requests(&actions).is_empty());
    }

    #[test]
    fn missing_ancestors_fetch_in_dependency_order() {
        // Build the chain elsewhere, then deliver only b3's proposal.
        let mut origin = BlockStore::with_genesis();
        let genesis = Block::genesis().hash();
        let b1 = Block::new(vec![genesis], vec![hash_bytes(b"1")], None);
        origin.add_blk(b1.clone());
        let b2 = Block::new(vec![b1.hash()], vec![hash_bytes(b"2")], None);
        origin.add_blk(b2.clone());
        let b3 = Block::new(vec![b2.hash()], vec![hash_bytes(b"3")], None);

        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let peer = ReplicaId(2);

        // b3 arrives: engine must ask for b2 only (b1 is unknown to it yet).
        let actions = eng.on_proposal(proposal_for(&b3, genesis), peer, &mut store);
        assert_eq!(ready_proposals(&actions), 0);
        assert_eq!(block_requests(&actions), vec![(peer, vec![b2.hash()])]);

        // b2 arrives: now b1 is wanted.
        let actions = eng.on_blocks(vec![b2.clone()], peer, &mut store);
        assert_eq!(block_requests(&actions), vec![(peer, vec![b1.hash()])]);
        assert_eq!(ready_proposals(&actions), 0);

        // b1 arrives: the whole chain delivers, height order, and the
        // parked proposal is released.
        let actions = eng.on_blocks(vec![b1.clone()], peer, &mut store);
        assert_eq!(ready_proposals(&actions), 1);
        for (h, height) in [(b1.hash(), 1), (b2.hash(), 2), (b3.hash(), 3)] {
            assert!(store.is_blk_delivered(&h));
            assert_eq!(store.blk_height(&h).unwrap().0, height);
        }
    }

    #[test]
    fn concurrent_fetches_coalesce_to_one_request() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        let missing = Block::new(vec![genesis], vec![hash_bytes(b"m")], None);
        let child_a = Block::new(vec![missing.hash()], vec![hash_bytes(b"a")], None);
        let child_b = Block::new(vec![missing.hash()], vec![hash_bytes(b"b")], None);

        let peer = ReplicaId(1);
        let first = eng.on_proposal(proposal_for(&child_a, genesis), peer, &mut store);
        assert_eq!(block_requests(&first), vec![(peer, vec![missing.hash()])]);

        // Second proposal referencing the same missing hash: no new request.
        let second = eng.on_proposal(proposal_for(&child_b, genesis), peer, &mut store);
        assert!(block_requests(&second).is_empty());
        assert_eq!(eng.status().blk_fetch_waiting, 1);

        // One response resolves both parked proposals.
        let actions = eng.on_blocks(vec![missing], peer, &mut store);
        assert_eq!(ready_proposals(&actions), 2);
        assert_eq!(eng.status().parked, 0);
    }

    #[test]
    fn fetch_rotates_candidates_on_timeout() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        let missing = Block::new(vec![genesis], vec![hash_bytes(b"m")], None);
        let child = Block::new(vec![missing.hash()], vec![hash_bytes(b"c")], None);

        eng.set_now(Duration::from_secs(0));
        let first = eng.on_proposal(proposal_for(&child, genesis), ReplicaId(1), &mut store);
        assert_eq!(block_requests(&first).len(), 1);

        // A second hint joins the candidate set.
        let twin = Block::new(vec![missing.hash()], vec![hash_bytes(b"t")], None);
        eng.on_proposal(proposal_for(&twin, genesis), ReplicaId(2), &mut store);

        // Before the deadline nothing happens.
        eng.set_now(Duration::from_millis(500));
        assert!(eng.on_tick().is_empty());

        // After the deadline the request rotates to the other candidate.
        eng.set_now(Duration::from_secs(2));
        let retries = block_requests(&eng.on_tick());
        assert_eq!(retries, vec![(ReplicaId(2), vec![missing.hash()])]);

        // And wraps around on the next expiry.
        eng.set_now(Duration::from_secs(4));
        let retries = block_requests(&eng.on_tick());
        assert_eq!(retries, vec![(ReplicaId(1), vec![missing.hash()])]);
    }

    #[test]
    fn justify_target_is_fetched_but_not_delivered() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        // A block whose justify points at a side block we do not have.
        let side = Block::new(vec![genesis], vec![hash_bytes(b"side")], None);
        let blk = Block::new(vec![genesis], vec![], Some(qc_for(side.hash())));

        let peer = ReplicaId(3);
        let actions = eng.on_proposal(proposal_for(&blk, genesis), peer, &mut store);
        assert_eq!(block_requests(&actions), vec![(peer, vec![side.hash()])]);

        // Side block arrives: the delivery proceeds to verification
        // without ever delivering the side block itself.
        let actions = eng.on_blocks(vec![side.clone()], peer, &mut store);
        let verify = actions
            .iter()
            .any(|a| matches!(a, Action::VerifyBlockJustify { blk_hash, .. } if *blk_hash == blk.hash()));
        assert!(verify);
        assert!(store.is_blk_fetched(&side.hash()));
        assert!(!store.is_blk_delivered(&side.hash()));
    }

    #[test]
    fn invalid_justify_rejects_delivery_and_parked_inputs() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        let anchor = Block::new(vec![genesis], vec![hash_bytes(b"anchor")], None);
        store.add_blk(anchor.clone());
        let blk = Block::new(vec![genesis], vec![], Some(qc_for(anchor.hash())));

        let actions = eng.on_proposal(proposal_for(&blk, genesis), ReplicaId(1), &mut store);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::VerifyBlockJustify { .. })));

        let actions = eng.on_justify_verified(blk.hash(), false, &mut store);
        assert!(actions.is_empty());
        assert!(!store.is_blk_delivered(&blk.hash()));
        assert_eq!(eng.status().parked, 0);
        assert_eq!(eng.status().blk_delivery_waiting, 0);
    }

    #[test]
    fn delivery_happens_at_most_once() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        let blk = Block::new(vec![genesis], vec![hash_bytes(b"c")], None);
        let first = eng.on_proposal(proposal_for(&blk, genesis), ReplicaId(1), &mut store);
        assert_eq!(ready_proposals(&first), 1);
        let before = eng.status().delivered;

        // The same block via a response: no second delivery.
        eng.on_blocks(vec![blk], ReplicaId(2), &mut store);
        assert_eq!(eng.status().delivered, before);
    }

    #[test]
    fn forged_genesis_is_rejected() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();

        let fake = Block::new(vec![], vec![hash_bytes(b"fake")], None);
        assert_ne!(fake.hash(), genesis);
        let actions = eng.on_proposal(proposal_for(&fake, genesis), ReplicaId(1), &mut store);
        assert_eq!(ready_proposals(&actions), 0);
        assert!(!store.is_blk_delivered(&fake.hash()));
    }

    #[test]
    fn vote_parks_until_references_deliver() {
        let mut store = BlockStore::with_genesis();
        let mut eng = engine();
        let genesis = Block::genesis().hash();
        let key = SecretKey::from_bytes(&[7; 32]);

        let blk = Block::new(vec![genesis], vec![hash_bytes(b"v")], None);
        let vote = Vote::new(ReplicaId(1), blk.hash(), genesis, &key);

        let actions = eng.on_vote(vote, ReplicaId(1), &mut store);
        assert_eq!(block_requests(&actions), vec![(ReplicaId(1), vec![blk.hash()])]);

        let actions = eng.on_blocks(vec![blk], ReplicaId(1), &mut store);
        let released = actions.iter().any(|a| {
            matches!(
                a,
                Action::EnqueueInternal {
                    event: Event::VoteReady { .. }
                }
            )
        });
        assert!(released);
    }

    #[test]
    fn serve_block_request_skips_unknown() {
        let mut store = BlockStore::with_genesis();
        let eng = engine();
        let genesis = Block::genesis().hash();
        let known = Block::new(vec![genesis], vec![hash_bytes(b"k")], None);
        store.add_blk(known.clone());

        let actions = eng.serve_block_request(
            vec![known.hash(), hash_bytes(b"unknown")],
            ReplicaId(2),
            &store,
        );
        match &actions[..] {
            [Action::SendReplica {
                to,
                message: OutboundMessage::BlockResponse(blocks),
            }] => {
                assert_eq!(*to, ReplicaId(2));
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].hash(), known.hash());
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn cmd_fetch_coalesces_and_resolves_locally() {
        let mut store = BlockStore::new();
        let mut eng = engine();
        let cmd = Command::new(b"payload".to_vec());
        let hash = cmd.hash();

        assert_eq!(eng.fetch_cmd(hash, &store), CmdFetch::Pending);
        assert_eq!(eng.fetch_cmd(hash, &store), CmdFetch::Pending);
        assert_eq!(eng.status().cmd_fetch_waiting, 1);

        store.add_cmd(cmd);
        assert_eq!(eng.on_cmd_stored(hash), 2);
        assert_eq!(eng.status().cmd_fetch_waiting, 0);
        assert_eq!(eng.fetch_cmd(hash, &store), CmdFetch::Ready);
    }
}
