//! Replica state machine.
//!
//! Composes the consensus core, the fetch/delivery engine, and the command
//! pipeline over one block store, and routes events between them. This is
//! the complete protocol logic of a replica; the runner around it only
//! performs I/O.

use crate::pipeline::CommandPipeline;
use std::time::Duration;
use threechain_consensus::{HotStuffState, Pacemaker};
use threechain_core::{Action, Event, RequestId, TimerId};
use threechain_fetcher::{FetchConfig, FetchEngine};
use threechain_store::BlockStore;
use threechain_types::{Command, Finality, ReplicaId, ReplicaSet, SecretKey};
use tracing::{debug, info, warn};

/// Blocks behind the committed tip kept resident across pruning.
const PRUNE_HORIZON: u64 = 100;

/// Timing knobs of the replica state machine.
#[derive(Debug, Clone)]
pub struct ReplicaTimings {
    /// Window without commits after which the proposer is impeached.
    pub impeach_timeout: Duration,
    /// Interval between statistics dumps.
    pub stat_period: Duration,
    /// Interval of the fetch timeout scan.
    pub fetch_tick: Duration,
}

impl Default for ReplicaTimings {
    fn default() -> Self {
        Self {
            impeach_timeout: Duration::from_secs(11),
            stat_period: Duration::from_secs(10),
            fetch_tick: Duration::from_millis(200),
        }
    }
}

/// The full protocol state machine of one replica.
pub struct ReplicaStateMachine {
    id: ReplicaId,
    store: BlockStore,
    consensus: HotStuffState,
    fetcher: FetchEngine,
    pipeline: CommandPipeline,
    pmaker: Box<dyn Pacemaker>,
    timings: ReplicaTimings,
    /// Height of our most recent proposal. Beats are skipped until the
    /// branch head reaches it, so one uncertified proposal is outstanding
    /// at a time and batches queue behind it.
    last_proposed_height: Option<u64>,
}

impl ReplicaStateMachine {
    pub fn new(
        id: ReplicaId,
        signing_key: SecretKey,
        replicas: ReplicaSet,
        blk_size: usize,
        pmaker: Box<dyn Pacemaker>,
        fetch_config: FetchConfig,
        timings: ReplicaTimings,
    ) -> Self {
        Self {
            id,
            store: BlockStore::with_genesis(),
            consensus: HotStuffState::new(id, signing_key, replicas),
            fetcher: FetchEngine::new(fetch_config),
            pipeline: CommandPipeline::new(id, blk_size),
            pmaker,
            timings,
            last_proposed_height: None,
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn consensus(&self) -> &HotStuffState {
        &self.consensus
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Update the clock. Called by the runner before each `handle`.
    pub fn set_now(&mut self, now: Duration) {
        self.fetcher.set_now(now);
    }

    /// Actions to execute at startup: arm the periodic timers.
    pub fn startup(&self) -> Vec<Action> {
        let replicas = self.consensus.replicas();
        if replicas.faulty_allowance() == 0 {
            warn!(
                n = replicas.len(),
                "too few replicas in the system to tolerate any failure"
            );
        }
        info!(
            id = %self.id,
            n = replicas.len(),
            quorum = replicas.quorum_threshold(),
            "replica starting"
        );
        vec![
            Action::SetTimer {
                id: TimerId::Impeach,
                duration: self.timings.impeach_timeout,
            },
            Action::SetTimer {
                id: TimerId::Stats,
                duration: self.timings.stat_period,
            },
            Action::SetTimer {
                id: TimerId::FetchTick,
                duration: self.timings.fetch_tick,
            },
        ]
    }

    /// Process one event. The handler body is the atomic unit: no other
    /// protocol code runs while it does.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            // ── Network ────────────────────────────────────────────────
            Event::ProposalReceived { proposal, from } => {
                self.fetcher.on_proposal(proposal, from, &mut self.store)
            }
            Event::VoteReceived { vote, from } => {
                self.fetcher.on_vote(vote, from, &mut self.store)
            }
            Event::BlockRequestReceived { hashes, from } => {
                self.fetcher.serve_block_request(hashes, from, &self.store)
            }
            Event::BlockResponseReceived { blocks, from } => {
                self.fetcher.on_blocks(blocks, from, &mut self.store)
            }

            // ── Delivered protocol inputs ──────────────────────────────
            Event::ProposalReady { proposal } => {
                self.consensus
                    .on_proposal_ready(proposal, &mut self.store, self.pmaker.as_mut())
            }
            Event::VoteReady { vote } => self.consensus.on_vote_ready(vote),

            // ── Verification callbacks ─────────────────────────────────
            Event::VoteVerified { vote, valid } => self.consensus.on_vote_verified(
                vote,
                valid,
                &mut self.store,
                self.pmaker.as_mut(),
            ),
            Event::BlockJustifyVerified { blk_hash, valid } => {
                self.fetcher
                    .on_justify_verified(blk_hash, valid, &mut self.store)
            }

            // ── Client ─────────────────────────────────────────────────
            Event::CommandSubmitted { cmd, request } => self.on_command(cmd, request),

            // ── Pipeline ───────────────────────────────────────────────
            Event::BeatReady { round } => self.on_beat(round),
            Event::BlockExecuted { blk_hash } => {
                let mut actions = self.pipeline.on_executed(blk_hash, &self.store);
                // Progress happened: push the impeachment watchdog out.
                actions.push(Action::SetTimer {
                    id: TimerId::Impeach,
                    duration: self.timings.impeach_timeout,
                });
                actions
            }

            // ── Timers ─────────────────────────────────────────────────
            Event::ImpeachTimer => {
                let mut actions = self.pmaker.impeach();
                actions.push(Action::SetTimer {
                    id: TimerId::Impeach,
                    duration: self.timings.impeach_timeout,
                });
                actions
            }
            Event::FetchTick => {
                let mut actions = self.fetcher.on_tick();
                actions.push(Action::SetTimer {
                    id: TimerId::FetchTick,
                    duration: self.timings.fetch_tick,
                });
                actions
            }
            Event::StatTimer => {
                self.print_stat();
                vec![Action::SetTimer {
                    id: TimerId::Stats,
                    duration: self.timings.stat_period,
                }]
            }
        }
    }

    /// Client command admission.
    ///
    /// A non-proposer answers immediately with a sentinel naming the
    /// proposer and keeps an `unconfirmed` future that fires once the
    /// command's commit propagates here. The proposer batches the command
    /// and requests a beat when a batch fills.
    fn on_command(&mut self, cmd: Command, request: RequestId) -> Vec<Action> {
        let cmd_hash = self.store.add_cmd(cmd);
        self.fetcher.on_cmd_stored(cmd_hash);

        let proposer = self.pmaker.proposer();
        if proposer != self.id {
            debug!(
                cmd = %cmd_hash.short(),
                proposer = %proposer,
                "not the proposer, answering with sentinel"
            );
            self.pipeline.register_unconfirmed(cmd_hash, request);
            return vec![Action::RespondClient {
                request,
                finality: Finality::not_proposer(proposer, cmd_hash),
            }];
        }

        let batch_ready = self.pipeline.admit(cmd_hash, request);
        if batch_ready {
            self.pmaker.beat()
        } else {
            vec![]
        }
    }

    /// A beat arrived: turn the oldest waiting batch into a proposal,
    /// unless our previous proposal is still waiting for its certificate.
    fn on_beat(&mut self, round: u64) -> Vec<Action> {
        if self.pmaker.proposer() != self.id {
            // The round moved on (impeachment) between beat and dispatch.
            debug!(round, "stale beat, dropping");
            return vec![];
        }
        let branch_height = self
            .store
            .blk_height(&self.consensus.bqc())
            .map_or(0, |h| h.0);
        if let Some(last) = self.last_proposed_height {
            if branch_height < last {
                debug!(
                    last_proposed = last,
                    branch_height, "previous proposal uncertified, batch stays queued"
                );
                return vec![];
            }
        }
        let Some(batch) = self.pipeline.take_batch() else {
            return vec![];
        };
        let parents = self
            .pmaker
            .parents(&self.store, self.consensus.bqc(), self.consensus.b_exec());
        self.last_proposed_height = Some(branch_height + 1);
        self.consensus.on_propose(batch, parents, &mut self.store)
    }

    /// Periodic statistics dump, mirroring the queues and counters that
    /// matter when diagnosing a stuck replica.
    fn print_stat(&mut self) {
        let fetch = self.fetcher.status();
        let pipe = self.pipeline.status();
        let consensus = self.consensus.stats();

        info!("===== begin stats =====");
        info!(
            blk_fetch_waiting = fetch.blk_fetch_waiting,
            blk_delivery_waiting = fetch.blk_delivery_waiting,
            cmd_fetch_waiting = fetch.cmd_fetch_waiting,
            parked = fetch.parked,
            "-------- queues -------"
        );
        info!(
            cmd_pending = pipe.cmd_pending,
            batches_waiting = pipe.batches_waiting,
            decision_waiting = pipe.decision_waiting,
            unconfirmed = pipe.unconfirmed,
            vote_sets = self.consensus.vote_set_count(),
            "------ pipeline -------"
        );
        info!(
            fetched = fetch.fetched,
            delivered = fetch.delivered,
            decided = pipe.decided,
            proposed = consensus.proposed,
            voted = consensus.voted,
            blk_cache = self.store.blk_cache_size(),
            cmd_cache = self.store.cmd_cache_size(),
            "-------- totals -------"
        );
        let window = self.fetcher.take_window();
        let window_decided = self.pipeline.take_window_decided();
        info!(
            fetched = window.fetched,
            delivered = window.delivered,
            decided = window_decided,
            "------- window --------"
        );
        info!("====== end stats ======");

        // Piggyback cache eviction on the stat cadence. Everything within
        // the horizon behind the committed tip stays resident.
        self.store.prune(&self.consensus.b_exec(), PRUNE_HORIZON);
    }
}
