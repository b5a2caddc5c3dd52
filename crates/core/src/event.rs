//! Event types for the deterministic state machine.

use crate::RequestId;
use threechain_types::{Block, Command, Hash, Proposal, ReplicaId, Vote};

/// Priority levels for event ordering within the same instant.
///
/// Lower values = higher priority (processed first). Internal events are
/// consequences of prior processing and must run before new external
/// inputs to preserve causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the replica itself.
    Timer = 1,

    /// Network events: inputs from other replicas.
    Network = 2,

    /// Client events: inputs from users.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The impeachment window elapsed with no commit.
    ImpeachTimer,

    /// Time to dump periodic statistics.
    StatTimer,

    /// Periodic scan for fetch requests that timed out and should rotate
    /// to their next candidate replica.
    FetchTick,

    // ═══════════════════════════════════════════════════════════════════════
    // Network Messages (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A proposal arrived from a peer. Its block and branch-QC reference
    /// may not be materialized locally yet.
    ProposalReceived { proposal: Proposal, from: ReplicaId },

    /// A vote arrived from a peer.
    VoteReceived { vote: Vote, from: ReplicaId },

    /// A peer asked for blocks by hash.
    BlockRequestReceived { hashes: Vec<Hash>, from: ReplicaId },

    /// A peer answered a block request.
    BlockResponseReceived { blocks: Vec<Block>, from: ReplicaId },

    // ═══════════════════════════════════════════════════════════════════════
    // Client Requests (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client submitted a command for replication.
    CommandSubmitted { cmd: Command, request: RequestId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal Events (priority: Internal)
    // ═══════════════════════════════════════════════════════════════════════
    /// A proposal's block and branch-QC reference are fully delivered;
    /// the consensus core may now process it.
    ProposalReady { proposal: Proposal },

    /// A vote's referenced blocks are fully delivered; the vote may now be
    /// verified and counted.
    VoteReady { vote: Vote },

    /// The pacemaker granted a beat: this replica may propose now.
    BeatReady { round: u64 },

    /// A block was executed against the replicated state machine during a
    /// commit sweep. Fired in ancestor-first order.
    BlockExecuted { blk_hash: Hash },

    // ═══════════════════════════════════════════════════════════════════════
    // Async Callbacks (priority: Internal)
    // Results from delegated verification work.
    // ═══════════════════════════════════════════════════════════════════════
    /// Vote signature verification completed.
    ///
    /// Callback from `Action::VerifyVote`.
    VoteVerified { vote: Vote, valid: bool },

    /// A delivered block's embedded justify certificate was verified.
    ///
    /// Callback from `Action::VerifyBlockJustify`.
    BlockJustifyVerified { blk_hash: Hash, valid: bool },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ProposalReady { .. }
            | Event::VoteReady { .. }
            | Event::BeatReady { .. }
            | Event::BlockExecuted { .. }
            | Event::VoteVerified { .. }
            | Event::BlockJustifyVerified { .. } => EventPriority::Internal,

            Event::ImpeachTimer | Event::StatTimer | Event::FetchTick => EventPriority::Timer,

            Event::ProposalReceived { .. }
            | Event::VoteReceived { .. }
            | Event::BlockRequestReceived { .. }
            | Event::BlockResponseReceived { .. } => EventPriority::Network,

            Event::CommandSubmitted { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Get the event type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ImpeachTimer => "ImpeachTimer",
            Event::StatTimer => "StatTimer",
            Event::FetchTick => "FetchTick",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::VoteReceived { .. } => "VoteReceived",
            Event::BlockRequestReceived { .. } => "BlockRequestReceived",
            Event::BlockResponseReceived { .. } => "BlockResponseReceived",
            Event::CommandSubmitted { .. } => "CommandSubmitted",
            Event::ProposalReady { .. } => "ProposalReady",
            Event::VoteReady { .. } => "VoteReady",
            Event::BeatReady { .. } => "BeatReady",
            Event::BlockExecuted { .. } => "BlockExecuted",
            Event::VoteVerified { .. } => "VoteVerified",
            Event::BlockJustifyVerified { .. } => "BlockJustifyVerified",
        }
    }
}
