//! Action types for the deterministic state machine.

use crate::{message::OutboundMessage, Event, RequestId, TimerId};
use std::time::Duration;
use threechain_types::{Finality, Hash, PublicKey, QuorumCertificate, ReplicaId, Vote};

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Send a message to every other replica.
    Broadcast { message: OutboundMessage },

    /// Send a message to one replica.
    SendReplica {
        to: ReplicaId,
        message: OutboundMessage,
    },

    /// Send a finality record to the client connection behind `request`.
    /// A request may be answered more than once (the not-proposer sentinel
    /// followed by the confirmed finality).
    RespondClient {
        request: RequestId,
        finality: Finality,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Replaces any timer with the
    /// same id.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing, ahead of any
    /// pending external input.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (worker pool, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Verify a vote's signature against the voter's public key.
    ///
    /// Runs on the verification worker pool; completes as
    /// `Event::VoteVerified`.
    VerifyVote { vote: Vote, public_key: PublicKey },

    /// Verify a block's embedded justify certificate against the replica
    /// set.
    ///
    /// Runs on the verification worker pool; completes as
    /// `Event::BlockJustifyVerified`.
    VerifyBlockJustify {
        blk_hash: Hash,
        qc: QuorumCertificate,
    },
}

impl Action {
    /// Get the action type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendReplica { .. } => "SendReplica",
            Action::RespondClient { .. } => "RespondClient",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyVote { .. } => "VerifyVote",
            Action::VerifyBlockJustify { .. } => "VerifyBlockJustify",
        }
    }

    /// Check if this action is delegated work (runs on the worker pool and
    /// returns a callback event).
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::VerifyVote { .. } | Action::VerifyBlockJustify { .. }
        )
    }

    /// Check if this is an internal event action.
    pub fn is_internal(&self) -> bool {
        matches!(self, Action::EnqueueInternal { .. })
    }
}
