//! Outbound message types for replica-to-replica communication.

use threechain_types::{Block, Hash, Proposal, Vote};

/// Outbound network messages.
///
/// These are the messages a replica can send to other replicas. The runner
/// handles the actual network I/O and wire encoding.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// A new block proposal, broadcast by the proposer.
    Propose(Proposal),

    /// A vote, sent to the next proposer.
    Vote(Vote),

    /// Request blocks by hash from a peer.
    BlockRequest(Vec<Hash>),

    /// Answer a block request with the stored blocks.
    BlockResponse(Vec<Block>),
}

impl OutboundMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Propose(_) => "Propose",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::BlockRequest(_) => "BlockRequest",
            OutboundMessage::BlockResponse(_) => "BlockResponse",
        }
    }
}
