//! HotStuff consensus for threechain.
//!
//! This crate provides the consensus state machine (voting rule, quorum
//! certificate aggregation, three-chain commit) and the pluggable
//! pacemaker policies that drive proposer rotation.
//!
//! # Protocol Summary
//!
//! Replicas vote for proposed blocks; `2f + 1` votes mint a quorum
//! certificate. Each block carries the certificate of the branch it
//! extends, so certificates chain through the block DAG. A block is final
//! once it heads a *three-chain*: three blocks linked by direct-parent
//! certificate references. The voting rule (never vote below `vheight`,
//! never abandon the locked branch without a higher justify) makes
//! conflicting finality impossible with at most `f` Byzantine replicas.
//!
//! All I/O is performed by the runner via returned `Action`s; block data
//! lives in the block store and is referenced by hash.

mod pacemaker;
mod state;
mod vote_set;

pub use pacemaker::{Pacemaker, RoundRobinPacemaker};
pub use state::{ConsensusStats, HotStuffState};
pub use vote_set::VoteSet;
