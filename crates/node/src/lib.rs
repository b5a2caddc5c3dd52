//! threechain replica node.
//!
//! Composes the protocol crates into a runnable replica:
//!
//! - [`ReplicaStateMachine`]: the complete protocol logic (consensus,
//!   fetch/delivery, command pipeline) behind one `handle(event)` entry
//! - [`Runner`]: the single event-loop task executing state-machine
//!   actions
//! - [`PeerNetwork`] / [`ClientGateway`]: framed TCP for replica and
//!   client links
//! - [`VerifyPool`]: off-loop signature verification
//! - [`ReplicaOptions`]: CLI + TOML configuration

pub mod client;
pub mod config;
pub mod net;
pub mod pipeline;
pub mod runner;
pub mod state;
pub mod timers;
pub mod workers;

pub use client::ClientGateway;
pub use config::{Cli, ConfigError, FileConfig, PacemakerKind, ReplicaOptions};
pub use net::{NetError, PeerNetwork};
pub use pipeline::CommandPipeline;
pub use runner::{Runner, ShutdownHandle, EVENT_QUEUE};
pub use state::{ReplicaStateMachine, ReplicaTimings};
pub use timers::TimerManager;
pub use workers::VerifyPool;
