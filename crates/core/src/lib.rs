//! Core event/action vocabulary for threechain.
//!
//! This crate defines the language of the deterministic replica state
//! machine:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same instant
//!
//! # Architecture
//!
//! The protocol logic is built on a simple event-driven model:
//!
//! ```text
//! Events → state machine handlers → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no `.await`
//! - **Deterministic**: same state + event = same actions
//! - **Pure-ish**: mutates itself and the block store, performs no I/O
//!
//! All I/O is handled by the runner, which delivers events, executes the
//! returned actions, and converts action results (network responses, timer
//! fires, verification results) back into events. Handler bodies are the
//! atomic unit of reasoning: between two events nothing else touches
//! protocol state.

mod action;
mod event;
mod message;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::OutboundMessage;

/// Identifies a pending client request so a `Finality` can be routed back
/// to the connection that submitted the command. Allocated by the runner;
/// opaque to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Timers the state machine can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Impeachment watchdog: fires when no commit happened for the
    /// configured window.
    Impeach,
    /// Periodic statistics dump.
    Stats,
    /// Periodic fetch-timeout scan (candidate rotation).
    FetchTick,
}
