//! The replica runner: a single event-loop task plus I/O collaborators.
//!
//! All protocol state lives in the [`ReplicaStateMachine`] and is touched
//! only here, one event at a time. The runner executes the actions each
//! handler returns: network sends, client responses, timer management, and
//! delegated verification. Internal events produced by an action are
//! processed before the next external event is pulled, preserving
//! causality.

use crate::client::ClientGateway;
use crate::net::PeerNetwork;
use crate::state::ReplicaStateMachine;
use crate::timers::TimerManager;
use crate::workers::VerifyPool;
use std::collections::VecDeque;
use std::time::Instant;
use threechain_core::{Action, Event};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, trace};

/// Queue depth of the main event channel.
pub const EVENT_QUEUE: usize = 4096;

/// Handle for shutting down a running replica. Signals on drop.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// The assembled replica.
pub struct Runner {
    state: ReplicaStateMachine,
    event_rx: mpsc::Receiver<Event>,
    timers: TimerManager,
    peers: PeerNetwork,
    clients: ClientGateway,
    verify: VerifyPool,
    /// Internal events waiting to run ahead of external input.
    internal: VecDeque<Event>,
    start: Instant,
}

impl Runner {
    pub fn new(
        state: ReplicaStateMachine,
        event_rx: mpsc::Receiver<Event>,
        timers: TimerManager,
        peers: PeerNetwork,
        clients: ClientGateway,
        verify: VerifyPool,
    ) -> Self {
        Self {
            state,
            event_rx,
            timers,
            peers,
            clients,
            verify,
            internal: VecDeque::new(),
            start: Instant::now(),
        }
    }

    /// Run the event loop until `shutdown` fires or every event source
    /// closes.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        for action in self.state.startup() {
            self.execute(action).await;
        }
        self.drain_internal().await;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                event = self.event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(event).await;
                    self.drain_internal().await;
                }
            }
        }

        self.verify.shutdown();
        self.peers.shutdown();
        self.clients.shutdown();
        self.timers.cancel_all();
        info!("replica stopped");
    }

    /// Process one event through the state machine and execute its
    /// actions.
    async fn dispatch(&mut self, event: Event) {
        trace!(event = event.type_name(), "dispatch");
        self.state.set_now(self.start.elapsed());
        let actions = self.state.handle(event);
        for action in actions {
            self.execute(action).await;
        }
    }

    /// Run queued internal events (and whatever they enqueue) before the
    /// next external event.
    async fn drain_internal(&mut self) {
        while let Some(event) = self.internal.pop_front() {
            self.dispatch(event).await;
        }
    }

    async fn execute(&mut self, action: Action) {
        trace!(action = action.type_name(), "execute");
        match action {
            Action::Broadcast { message } => {
                self.peers.dispatch(None, message).await;
            }
            Action::SendReplica { to, message } => {
                self.peers.dispatch(Some(to), message).await;
            }
            Action::RespondClient { request, finality } => {
                self.clients.respond(request, finality);
            }
            Action::SetTimer { id, duration } => {
                self.timers.set_timer(id, duration);
            }
            Action::CancelTimer { id } => {
                self.timers.cancel_timer(id);
            }
            Action::EnqueueInternal { event } => {
                self.internal.push_back(event);
            }
            delegated @ (Action::VerifyVote { .. } | Action::VerifyBlockJustify { .. }) => {
                self.verify.submit(delegated);
            }
        }
    }
}
