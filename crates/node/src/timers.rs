//! Timer management for the runner.
//!
//! Tokio-based timers for the deterministic state machine. Each timer is a
//! spawned task that sleeps and posts the matching event; setting a timer
//! with an id that is already armed replaces it.

use std::collections::HashMap;
use std::time::Duration;
use threechain_core::{Event, TimerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Convert a TimerId to the event it fires.
fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Impeach => Event::ImpeachTimer,
        TimerId::Stats => Event::StatTimer,
        TimerId::FetchTick => Event::FetchTick,
    }
}

/// Manages the runner's timers.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer, replacing any existing timer with the same id.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = event_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
    }

    /// Cancel a timer. No-op if it does not exist or already fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// Cancel everything. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires_matching_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::Impeach, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::ImpeachTimer));
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::Stats, Duration::from_millis(30));
        timers.cancel_timer(TimerId::Stats);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "cancelled timer fired");
    }

    #[tokio::test]
    async fn rearming_replaces_the_old_timer() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerManager::new(tx);
        timers.set_timer(TimerId::FetchTick, Duration::from_secs(60));
        timers.set_timer(TimerId::FetchTick, Duration::from_millis(10));
        assert_eq!(timers.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(event, Event::FetchTick));
    }
}
