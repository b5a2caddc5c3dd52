//! Signature-verification worker pool.
//!
//! Vote and certificate verification are the CPU cost of the protocol, so
//! they run off the event loop on a rayon pool sized by the `nworker`
//! option. Results post back to the loop as events. On shutdown the queue
//! drains without executing: pending jobs observe the flag and discard
//! themselves, and any in-flight result is dropped by the closed channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use threechain_core::{Action, Event};
use threechain_types::ReplicaSet;
use tokio::sync::mpsc;
use tracing::warn;

/// Worker pool handle. Cheap to clone.
#[derive(Clone)]
pub struct VerifyPool {
    pool: Arc<rayon::ThreadPool>,
    replicas: Arc<ReplicaSet>,
    event_tx: mpsc::Sender<Event>,
    queue_depth: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl VerifyPool {
    pub fn new(
        nworker: usize,
        replicas: Arc<ReplicaSet>,
        event_tx: mpsc::Sender<Event>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nworker.max(1))
            .thread_name(|i| format!("verify-{i}"))
            .build()?;
        Ok(Self {
            pool: Arc::new(pool),
            replicas,
            event_tx,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Jobs submitted but not yet finished.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Stop executing queued jobs. Already-running jobs finish; their
    /// results go nowhere once the event channel closes.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Dispatch a delegated verification action.
    ///
    /// Panics if handed a non-delegated action; the runner routes only
    /// `VerifyVote` and `VerifyBlockJustify` here.
    pub fn submit(&self, action: Action) {
        debug_assert!(action.is_delegated());
        let replicas = self.replicas.clone();
        let event_tx = self.event_tx.clone();
        let queue_depth = self.queue_depth.clone();
        let shutdown = self.shutdown.clone();

        queue_depth.fetch_add(1, Ordering::Relaxed);
        self.pool.spawn(move || {
            if shutdown.load(Ordering::Relaxed) {
                queue_depth.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            let event = match action {
                Action::VerifyVote { vote, public_key } => {
                    let valid = vote.verify(&public_key).is_ok();
                    Event::VoteVerified { vote, valid }
                }
                Action::VerifyBlockJustify { blk_hash, qc } => {
                    let valid = qc.verify(&replicas).is_ok();
                    Event::BlockJustifyVerified { blk_hash, valid }
                }
                other => {
                    warn!(action = other.type_name(), "non-delegated action in pool");
                    queue_depth.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };
            queue_depth.fetch_sub(1, Ordering::Relaxed);
            // The loop may already be gone during shutdown.
            let _ = event_tx.blocking_send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use threechain_types::{hash_bytes, ReplicaId, ReplicaInfo, SecretKey, Vote};

    fn replica_set(n: u16) -> (Arc<ReplicaSet>, Vec<SecretKey>) {
        let keys: Vec<SecretKey> = (0..n)
            .map(|i| SecretKey::from_bytes(&[i as u8 + 1; 32]))
            .collect();
        let set = ReplicaSet::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ReplicaInfo {
                    id: ReplicaId(i as u16),
                    addr: format!("127.0.0.1:{}", 8000 + i).parse().unwrap(),
                    public_key: k.public_key(),
                })
                .collect(),
        )
        .unwrap();
        (Arc::new(set), keys)
    }

    #[tokio::test]
    async fn vote_verification_round_trips() {
        let (replicas, keys) = replica_set(4);
        let (tx, mut rx) = mpsc::channel(8);
        let pool = VerifyPool::new(2, replicas, tx).unwrap();

        let good = Vote::new(ReplicaId(1), hash_bytes(b"blk"), hash_bytes(b"bqc"), &keys[1]);
        pool.submit(Action::VerifyVote {
            vote: good,
            public_key: keys[1].public_key(),
        });

        // A vote signed with the wrong key.
        let bad = Vote::new(ReplicaId(2), hash_bytes(b"blk"), hash_bytes(b"bqc"), &keys[0]);
        pool.submit(Action::VerifyVote {
            vote: bad,
            public_key: keys[2].public_key(),
        });

        let mut results = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timeout")
                .expect("channel closed");
            match event {
                Event::VoteVerified { vote, valid } => results.push((vote.voter, valid)),
                other => panic!("unexpected event {}", other.type_name()),
            }
        }
        results.sort_by_key(|(id, _)| id.0);
        assert_eq!(results, vec![(ReplicaId(1), true), (ReplicaId(2), false)]);
    }

    #[tokio::test]
    async fn shutdown_discards_pending_jobs() {
        let (replicas, keys) = replica_set(4);
        let (tx, mut rx) = mpsc::channel(64);
        let pool = VerifyPool::new(1, replicas, tx).unwrap();
        pool.shutdown();

        let vote = Vote::new(ReplicaId(0), hash_bytes(b"b"), hash_bytes(b"q"), &keys[0]);
        pool.submit(Action::VerifyVote {
            vote,
            public_key: keys[0].public_key(),
        });

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "job ran after shutdown");
        assert_eq!(pool.queue_depth(), 0);
    }
}
