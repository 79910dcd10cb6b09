//! Worker pool primitive.
//!
//! The process-management contract the supervisor drives: spawn worker
//! entries, count live and dead ones, replace casualties, signal stop.
//! One pool per queue; each slot is a spawned task running one worker's
//! blocking loop.

use crate::metrics;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A worker entry point: given a stop signal, returns the future one
/// worker slot runs to completion.
///
/// Entries are plain values — they capture nothing mutable and can be
/// invoked any number of times to build replacement workers.
pub type Entry = Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything a pool needs to keep one queue staffed.
pub struct PoolSpec {
    /// Queue the pool's workers consume.
    pub queue_name: String,

    /// Observability title attached to every worker span.
    pub process_title: String,

    /// Factory for worker run futures.
    pub entry: Entry,

    /// Minimum number of live workers.
    pub min_workers: usize,
}

/// A supervised set of worker slots for one queue.
pub struct WorkerPool {
    spec: PoolSpec,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    dead_total: u64,
    recovering: bool,
    reached_full_strength: bool,
}

impl WorkerPool {
    pub fn new(spec: PoolSpec) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            spec,
            stop_tx,
            handles: Vec::new(),
            dead_total: 0,
            recovering: false,
            reached_full_strength: false,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.spec.queue_name
    }

    pub fn min_workers(&self) -> usize {
        self.spec.min_workers
    }

    /// Workers whose tasks have not finished.
    pub fn live_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Total workers that have died over the pool's lifetime.
    pub fn dead_total(&self) -> u64 {
        self.dead_total
    }

    /// Spawn one worker slot.
    pub fn spawn_worker(&mut self) {
        info!(
            queue = %self.spec.queue_name,
            title = %self.spec.process_title,
            "spawning worker"
        );
        metrics::record_worker_spawned(&self.spec.queue_name);
        let future = (self.spec.entry)(self.stop_tx.subscribe());
        self.handles.push(tokio::spawn(future));
    }

    /// Drop finished handles; returns how many were pruned.
    pub fn prune_dead(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|handle| !handle.is_finished());
        let dead = before - self.handles.len();
        self.dead_total += dead as u64;
        dead
    }

    /// Bring the pool back to strength: prune casualties, log a death
    /// once a previously full pool comes up short, and spawn
    /// replacements one at a time. Logs a single recovery line when the
    /// pool is whole again.
    pub fn ensure(&mut self) {
        let dead = self.prune_dead();
        if dead > 0 && self.handles.len() < self.spec.min_workers && self.reached_full_strength {
            error!(
                queue = %self.spec.queue_name,
                dead,
                live = self.handles.len(),
                min = self.spec.min_workers,
                "worker died"
            );
            metrics::record_worker_died(&self.spec.queue_name);
            self.recovering = true;
        }
        while self.handles.len() < self.spec.min_workers {
            self.spawn_worker();
        }
        if self.handles.len() >= self.spec.min_workers {
            if self.recovering {
                info!(
                    queue = %self.spec.queue_name,
                    workers = self.handles.len(),
                    "all workers up"
                );
                self.recovering = false;
            }
            self.reached_full_strength = true;
        }
    }

    /// Signal every worker in the pool to stop. Idempotent; stopping an
    /// already-stopped pool is a no-op.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn obedient_entry(started: Arc<AtomicU32>) -> Entry {
        Arc::new(move |mut stop| {
            let started = Arc::clone(&started);
            Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                while !*stop.borrow() {
                    if stop.changed().await.is_err() {
                        break;
                    }
                }
            })
        })
    }

    fn crashing_entry() -> Entry {
        Arc::new(|_stop| Box::pin(async {}))
    }

    async fn settle() {
        // Let spawned tasks reach their first await (or finish).
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn pool(entry: Entry, min_workers: usize) -> WorkerPool {
        WorkerPool::new(PoolSpec {
            queue_name: "work".to_string(),
            process_title: "test: queue worker: work".to_string(),
            entry,
            min_workers,
        })
    }

    #[tokio::test]
    async fn ensure_staffs_the_pool_to_minimum() {
        let started = Arc::new(AtomicU32::new(0));
        let mut pool = pool(obedient_entry(Arc::clone(&started)), 3);

        pool.ensure();
        settle().await;

        assert_eq!(pool.live_count(), 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);

        pool.stop();
        settle().await;
        assert_eq!(pool.prune_dead(), 3);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn dead_workers_are_pruned_and_replaced() {
        let mut pool = pool(crashing_entry(), 2);

        pool.ensure();
        settle().await;
        assert_eq!(pool.live_count(), 0);

        pool.ensure();
        settle().await;
        assert_eq!(pool.dead_total(), 2);

        // Replacements keep coming every tick, one generation at a time.
        pool.ensure();
        settle().await;
        assert_eq!(pool.dead_total(), 4);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let started = Arc::new(AtomicU32::new(0));
        let mut pool = pool(obedient_entry(started), 1);
        pool.ensure();
        settle().await;

        pool.stop();
        pool.stop();
        settle().await;
        pool.prune_dead();
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_workers_drain_within_a_poll_cycle() {
        let started = Arc::new(AtomicU32::new(0));
        let mut pool = pool(obedient_entry(started), 2);
        pool.ensure();
        settle().await;
        assert_eq!(pool.live_count(), 2);

        pool.stop();
        tokio::time::sleep(Duration::from_millis(250)).await;
        pool.prune_dead();
        assert_eq!(pool.live_count(), 0);
    }
}
