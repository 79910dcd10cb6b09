//! Worker fleet supervisor.
//!
//! Owns one worker pool per registered queue and keeps each pool at its
//! configured minimum size: spawn on start, replace the dead on a
//! periodic tick, drain everything on shutdown.

use crate::config::{QueueSpec, RiverConfig};
use crate::error::RiverError;
use crate::pool::{Entry, PoolSpec, WorkerPool};
use crate::river::River;
use crate::transport::Transport;
use crate::worker::{Handler, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Per-listener worker options.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Workers for this queue. Defaults to the supervisor-wide count.
    /// Zero disables the queue.
    pub worker_count: Option<usize>,

    /// Whether workers ack/nack on the handler's behalf.
    pub managed_acking: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            worker_count: None,
            managed_acking: true,
        }
    }
}

struct Listener {
    handler: Arc<dyn Handler>,
    queue_spec: QueueSpec,
    options: ListenerOptions,
}

/// Supervises one pool of workers per registered queue.
pub struct Supervisor<T> {
    name: String,
    transport: T,
    config: RiverConfig,
    worker_count: usize,
    interval: Duration,
    listeners: Vec<Listener>,
    pools: Vec<WorkerPool>,
}

impl<T> Supervisor<T>
where
    T: Transport + Clone + 'static,
{
    pub fn new(name: impl Into<String>, transport: T, config: RiverConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            config,
            worker_count: 1,
            interval: DEFAULT_TICK_INTERVAL,
            listeners: Vec::new(),
            pools: Vec::new(),
        }
    }

    /// Default worker count for queues without an explicit one.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Interval between `ensure_workers` ticks.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register a handler for a queue. Nothing starts until
    /// [`start_workers`](Self::start_workers).
    pub fn add_listener(
        &mut self,
        handler: Arc<dyn Handler>,
        queue_spec: QueueSpec,
        options: ListenerOptions,
    ) {
        self.listeners.push(Listener {
            handler,
            queue_spec,
            options,
        });
    }

    /// Build the worker pools. Fails when no listener was registered;
    /// queues configured with zero workers are logged and skipped.
    pub fn start_workers(&mut self) -> Result<(), RiverError> {
        if self.listeners.is_empty() {
            return Err(RiverError::Configuration(
                "no listeners configured".to_string(),
            ));
        }

        let mut pools = Vec::new();
        for listener in &self.listeners {
            let min_workers = listener.options.worker_count.unwrap_or(self.worker_count);
            if min_workers == 0 {
                info!(queue = %listener.queue_spec.name, "queue disabled, skipping");
                continue;
            }
            let process_title =
                format!("{}: queue worker: {}", self.name, listener.queue_spec.name);
            pools.push(WorkerPool::new(PoolSpec {
                queue_name: listener.queue_spec.name.clone(),
                entry: self.worker_entry(listener, process_title.clone()),
                process_title,
                min_workers,
            }));
        }
        self.pools = pools;
        Ok(())
    }

    /// The per-slot entry: each invocation builds a fresh worker with
    /// its own connection and returns its run future.
    fn worker_entry(&self, listener: &Listener, process_title: String) -> Entry {
        let transport = self.transport.clone();
        let config = self.config.clone();
        let handler = Arc::clone(&listener.handler);
        let queue_spec = listener.queue_spec.clone();
        let managed_acking = listener.options.managed_acking;

        Arc::new(move |stop| {
            let river = River::new(transport.clone(), config.clone());
            let mut worker = Worker::new(river, Arc::clone(&handler), queue_spec.clone())
                .with_managed_acking(managed_acking);
            let span = info_span!(
                "queue_worker",
                title = %process_title,
                queue = %queue_spec.name,
            );
            Box::pin(
                async move {
                    worker.run(stop).await;
                }
                .instrument(span),
            )
        })
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Total live workers across all pools.
    pub fn live_worker_count(&self) -> usize {
        self.pools.iter().map(WorkerPool::live_count).sum()
    }

    /// Run the supervision loop until the shutdown watch flips:
    /// spawn one worker per pool, then tick `ensure_workers` on the
    /// configured interval. Shutdown drains every pool before
    /// returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), RiverError> {
        if self.pools.is_empty() {
            self.start_workers()?;
        }
        info!(name = %self.name, pools = self.pools.len(), "starting workers");
        for pool in &mut self.pools {
            pool.spawn_worker();
        }

        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    self.ensure_workers();
                }
            }
        }

        self.shutdown_workers().await;
        Ok(())
    }

    /// Prune dead workers and bring every pool back to strength.
    pub fn ensure_workers(&mut self) {
        for pool in &mut self.pools {
            pool.ensure();
        }
    }

    /// Signal every pool to stop and wait for all workers to exit.
    /// There is no hard timeout: a hung worker stalls shutdown.
    pub async fn shutdown_workers(&mut self) {
        info!(name = %self.name, "shutting down all workers");
        for pool in &self.pools {
            pool.stop();
        }

        let mut last_log: Option<Instant> = None;
        loop {
            let live: usize = self
                .pools
                .iter_mut()
                .map(|pool| {
                    pool.prune_dead();
                    pool.live_count()
                })
                .sum();
            if live == 0 {
                break;
            }
            if last_log.map_or(true, |at| at.elapsed() >= SHUTDOWN_LOG_INTERVAL) {
                info!(live, "waiting for workers to quit");
                last_log = Some(Instant::now());
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        info!(name = %self.name, "all workers stopped");
    }
}
