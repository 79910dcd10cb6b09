//! Firehose worker daemon.
//!
//! Binds a queue to the configured event/class/path patterns and logs
//! every matching event. Useful for tailing an exchange in staging or
//! verifying bindings before pointing real consumers at them.
//!
//! Configuration (environment):
//! - `AMQP_URL`, `RIVER_ENV`, `RIVER_EXCHANGE`: see `RiverConfig`
//! - `FIREHOSE_QUEUE`: queue name (default `firehose`)
//! - `FIREHOSE_EVENT` / `FIREHOSE_CLASS` / `FIREHOSE_PATH`: optional
//!   binding patterns; all unset means match everything
//! - `FIREHOSE_WORKERS`: workers for the queue (default 1)

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use river::{
    AmqpTransport, Handler, HandlerError, ListenerOptions, Message, Outcome, QueueSpec,
    RiverConfig, Supervisor,
};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct FirehoseHandler;

#[async_trait]
impl Handler for FirehoseHandler {
    async fn call(&self, message: &Message) -> Result<Outcome, HandlerError> {
        info!(
            routing_key = %message.routing_key(),
            payload = %message.payload(),
            "event"
        );
        Ok(Outcome::Handled)
    }

    fn name(&self) -> &'static str {
        "firehose"
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn queue_spec_from_env() -> QueueSpec {
    let mut spec = QueueSpec::new(env::var("FIREHOSE_QUEUE").unwrap_or_else(|_| "firehose".into()));
    if let Ok(event) = env::var("FIREHOSE_EVENT") {
        spec = spec.with_event(event);
    }
    if let Ok(class) = env::var("FIREHOSE_CLASS") {
        spec = spec.with_class(class);
    }
    if let Ok(path) = env::var("FIREHOSE_PATH") {
        spec = spec.with_path(path);
    }
    spec
}

/// Run the firehose worker until SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    init_tracing();

    let config = RiverConfig::from_env().wrap_err("failed to load configuration")?;
    let spec = queue_spec_from_env();
    let worker_count: usize = env::var("FIREHOSE_WORKERS")
        .ok()
        .and_then(|count| count.parse().ok())
        .unwrap_or(1);

    info!(
        queue = %spec.name,
        exchange = %config.exchange_name(),
        workers = worker_count,
        "starting firehose"
    );

    let mut supervisor = Supervisor::new("firehose", AmqpTransport::new(), config)
        .with_worker_count(worker_count);
    supervisor.add_listener(Arc::new(FirehoseHandler), spec, ListenerOptions::default());
    supervisor.start_workers()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    supervisor.run(shutdown_rx).await?;
    info!("firehose stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
