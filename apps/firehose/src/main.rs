//! Firehose worker daemon - entry point.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    river_firehose::run().await
}
