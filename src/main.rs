use clap::Parser;
use docmill::{config, logging, worker};

/// Document ingestion worker: claims tasks from the shared queue and runs the
/// chunk, embed, summarize, and index pipeline.
#[derive(Parser)]
#[command(name = "docmill", version, about)]
struct Args {
    /// Ordinal distinguishing this worker's consumer identity.
    #[arg(long, default_value_t = 0)]
    consumer: u32,

    /// Milliseconds a poll blocks waiting for new work.
    #[arg(long, default_value_t = 1000)]
    poll_block_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    config::init_config();
    logging::init_tracing();

    let worker = worker::Worker::connect(args.consumer)
        .await
        .expect("Failed to connect worker")
        .with_poll_block_ms(args.poll_block_ms);
    let _heartbeat = worker::spawn_heartbeat(
        worker.queue().clone(),
        worker.consumer().to_string(),
    );
    tracing::info!(consumer = worker.consumer(), "Worker started");
    worker.run().await;
}
