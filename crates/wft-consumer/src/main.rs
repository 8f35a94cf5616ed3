//! wft queue consumer.
//!
//! Drains the `wft` work queue in batches for a bounded lifetime, then exits.
//! Meant to be re-run on a fixed interval (e.g. every 3 minutes from cron or a
//! scheduler), so a crash costs at most one run.
//!
//! # Usage
//!
//! ```bash
//! # Everything from the environment (or a .env file)
//! CLOUDAMQP_URL=amqp://... WFT_BACKEND_URL=http://app/internal wft-consumer
//!
//! # Shorter batches and lifetime
//! wft-consumer --batch-size 5 --batch-wait-secs 5 --lifetime-secs 60
//! ```
//!
//! # Exit Codes
//!
//! 0 after a normal lifetime-exceeded (or signalled) stop; non-zero when the
//! broker connection or the run loop itself fails.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wft_consumer::config::{DEFAULT_HANDLED_TYPES, parse_type_list};
use wft_consumer::{
    AmqpConfig, AmqpQueue, BackendConfig, Collaborators, ConsumerConfig, Dispatcher, ErrorSink,
    FanoutSink, HttpBackend, HttpErrorSink, RunLoop, StateDb, TracingErrorSink,
    forwarding_handlers,
};
use wft_core::metrics::{init_metrics, start_metrics_server};

/// wft queue consumer.
#[derive(Parser, Debug)]
#[command(name = "wft-consumer")]
#[command(about = "Batching consumer for the wft change-event queue")]
#[command(version)]
struct Args {
    /// AMQP broker URL
    #[arg(long, env = "CLOUDAMQP_URL")]
    amqp_url: String,

    /// Queue to consume
    #[arg(long, env = "WFT_QUEUE", default_value = "wft")]
    queue: String,

    /// RocksDB path for resource counters and delivery tallies
    #[arg(long, env = "WFT_STATE_PATH", default_value = "./data/state")]
    state_path: PathBuf,

    /// Messages per batch
    #[arg(long, env = "WFT_BATCH_SIZE", default_value = "10")]
    batch_size: usize,

    /// Seconds to wait for a batch to fill
    #[arg(long, env = "WFT_BATCH_WAIT_SECS", default_value = "15")]
    batch_wait_secs: u64,

    /// Seconds after which no new cycle is started
    #[arg(long, env = "WFT_LIFETIME_SECS", default_value = "170")]
    lifetime_secs: u64,

    /// Base URL of the application's internal API
    #[arg(long, env = "WFT_BACKEND_URL")]
    backend_url: String,

    /// Bearer token for the internal API
    #[arg(long, env = "WFT_BACKEND_TOKEN")]
    backend_token: Option<String>,

    /// Event types forwarded to the backend (comma-separated, overrides defaults)
    #[arg(long, env = "WFT_HANDLED_TYPES")]
    handled_types: Option<String>,

    /// Error-tracking endpoint for failure reports
    #[arg(long, env = "ERROR_SINK_URL")]
    error_sink_url: Option<String>,

    /// API key for the error-tracking endpoint
    #[arg(long, env = "ERROR_SINK_API_KEY")]
    error_sink_key: Option<String>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "WFT_METRICS_PORT", default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before clap reads env fallbacks
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wft_consumer=debug".into()),
        )
        .init();

    tracing::info!("wft consumer starting...");

    let config = ConsumerConfig {
        batch_size: args.batch_size,
        batch_wait: Duration::from_secs(args.batch_wait_secs),
        lifetime: Duration::from_secs(args.lifetime_secs),
    };
    config.validate()?;

    if args.metrics_port > 0 {
        let handle = init_metrics();
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let state = Arc::new(
        StateDb::open(&args.state_path)
            .with_context(|| format!("Failed to open state at {:?}", args.state_path))?,
    );

    let backend = Arc::new(
        HttpBackend::new(BackendConfig {
            base_url: args.backend_url.clone(),
            token: args.backend_token.clone(),
            ..Default::default()
        })
        .context("Failed to build backend client")?,
    );

    let handled_types = match &args.handled_types {
        Some(raw) => parse_type_list(raw),
        None => DEFAULT_HANDLED_TYPES.iter().map(|t| t.to_string()).collect(),
    };
    let handlers = forwarding_handlers(&backend, &handled_types);

    let sink = build_sink(&args)?;

    tracing::info!("Configuration:");
    tracing::info!("  Queue: {}", args.queue);
    tracing::info!("  State: {}", args.state_path.display());
    tracing::info!("  Backend: {}", args.backend_url);
    tracing::info!("  Handled types: {}", handlers.len());
    tracing::info!(
        "  Batch: {} messages / {}s, lifetime {}s",
        config.batch_size,
        args.batch_wait_secs,
        args.lifetime_secs
    );
    tracing::info!(
        "  Error sink: {}",
        args.error_sink_url.as_deref().unwrap_or("log only")
    );

    let collaborators = Collaborators {
        provisioner: backend.clone(),
        importer: backend.clone(),
        mentions: backend,
        handlers,
    };
    let dispatcher = Dispatcher::new(collaborators, state.clone(), state.clone(), sink);

    let amqp_config = AmqpConfig {
        url: args.amqp_url.clone(),
        queue: args.queue.clone(),
        prefetch: u16::try_from(config.batch_size).unwrap_or(u16::MAX),
        ..Default::default()
    };
    let queue = AmqpQueue::connect(&amqp_config)
        .await
        .context("Failed to connect to broker")?;

    let run_loop = RunLoop::new(queue, dispatcher, state, &config);

    let shutdown = run_loop.shutdown_flag();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping after the current cycle...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let summary = run_loop.run().await?;

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("RUN COMPLETE ({:?})", summary.reason);
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Elapsed:          {:?}", summary.elapsed);
    tracing::info!("Cycles:           {}", summary.cycles);
    tracing::info!("Batches:          {}", summary.batches);
    tracing::info!("Events processed: {}", summary.dispatch.processed);
    tracing::info!("Events delivered: {}", summary.dispatch.delivered);
    tracing::info!("Unhandled types:  {}", summary.dispatch.unhandled);
    tracing::info!("Failures:         {}", summary.dispatch.failed);
    tracing::info!("Resyncs:          {}", summary.dispatch.resyncs);

    Ok(())
}

/// Tracing sink always; HTTP sink too when an endpoint is configured.
fn build_sink(args: &Args) -> Result<Arc<dyn ErrorSink>> {
    let Some(url) = &args.error_sink_url else {
        return Ok(Arc::new(TracingErrorSink));
    };

    let http = HttpErrorSink::new(url.clone(), args.error_sink_key.clone())
        .context("Failed to build error sink client")?;

    let sinks: Vec<Arc<dyn ErrorSink>> = vec![Arc::new(TracingErrorSink), Arc::new(http)];
    Ok(Arc::new(FanoutSink::new(sinks)))
}
