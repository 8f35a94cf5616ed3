//! Prometheus metrics helpers for the wft consumer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use wft_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("consumer_messages_acked_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `consumer_`
//! - Suffix: `_total` for counters
//! - Labels: event `type` and failure `stage` only; resource ids never become labels

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_consumer_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_consumer_metrics();
    Some(handle)
}

/// Serve `/metrics` on the given port from a background task.
///
/// Binds before returning so a port conflict surfaces as an error at startup.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_consumer_metrics() {
    // =========================================================================
    // Queue
    // =========================================================================

    describe_counter!(
        "consumer_messages_received_total",
        "Messages delivered by the broker"
    );
    describe_counter!(
        "consumer_messages_malformed_total",
        "Messages dropped because the body was not a JSON object"
    );
    describe_counter!(
        "consumer_messages_acked_total",
        "Messages acknowledged to the broker"
    );

    // =========================================================================
    // Batching / Dispatch
    // =========================================================================

    describe_counter!("consumer_batches_total", "Non-empty batches dispatched");
    describe_gauge!("consumer_batch_size", "Size of the most recent batch");
    describe_counter!(
        "consumer_events_dispatched_total",
        "Events routed to a handler (label: type)"
    );
    describe_counter!(
        "consumer_events_failed_total",
        "Per-event failures reported to the error sink (label: stage)"
    );
    describe_counter!(
        "consumer_resyncs_triggered_total",
        "Full resyncs triggered by the event-volume threshold"
    );

    // =========================================================================
    // Lifecycle
    // =========================================================================

    describe_gauge!(
        "consumer_running",
        "Whether the consumer run loop is active (1=yes, 0=no)"
    );
}
