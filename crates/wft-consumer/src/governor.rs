//! Process lifetime governor.
//!
//! The consumer is a short-lived worker re-invoked on a schedule. [`RunLoop`]
//! alternates accumulate -> dispatch cycles and, after each one, checks the
//! elapsed time against the configured lifetime. Once exceeded (or once a
//! shutdown was requested) it closes the queue, flushes state and pending
//! error reports, and stops.
//!
//! ```text
//!            ┌──────────── cycle ────────────┐
//! RUNNING ──►│ accumulate → dispatch (if any) │──► lifetime exceeded? ──► STOPPED
//!    ▲       └───────────────────────────────┘          │ no
//!    └──────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown is only ever decided between cycles; a batch being dispatched
//! always runs to completion.

use crate::batch::BatchAccumulator;
use crate::config::ConsumerConfig;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::queue::QueueSource;
use crate::store::CounterStore;
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Governor state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
}

/// Why the run loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    LifetimeExceeded,
    ShutdownRequested,
}

/// The lifetime budget of one process invocation. Read-only once created.
#[derive(Debug, Clone, Copy)]
pub struct RunWindow {
    started_at: DateTime<Utc>,
    start: Instant,
    max_duration: Duration,
}

impl RunWindow {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            started_at: Utc::now(),
            start: Instant::now(),
            max_duration,
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn exceeded(&self) -> bool {
        self.elapsed() > self.max_duration
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub cycles: usize,
    pub batches: usize,
    pub elapsed: Duration,
    pub reason: StopReason,
    pub dispatch: DispatchStats,
}

/// Drives accumulate/dispatch cycles until the lifetime is spent.
pub struct RunLoop<Q: QueueSource> {
    queue: Q,
    accumulator: BatchAccumulator,
    dispatcher: Dispatcher,
    counters: Arc<dyn CounterStore>,
    window: RunWindow,
    state: RunState,
    shutdown: Arc<AtomicBool>,
    cycles: usize,
    batches: usize,
}

impl<Q: QueueSource> RunLoop<Q> {
    /// The run window starts now.
    pub fn new(
        queue: Q,
        dispatcher: Dispatcher,
        counters: Arc<dyn CounterStore>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            accumulator: BatchAccumulator::new(config.batch_size, config.batch_wait),
            dispatcher,
            counters,
            window: RunWindow::new(config.lifetime),
            state: RunState::Running,
            shutdown: Arc::new(AtomicBool::new(false)),
            cycles: 0,
            batches: 0,
        }
    }

    /// Flag that, once set, stops the loop at the next between-cycles check.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until stopped.
    ///
    /// Errors from the loop's own bookkeeping (broker failures, state store
    /// failures) are returned unhandled; per-event failures never reach here.
    pub async fn run(mut self) -> Result<RunSummary> {
        tracing::info!(
            source = self.queue.name(),
            started_at = %self.window.started_at(),
            "Run loop starting"
        );
        metrics::gauge!("consumer_running").set(1.0);

        let mut reason = StopReason::LifetimeExceeded;
        while self.state == RunState::Running {
            self.cycle().await?;

            if let Some(stop) = self.should_stop() {
                reason = stop;
                self.stop(stop).await?;
            }
        }

        Ok(RunSummary {
            cycles: self.cycles,
            batches: self.batches,
            elapsed: self.window.elapsed(),
            reason,
            dispatch: self.dispatcher.stats().clone(),
        })
    }

    async fn cycle(&mut self) -> Result<()> {
        let batch = self.accumulator.accumulate(&mut self.queue).await?;
        self.cycles += 1;

        if batch.is_empty() {
            tracing::debug!("No messages this cycle");
            return Ok(());
        }

        self.batches += 1;
        metrics::counter!("consumer_batches_total").increment(1);
        metrics::gauge!("consumer_batch_size").set(batch.len() as f64);
        tracing::debug!("Dispatching batch of {}", batch.len());

        self.dispatcher.process(&mut self.queue, batch).await
    }

    fn should_stop(&self) -> Option<StopReason> {
        if self.window.exceeded() {
            Some(StopReason::LifetimeExceeded)
        } else if self.shutdown.load(Ordering::SeqCst) {
            Some(StopReason::ShutdownRequested)
        } else {
            None
        }
    }

    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        match reason {
            StopReason::LifetimeExceeded => tracing::info!(
                elapsed = ?self.window.elapsed(),
                "End of time; stopping"
            ),
            StopReason::ShutdownRequested => tracing::info!("Shutdown requested; stopping"),
        }

        self.queue.close().await?;
        self.counters.flush()?;
        self.dispatcher.flush_reports().await;
        self.state = RunState::Stopped;
        metrics::gauge!("consumer_running").set(0.0);
        Ok(())
    }
}
