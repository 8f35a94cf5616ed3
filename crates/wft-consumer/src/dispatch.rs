//! Batch dispatch.
//!
//! The [`Dispatcher`] sorts a completed batch by timestamp and routes each
//! envelope by type. Failures are isolated per event: they are reported to the
//! error sink and the next event runs. Every envelope is acknowledged after its
//! attempt, whatever the outcome, so a failed event is dropped rather than
//! redelivered; the volume-driven resync is what reconciles the lost effect.
//!
//! # Routing
//!
//! ```text
//! resourceSetup           -> counter = 0, provision + bulk import
//! resourceBulkImport      -> bulk import
//! resourceDeleted         -> drop counter, deprovision
//! externalMentionReceived -> mention handler
//! anything else           -> handler table; then tally + resync scheduler
//! ```

use crate::batch::Batch;
use crate::collaborators::Collaborators;
use crate::queue::QueueSource;
use crate::resync::ResyncScheduler;
use crate::sink::{ErrorReport, ErrorSink, Stage};
use crate::store::{CounterStore, DeliveryTally, delivery_key};
use crate::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wft_core::{Credentials, EventEnvelope, EventKind, canonical_type};

/// Running totals for one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Envelopes attempted (and acknowledged).
    pub processed: usize,
    /// Failures reported to the error sink.
    pub failed: usize,
    /// Open-ended events with no registered handler.
    pub unhandled: usize,
    /// Events routed through the handler table.
    pub delivered: usize,
    /// Bulk imports started by the resync threshold.
    pub resyncs: usize,
}

/// Routes sorted batches to their collaborators.
pub struct Dispatcher {
    collaborators: Collaborators,
    counters: Arc<dyn CounterStore>,
    tally: Arc<dyn DeliveryTally>,
    resync: ResyncScheduler,
    sink: Arc<dyn ErrorSink>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        collaborators: Collaborators,
        counters: Arc<dyn CounterStore>,
        tally: Arc<dyn DeliveryTally>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let resync = ResyncScheduler::new(
            Arc::clone(&counters),
            Arc::clone(&collaborators.importer),
        );

        Self {
            collaborators,
            counters,
            tally,
            resync,
            sink,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Wait for error reports still being delivered by the sink.
    pub async fn flush_reports(&self) {
        self.sink.flush().await;
    }

    /// Sort `batch` and process it envelope by envelope.
    ///
    /// Each envelope is fully processed, then acknowledged, before the next one
    /// starts. Only a failed acknowledgment (a broken broker connection) is
    /// returned as an error.
    pub async fn process<Q>(&mut self, queue: &mut Q, mut batch: Batch) -> Result<()>
    where
        Q: QueueSource + ?Sized,
    {
        batch.sort_by_timestamp();

        for envelope in batch {
            self.process_one(&envelope).await;

            queue.ack(envelope.into_handle()).await?;
            metrics::counter!("consumer_messages_acked_total").increment(1);
            self.stats.processed += 1;
        }

        Ok(())
    }

    async fn process_one(&mut self, envelope: &EventEnvelope) {
        debug!(
            date = ?envelope.timestamp(),
            event_type = envelope.event_type().unwrap_or("-"),
            "Processing"
        );

        let kind = match envelope.classify() {
            Ok(kind) => kind,
            Err(e) => {
                let event_type = envelope.event_type().unwrap_or("untyped");
                self.report(
                    ErrorReport::new(Stage::Decode, event_type, e.into(), envelope.payload().clone())
                        .with_user(envelope.username()),
                );
                return;
            }
        };

        let event_type = canonical_type(envelope.event_type().unwrap_or_default());
        match kind {
            EventKind::ResourceSetup {
                resource_id,
                credentials,
            } => {
                self.setup(event_type, &resource_id, &credentials).await;
            }
            EventKind::ResourceBulkImport { resource_id } => {
                if let Err(e) = self.collaborators.importer.resync(&resource_id, None).await {
                    self.report(ErrorReport::new(
                        Stage::BulkImport,
                        event_type,
                        e,
                        json!({ "resource_id": resource_id }),
                    ));
                }
            }
            EventKind::ResourceDeleted { resource_id } => {
                self.delete(event_type, &resource_id, envelope.username())
                    .await;
            }
            EventKind::MentionReceived { source, target } => {
                if let Err(e) = self.collaborators.mentions.handle(&source, &target).await {
                    self.report(ErrorReport::new(
                        Stage::Mention,
                        event_type,
                        e,
                        envelope.payload().clone(),
                    ));
                }
            }
            EventKind::Other {
                event_type,
                resource_id,
            } => {
                self.deliver(envelope, event_type, resource_id).await;
            }
        }
    }

    async fn setup(&mut self, event_type: &str, resource_id: &str, credentials: &Credentials) {
        let context = json!({ "resource_id": resource_id });

        // Zeroed before and after: a partial setup still leaves a registered counter
        if let Err(e) = self.counters.set(resource_id, 0) {
            self.report(ErrorReport::new(Stage::Store, event_type, e.into(), context.clone()));
        }

        let result = async {
            self.collaborators
                .provisioner
                .setup(resource_id, credentials)
                .await?;
            self.collaborators
                .importer
                .resync(resource_id, credentials.username.as_deref())
                .await
        }
        .await;

        if let Err(e) = result {
            self.report(
                ErrorReport::new(Stage::Setup, event_type, e, context.clone())
                    .with_user(credentials.username.as_deref()),
            );
        } else {
            info!(resource_id, "Resource set up");
        }

        if let Err(e) = self.counters.set(resource_id, 0) {
            self.report(ErrorReport::new(Stage::Store, event_type, e.into(), context));
        }
    }

    async fn delete(&mut self, event_type: &str, resource_id: &str, user: Option<&str>) {
        let context = json!({ "resource_id": resource_id });

        // Local bookkeeping goes first, even if the external cleanup fails
        if let Err(e) = self.counters.delete(resource_id) {
            self.report(ErrorReport::new(Stage::Store, event_type, e.into(), context.clone()));
        }

        if let Err(e) = self.collaborators.provisioner.deprovision(resource_id).await {
            self.report(
                ErrorReport::new(Stage::Deprovision, event_type, e, context).with_user(user),
            );
        } else {
            info!(resource_id, "Resource deprovisioned");
        }
    }

    async fn deliver(
        &mut self,
        envelope: &EventEnvelope,
        event_type: &str,
        resource_id: Option<String>,
    ) {
        let Some(handler) = self.collaborators.handlers.get(event_type).cloned() else {
            debug!(event_type, "No handler registered; skipping");
            self.stats.unhandled += 1;
            return;
        };

        let Some(resource_id) = resource_id else {
            self.report(
                ErrorReport::new(
                    Stage::Decode,
                    event_type,
                    wft_core::Error::MissingField {
                        field: "data.board.id",
                        event_type: event_type.to_string(),
                    }
                    .into(),
                    envelope.payload().clone(),
                )
                .with_user(envelope.username()),
            );
            return;
        };

        let data = envelope.data();
        if let Err(e) = handler.handle(data, envelope.payload()).await {
            if matches!(self.counters.get(&resource_id), Ok(None)) {
                info!(resource_id, event_type, "Event for a resource no longer registered");
            }
            self.report(
                ErrorReport::new(
                    Stage::Webhook,
                    event_type,
                    e,
                    json!({ "resource_id": resource_id, "data": data }),
                )
                .with_user(envelope.username()),
            );
        }

        self.stats.delivered += 1;
        metrics::counter!("consumer_events_dispatched_total", "type" => event_type.to_string())
            .increment(1);
        self.record_delivery(&resource_id);

        match self.resync.on_event(&resource_id).await {
            Ok(decision) if decision.triggered => self.stats.resyncs += 1,
            Ok(_) => {}
            Err(e) => self.report(ErrorReport::new(
                Stage::Resync,
                event_type,
                e,
                json!({ "resource_id": resource_id }),
            )),
        }
    }

    /// Telemetry failures are logged and swallowed.
    fn record_delivery(&self, resource_id: &str) {
        let key = delivery_key(Utc::now().date_naive(), resource_id);
        if let Err(e) = self.tally.increment(&key) {
            warn!("Couldn't increment {}: {}", key, e);
        }
    }

    fn report(&mut self, report: ErrorReport) {
        metrics::counter!("consumer_events_failed_total", "stage" => report.stage().to_string())
            .increment(1);
        self.stats.failed += 1;
        self.sink.report(report);
    }
}
