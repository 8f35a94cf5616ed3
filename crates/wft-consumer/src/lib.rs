//! Batching consumer for the wft change-event queue.
//!
//! The consumer drains a durable queue, groups messages into bounded batches,
//! dispatches each event to its handler and keeps a per-resource event counter
//! that schedules periodic full resyncs. It runs as a short-lived worker: an
//! outside scheduler re-invokes it and it stops itself after a fixed lifetime.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   QueueSource   │  AMQP (lapin) or in-process
//! └────────┬────────┘
//!          │  deliveries (malformed ones acked + dropped)
//!          ▼
//! ┌─────────────────┐
//! │BatchAccumulator │  count threshold or deadline, whichever first
//! └────────┬────────┘
//!          │  Batch
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │   Dispatcher    │─────►│ ResyncScheduler │  RocksDB counters → bulk import
//! └────────┬────────┘      └─────────────────┘
//!          │  provisioner / importer / mentions / handler table
//!          ▼
//!     collaborators           failures → ErrorSink, envelope still acked
//! ```
//!
//! [`RunLoop`] drives the cycle and decides when to stop.

pub mod backend;
pub mod batch;
pub mod collaborators;
pub mod config;
pub mod dispatch;
mod error;
pub mod governor;
pub mod queue;
pub mod resync;
pub mod sink;
pub mod store;

pub use error::{Error, Result};

pub use backend::{BackendConfig, HttpBackend, forwarding_handlers};
pub use batch::{Batch, BatchAccumulator};
pub use collaborators::{
    BulkImporter, Collaborators, EventHandler, HandlerTable, MentionHandler, Provisioner,
};
pub use config::ConsumerConfig;
pub use dispatch::{DispatchStats, Dispatcher};
pub use governor::{RunLoop, RunState, RunSummary, RunWindow, StopReason};
pub use queue::{AmqpConfig, AmqpQueue, MemoryPublisher, MemoryQueue, QueueSource, memory_queue};
pub use resync::{ResyncDecision, ResyncScheduler, is_resync_point};
pub use sink::{ErrorReport, ErrorSink, FanoutSink, HttpErrorSink, Stage, TracingErrorSink};
pub use store::{CounterStore, DeliveryTally, StateDb};
