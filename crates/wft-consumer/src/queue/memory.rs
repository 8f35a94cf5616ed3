//! In-process queue source.
//!
//! Backed by an unbounded tokio channel. The [`MemoryPublisher`] half feeds
//! messages in and observes what the consumer acknowledged, which makes it the
//! source of choice for tests and for replaying captured payloads.

use super::{Delivery, QueueSource};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use wft_core::DeliveryHandle;

/// State shared between the queue and its publisher.
#[derive(Default)]
struct Shared {
    acked: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

/// Create a connected publisher/queue pair.
pub fn memory_queue() -> (MemoryPublisher, MemoryQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());

    let publisher = MemoryPublisher {
        tx,
        shared: Arc::clone(&shared),
    };
    let queue = MemoryQueue {
        rx,
        shared,
        next_tag: 1,
    };

    (publisher, queue)
}

/// Producer half of a [`MemoryQueue`].
///
/// Dropping every publisher ends the subscription once queued messages drain.
#[derive(Clone)]
pub struct MemoryPublisher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
}

impl MemoryPublisher {
    /// Enqueue a raw body. Returns `false` if the queue has been dropped.
    pub fn publish(&self, body: Vec<u8>) -> bool {
        self.tx.send(body).is_ok()
    }

    /// Enqueue a JSON body.
    pub fn publish_json(&self, body: &serde_json::Value) -> bool {
        self.publish(body.to_string().into_bytes())
    }

    /// Delivery tags acknowledged so far, in acknowledgment order.
    ///
    /// Tags are assigned from 1 in delivery order.
    pub fn acked(&self) -> Vec<u64> {
        self.shared.acked.lock().clone()
    }

    /// Whether the consumer has closed its side.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Consumer half of an in-process queue.
pub struct MemoryQueue {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
    next_tag: u64,
}

#[async_trait]
impl QueueSource for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn recv(&mut self) -> Result<Option<Delivery>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        // mpsc::UnboundedReceiver::recv is cancel-safe
        let Some(body) = self.rx.recv().await else {
            return Ok(None);
        };

        let tag = self.next_tag;
        self.next_tag += 1;

        Ok(Some(Delivery {
            handle: DeliveryHandle::new(tag),
            body,
        }))
    }

    async fn ack(&mut self, handle: DeliveryHandle) -> Result<()> {
        self.shared.acked.lock().push(handle.into_tag());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.rx.close();
            tracing::debug!("Memory queue closed");
        }
        Ok(())
    }
}
