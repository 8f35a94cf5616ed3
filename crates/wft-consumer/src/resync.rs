//! Volume-driven resync scheduling.
//!
//! Every ordinary event bumps its resource's counter. When the counter lands
//! on a power of two from 8 upward, the resource gets a full bulk import to
//! correct drift from lost webhooks. Resyncs are frequent while a resource is
//! young and become geometrically rarer as its volume grows.

use crate::collaborators::BulkImporter;
use crate::store::CounterStore;
use std::sync::Arc;

/// Smallest exponent considered (2^3 = 8).
pub const FLOOR_EXPONENT: u32 = 3;

/// Exponents above this are never checked.
pub const CEILING_EXPONENT: u32 = 25;

/// Whether a counter value of `n` warrants a resync.
///
/// Scans 2^3, 2^4, ... upward and stops as soon as the divisor reaches `n`.
pub fn is_resync_point(n: u64) -> bool {
    for exponent in FLOOR_EXPONENT..=CEILING_EXPONENT {
        let divisor = 1u64 << exponent;
        if divisor == n {
            return true;
        }
        if divisor > n {
            return false;
        }
    }
    false
}

/// What one [`ResyncScheduler::on_event`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncDecision {
    /// Counter value after the increment.
    pub count: u64,
    /// Whether a bulk import was started.
    pub triggered: bool,
}

/// Counts events per resource and triggers bulk imports at the thresholds.
#[derive(Clone)]
pub struct ResyncScheduler {
    counters: Arc<dyn CounterStore>,
    importer: Arc<dyn BulkImporter>,
}

impl ResyncScheduler {
    pub fn new(counters: Arc<dyn CounterStore>, importer: Arc<dyn BulkImporter>) -> Self {
        Self { counters, importer }
    }

    /// Record one event for `resource_id` and resync if the new count calls for it.
    ///
    /// The counter is created at 0 first if setup was missed. The increment is
    /// kept even when the import fails.
    pub async fn on_event(&self, resource_id: &str) -> anyhow::Result<ResyncDecision> {
        let count = self.counters.increment(resource_id)?;

        if !is_resync_point(count) {
            return Ok(ResyncDecision {
                count,
                triggered: false,
            });
        }

        tracing::info!(resource_id, count, "Event threshold reached; resyncing");
        metrics::counter!("consumer_resyncs_triggered_total").increment(1);
        self.importer.resync(resource_id, None).await?;

        Ok(ResyncDecision {
            count,
            triggered: true,
        })
    }
}
