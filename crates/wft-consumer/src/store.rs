//! Persistent consumer state using RocksDB.
//!
//! This module provides the [`StateDb`] which holds the two pieces of state
//! that must survive between runs:
//!
//! - Per-resource event counters that drive the resync cadence ([`CounterStore`])
//! - Monthly per-resource delivery tallies for usage reporting ([`DeliveryTally`])
//!
//! # Key Design
//!
//! ```text
//! CF "counts":     <resource_id>                        -> u64 (big-endian)
//! CF "deliveries": webhooks:<year>:<month>:<resource_id> -> u64 (big-endian)
//! ```
//!
//! The store assumes a single writer. A multi-instance deployment would need a
//! transactional increment here.

use crate::{Error, Result};
use chrono::{Datelike, NaiveDate};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const COUNTS_CF: &str = "counts";
const DELIVERIES_CF: &str = "deliveries";

/// Persistent `resource_id -> count` mapping.
pub trait CounterStore: Send + Sync {
    /// Current count, or `None` when the resource is not registered.
    fn get(&self, resource_id: &str) -> Result<Option<u64>>;

    /// Overwrite the count, creating the entry if needed.
    fn set(&self, resource_id: &str, value: u64) -> Result<()>;

    /// Remove the entry. Removing a missing entry is not an error.
    fn delete(&self, resource_id: &str) -> Result<()>;

    /// Add one, creating the entry at 0 first if absent. Returns the new value.
    fn increment(&self, resource_id: &str) -> Result<u64> {
        let next = self.get(resource_id)?.unwrap_or(0).saturating_add(1);
        self.set(resource_id, next)?;
        Ok(next)
    }

    /// Make all writes durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Monotonic delivery counters keyed by period and resource.
pub trait DeliveryTally: Send + Sync {
    /// Add one to the counter under `key`. Returns the new value.
    fn increment(&self, key: &str) -> Result<u64>;
}

/// Tally key for a delivery to `resource_id` on `date`.
pub fn delivery_key(date: NaiveDate, resource_id: &str) -> String {
    format!("{}{}", delivery_period_prefix(date.year(), date.month()), resource_id)
}

/// Prefix shared by every tally key of one month.
pub fn delivery_period_prefix(year: i32, month: u32) -> String {
    format!("webhooks:{year}:{month}:")
}

/// RocksDB-backed consumer state.
///
/// Thread-safe: can be shared via `Arc<StateDb>` between the dispatcher and
/// the resync scheduler.
pub struct StateDb {
    db: DBWithThreadMode<MultiThreaded>,
}

impl StateDb {
    /// Open or create the state database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening consumer state at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);

        let cfs = [COUNTS_CF, DELIVERIES_CF]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self { db })
    }

    /// Open an existing state database without taking the writer lock.
    ///
    /// Used by reporting tools while a consumer may be running.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let opts = Options::default();
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_for_read_only(
            &opts,
            path,
            [COUNTS_CF, DELIVERIES_CF],
            false,
        )?;
        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or(Error::MissingColumnFamily(name))
    }

    fn read_u64(&self, cf: &'static str, key: &str) -> Result<Option<u64>> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(&handle, key.as_bytes())? {
            Some(bytes) => decode_u64(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write_u64(&self, cf: &'static str, key: &str, value: u64) -> Result<()> {
        let handle = self.cf(cf)?;
        self.db.put_cf(&handle, key.as_bytes(), value.to_be_bytes())?;
        Ok(())
    }

    /// Every registered resource with its counter, ordered by resource id.
    pub fn counters(&self) -> Result<Vec<(String, u64)>> {
        let handle = self.cf(COUNTS_CF)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&handle, IteratorMode::Start) {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let count = decode_u64(&key, &value)?;
            out.push((key, count));
        }
        Ok(out)
    }

    /// Delivery tallies for one month as `(resource_id, count)` pairs.
    pub fn deliveries_for_period(&self, year: i32, month: u32) -> Result<Vec<(String, u64)>> {
        let prefix = delivery_period_prefix(year, month);
        let handle = self.cf(DELIVERIES_CF)?;
        let mut out = Vec::new();

        let iter = self.db.iterator_cf(
            &handle,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            let Some(resource) = key.strip_prefix(prefix.as_bytes()) else {
                break;
            };
            let resource = String::from_utf8_lossy(resource).into_owned();
            let count = decode_u64(&resource, &value)?;
            out.push((resource, count));
        }

        Ok(out)
    }
}

impl CounterStore for StateDb {
    fn get(&self, resource_id: &str) -> Result<Option<u64>> {
        self.read_u64(COUNTS_CF, resource_id)
    }

    fn set(&self, resource_id: &str, value: u64) -> Result<()> {
        self.write_u64(COUNTS_CF, resource_id, value)
    }

    fn delete(&self, resource_id: &str) -> Result<()> {
        let handle = self.cf(COUNTS_CF)?;
        self.db.delete_cf(&handle, resource_id.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        for name in [COUNTS_CF, DELIVERIES_CF] {
            let handle = self.cf(name)?;
            self.db.flush_cf(&handle)?;
        }
        debug!("Flushed consumer state");
        Ok(())
    }
}

impl DeliveryTally for StateDb {
    fn increment(&self, key: &str) -> Result<u64> {
        let next = self.read_u64(DELIVERIES_CF, key)?.unwrap_or(0).saturating_add(1);
        self.write_u64(DELIVERIES_CF, key, next)?;
        Ok(next)
    }
}

fn decode_u64(key: &str, bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| Error::CorruptCounter {
        key: key.to_string(),
        len: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let db = StateDb::open(tmp.path()).unwrap();
            db.set("b1", 5).unwrap();
            CounterStore::flush(&db).unwrap();
        }
        let db = StateDb::open(tmp.path()).unwrap();
        assert_eq!(db.get("b1").unwrap(), Some(5));
    }

    #[test]
    fn test_counter_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let db = StateDb::open(tmp.path()).unwrap();

        assert_eq!(db.get("b1").unwrap(), None);
        db.set("b1", 0).unwrap();
        assert_eq!(db.get("b1").unwrap(), Some(0));
        assert_eq!(CounterStore::increment(&db, "b1").unwrap(), 1);
        assert_eq!(CounterStore::increment(&db, "b1").unwrap(), 2);

        db.delete("b1").unwrap();
        assert_eq!(db.get("b1").unwrap(), None);

        // Deleting again is fine
        db.delete("b1").unwrap();
    }

    #[test]
    fn test_increment_creates_missing_counter() {
        let tmp = TempDir::new().unwrap();
        let db = StateDb::open(tmp.path()).unwrap();
        assert_eq!(CounterStore::increment(&db, "fresh").unwrap(), 1);
    }

    #[test]
    fn test_counters_listing() {
        let tmp = TempDir::new().unwrap();
        let db = StateDb::open(tmp.path()).unwrap();
        db.set("b2", 3).unwrap();
        db.set("b1", 9).unwrap();

        assert_eq!(
            db.counters().unwrap(),
            vec![("b1".to_string(), 9), ("b2".to_string(), 3)]
        );
    }

    #[test]
    fn test_delivery_key_format() {
        let date = NaiveDate::from_ymd_opt(2016, 3, 9).unwrap();
        assert_eq!(delivery_key(date, "b1"), "webhooks:2016:3:b1");
    }

    #[test]
    fn test_deliveries_scoped_to_period() {
        let tmp = TempDir::new().unwrap();
        let db = StateDb::open(tmp.path()).unwrap();

        let march = NaiveDate::from_ymd_opt(2016, 3, 9).unwrap();
        let april = NaiveDate::from_ymd_opt(2016, 4, 1).unwrap();
        let november = NaiveDate::from_ymd_opt(2016, 11, 1).unwrap();

        DeliveryTally::increment(&db, &delivery_key(march, "b1")).unwrap();
        DeliveryTally::increment(&db, &delivery_key(march, "b1")).unwrap();
        DeliveryTally::increment(&db, &delivery_key(march, "b2")).unwrap();
        DeliveryTally::increment(&db, &delivery_key(april, "b1")).unwrap();
        // "webhooks:2016:1" is a prefix of "webhooks:2016:11"; the trailing colon keeps them apart
        DeliveryTally::increment(&db, &delivery_key(november, "b3")).unwrap();

        let mut march_counts = db.deliveries_for_period(2016, 3).unwrap();
        march_counts.sort();
        assert_eq!(
            march_counts,
            vec![("b1".to_string(), 2), ("b2".to_string(), 1)]
        );
        assert!(db.deliveries_for_period(2016, 1).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_sees_flushed_state() {
        let tmp = TempDir::new().unwrap();
        {
            let db = StateDb::open(tmp.path()).unwrap();
            db.set("b1", 8).unwrap();
            CounterStore::flush(&db).unwrap();
        }
        let ro = StateDb::open_read_only(tmp.path()).unwrap();
        assert_eq!(ro.get("b1").unwrap(), Some(8));
    }
}
