//! Error types for the queue consumer.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop the consumer or one of its stores.
///
/// Per-event failures never surface here; the dispatcher reports those to the
/// error sink and moves on.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// AMQP broker error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Envelope decoding error.
    #[error("Envelope error: {0}")]
    Envelope(#[from] wft_core::Error),

    /// The broker did not accept the connection in time.
    #[error("Timed out connecting to broker after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker ended the subscription.
    #[error("Queue subscription closed by the broker")]
    SubscriptionClosed,

    /// A column family expected in the state database is missing.
    #[error("Missing column family: {0}")]
    MissingColumnFamily(&'static str),

    /// A stored counter value has the wrong width.
    #[error("Corrupt counter value for '{key}': {len} bytes")]
    CorruptCounter {
        /// The key holding the bad value.
        key: String,
        /// Width of the stored value.
        len: usize,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
