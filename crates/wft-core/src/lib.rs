//! Shared types for the wft queue consumer.
//!
//! This crate provides:
//! - The queue envelope model and event classification ([`EventEnvelope`], [`EventKind`])
//! - Prometheus metrics helpers
//! - Shared error types

pub mod envelope;
mod error;
pub mod metrics;

pub use envelope::{
    Credentials, DeliveryHandle, EventEnvelope, EventKind, MENTION_RECEIVED, RESOURCE_BULK_IMPORT,
    RESOURCE_DELETED, RESOURCE_SETUP, canonical_type, parse_body,
};
pub use error::{Error, Result};
