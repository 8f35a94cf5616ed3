//! Error types for decoding queue envelopes.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding an envelope or its effective payload.
#[derive(Error, Debug)]
pub enum Error {
    /// The message body is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The message body is valid JSON but not an object.
    #[error("envelope is not a JSON object (found {found})")]
    NotAnObject {
        /// JSON type name of what was found instead.
        found: &'static str,
    },

    /// A field required by the event type is missing.
    #[error("missing field '{field}' in {event_type} payload")]
    MissingField {
        /// Dotted path of the missing field.
        field: &'static str,
        /// The event type whose payload lacked it.
        event_type: String,
    },

    /// A field is present but has the wrong shape.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Dotted path of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },
}
