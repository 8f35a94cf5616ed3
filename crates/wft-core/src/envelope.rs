//! Queue envelope model.
//!
//! An [`EventEnvelope`] is one message taken from the work queue. The producer
//! sometimes wraps the real event in an `action` object (the upstream webhook
//! framing); [`EventEnvelope::payload`] resolves that to the *effective
//! payload* that carries `type`, `data` and the lifecycle fields.
//!
//! # Wire Shape
//!
//! ```text
//! { "type": "boardSetup", "board_id": "5f..", "user_token": "..", "username": "..", "date": ".." }
//! { "action": { "type": "updateCard", "date": "..", "data": { "board": { "id": "5f.." }, .. } }, "model": {..} }
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Lifecycle event: a resource was connected and needs provisioning.
pub const RESOURCE_SETUP: &str = "resourceSetup";
/// Lifecycle event: re-import everything for a resource.
pub const RESOURCE_BULK_IMPORT: &str = "resourceBulkImport";
/// Lifecycle event: a resource was disconnected.
pub const RESOURCE_DELETED: &str = "resourceDeleted";
/// An external site mentioned one of our pages.
pub const MENTION_RECEIVED: &str = "externalMentionReceived";

/// Names the producer has historically emitted for the lifecycle events.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("boardSetup", RESOURCE_SETUP),
    ("initialFetch", RESOURCE_BULK_IMPORT),
    ("boardDeleted", RESOURCE_DELETED),
    ("webmentionReceived", MENTION_RECEIVED),
];

/// Opaque broker token used to acknowledge one delivery.
///
/// Deliberately not `Clone`: acknowledging consumes the handle, so a message
/// cannot be acknowledged twice.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(u64);

impl DeliveryHandle {
    /// Wrap a broker-specific delivery tag.
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    /// The broker-specific delivery tag. Only queue implementations call this.
    pub fn into_tag(self) -> u64 {
        self.0
    }
}

/// Parse a raw message body into its JSON object.
///
/// Anything that is not a JSON object is malformed and must never reach a batch.
pub fn parse_body(body: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::NotAnObject {
            found: json_type_name(&other),
        }),
    }
}

/// One unit of work taken from the queue. Immutable once received.
#[derive(Debug)]
pub struct EventEnvelope {
    body: Value,
    timestamp: Option<DateTime<Utc>>,
    handle: DeliveryHandle,
}

impl EventEnvelope {
    /// Build an envelope from a decoded message body.
    pub fn new(body: Map<String, Value>, handle: DeliveryHandle) -> Self {
        let body = Value::Object(body);
        let timestamp = parse_timestamp(body.get("date"))
            .or_else(|| parse_timestamp(body.get("action").and_then(|a| a.get("date"))));

        Self {
            body,
            timestamp,
            handle,
        }
    }

    /// Decode a raw body and wrap it; see [`parse_body`].
    pub fn from_slice(body: &[u8], handle: DeliveryHandle) -> Result<Self> {
        Ok(Self::new(parse_body(body)?, handle))
    }

    /// When the producer says the event happened. `None` sorts first.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// The whole message as received.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The effective payload: the nested `action` object when present and
    /// non-empty, otherwise the envelope itself.
    pub fn payload(&self) -> &Value {
        match self.body.get("action") {
            Some(action @ Value::Object(map)) if !map.is_empty() => action,
            _ => &self.body,
        }
    }

    /// The effective payload's `type`, if any.
    pub fn event_type(&self) -> Option<&str> {
        self.payload().get("type").and_then(Value::as_str)
    }

    /// The effective payload's `data` object, or `null`.
    pub fn data(&self) -> &Value {
        self.payload().get("data").unwrap_or(&Value::Null)
    }

    /// The resource this event is about, wherever the event type keeps it.
    pub fn resource_id(&self) -> Option<String> {
        let payload = self.payload();
        id_field(payload.get("board_id"))
            .or_else(|| id_field(payload.get("resource_id")))
            .or_else(|| id_field(pointer(payload, &["data", "board", "id"])))
    }

    /// The acting user, when the producer recorded one.
    pub fn username(&self) -> Option<&str> {
        let payload = self.payload();
        payload
            .get("username")
            .and_then(Value::as_str)
            .or_else(|| pointer(payload, &["memberCreator", "username"]).and_then(Value::as_str))
    }

    /// Release the delivery handle for acknowledgment.
    pub fn into_handle(self) -> DeliveryHandle {
        self.handle
    }

    /// Classify the effective payload into the event kinds the dispatcher routes.
    pub fn classify(&self) -> Result<EventKind<'_>> {
        let raw_type = self.event_type().ok_or_else(|| Error::MissingField {
            field: "type",
            event_type: "untyped".to_string(),
        })?;
        let event_type = canonical_type(raw_type);
        let payload = self.payload();

        let require_resource = |field: &'static str| {
            id_field(payload.get(field)).ok_or_else(|| Error::MissingField {
                field,
                event_type: raw_type.to_string(),
            })
        };

        let kind = match event_type {
            RESOURCE_SETUP => EventKind::ResourceSetup {
                resource_id: require_resource("board_id")?,
                credentials: Credentials {
                    username: string_field(payload, "username"),
                    user_token: string_field(payload, "user_token"),
                },
            },
            RESOURCE_BULK_IMPORT => EventKind::ResourceBulkImport {
                resource_id: require_resource("board_id")?,
            },
            RESOURCE_DELETED => EventKind::ResourceDeleted {
                resource_id: require_resource("board_id")?,
            },
            MENTION_RECEIVED => EventKind::MentionReceived {
                source: required_string(payload, "source", raw_type)?,
                target: required_string(payload, "target", raw_type)?,
            },
            _ => EventKind::Other {
                event_type: raw_type,
                resource_id: id_field(pointer(payload, &["data", "board", "id"])),
            },
        };

        Ok(kind)
    }
}

/// Credentials the producer attaches to a setup request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub user_token: Option<String>,
}

/// The routing decision for one envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum EventKind<'a> {
    ResourceSetup {
        resource_id: String,
        credentials: Credentials,
    },
    ResourceBulkImport {
        resource_id: String,
    },
    ResourceDeleted {
        resource_id: String,
    },
    MentionReceived {
        source: String,
        target: String,
    },
    /// Everything else, resolved against the handler table by `event_type`.
    Other {
        event_type: &'a str,
        resource_id: Option<String>,
    },
}

/// Map legacy producer names onto the canonical lifecycle names.
pub fn canonical_type(event_type: &str) -> &str {
    LEGACY_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == event_type)
        .map_or(event_type, |(_, canonical)| canonical)
}

/// Zone-less layouts some producers emit; read as UTC.
const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NAIVE_DATE_FORMATS
                    .iter()
                    .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

/// Ids arrive as strings or bare numbers depending on the producer.
fn id_field(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(str::to_string)
}

fn required_string(payload: &Value, field: &'static str, event_type: &str) -> Result<String> {
    match payload.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Error::InvalidField {
            field,
            reason: format!("expected string, found {}", json_type_name(other)),
        }),
        None => Err(Error::MissingField {
            field,
            event_type: event_type.to_string(),
        }),
    }
}

fn pointer<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
