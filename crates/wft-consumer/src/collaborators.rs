//! Narrow interfaces to the services that own the business logic.
//!
//! The consumer decides *what* to call and *when*; everything behind these
//! traits (provisioning a board, importing its content, posting a mention) lives
//! elsewhere. All calls are fallible and their failures are reported, never
//! retried here.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use wft_core::Credentials;

/// Connects and disconnects a resource at the upstream provider.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Bootstrap a newly connected resource (bot membership, defaults, webhook).
    ///
    /// Must tolerate partial completion of an earlier attempt.
    async fn setup(&self, resource_id: &str, credentials: &Credentials) -> anyhow::Result<()>;

    /// Undo what `setup` did.
    async fn deprovision(&self, resource_id: &str) -> anyhow::Result<()>;
}

/// Re-fetches a resource's full state from the upstream provider.
#[async_trait]
pub trait BulkImporter: Send + Sync {
    async fn resync(&self, resource_id: &str, identity_hint: Option<&str>) -> anyhow::Result<()>;
}

/// Handles a mention of one of our pages by an external site.
#[async_trait]
pub trait MentionHandler: Send + Sync {
    async fn handle(&self, source: &str, target: &str) -> anyhow::Result<()>;
}

/// Handler for one open-ended event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// `data` is the payload's `data` object; `payload` is the whole effective payload.
    async fn handle(&self, data: &Value, payload: &Value) -> anyhow::Result<()>;
}

/// Event-type name to handler.
///
/// A type with no entry has no side effect; that is a normal outcome.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `event_type`.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.register(event_type, handler);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(event_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Everything the dispatcher calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn Provisioner>,
    pub importer: Arc<dyn BulkImporter>,
    pub mentions: Arc<dyn MentionHandler>,
    pub handlers: HandlerTable,
}
