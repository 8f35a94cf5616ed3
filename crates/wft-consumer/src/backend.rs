//! HTTP backend for the collaborator interfaces.
//!
//! The application service owns board provisioning, content import, mention
//! handling and per-webhook updates. The consumer forwards each call to it:
//!
//! ```text
//! POST   {base}/boards/{id}/setup     { "username", "user_token" }
//! DELETE {base}/boards/{id}/bot
//! POST   {base}/boards/{id}/import    { "username" }
//! POST   {base}/webmentions           { "source", "target" }
//! POST   {base}/webhooks/{type}       { "data", "payload" }
//! ```
//!
//! Any non-2xx response is a failure.

use crate::Result;
use crate::collaborators::{BulkImporter, EventHandler, HandlerTable, MentionHandler, Provisioner};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wft_core::Credentials;

/// Configuration for the HTTP backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the application's internal API.
    pub base_url: String,

    /// Bearer token, if the API requires one.
    pub token: Option<String>,

    /// Per-request timeout. Bulk imports can be slow.
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/internal".to_string(),
            token: None,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Forwards collaborator calls to the application service.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> anyhow::Result<()> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request.send().await?.error_for_status()?;
        Ok(())
    }

    async fn post(&self, path: &str, body: &Value) -> anyhow::Result<()> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }
}

#[async_trait]
impl Provisioner for HttpBackend {
    async fn setup(&self, resource_id: &str, credentials: &Credentials) -> anyhow::Result<()> {
        self.post(
            &format!("boards/{resource_id}/setup"),
            &json!({
                "username": credentials.username,
                "user_token": credentials.user_token,
            }),
        )
        .await
    }

    async fn deprovision(&self, resource_id: &str) -> anyhow::Result<()> {
        self.send(self.client.delete(self.url(&format!("boards/{resource_id}/bot"))))
            .await
    }
}

#[async_trait]
impl BulkImporter for HttpBackend {
    async fn resync(&self, resource_id: &str, identity_hint: Option<&str>) -> anyhow::Result<()> {
        self.post(
            &format!("boards/{resource_id}/import"),
            &json!({ "username": identity_hint }),
        )
        .await
    }
}

#[async_trait]
impl MentionHandler for HttpBackend {
    async fn handle(&self, source: &str, target: &str) -> anyhow::Result<()> {
        self.post("webmentions", &json!({ "source": source, "target": target }))
            .await
    }
}

/// Forwards one event type to `POST {base}/webhooks/{type}`.
pub struct ForwardingHandler {
    backend: Arc<HttpBackend>,
    path: String,
}

#[async_trait]
impl EventHandler for ForwardingHandler {
    async fn handle(&self, data: &Value, payload: &Value) -> anyhow::Result<()> {
        self.backend
            .post(&self.path, &json!({ "data": data, "payload": payload }))
            .await
    }
}

/// A handler table that forwards each of `event_types` to the backend.
pub fn forwarding_handlers(backend: &Arc<HttpBackend>, event_types: &[String]) -> HandlerTable {
    let mut table = HandlerTable::new();
    for event_type in event_types {
        table.register(
            event_type.clone(),
            Arc::new(ForwardingHandler {
                backend: Arc::clone(backend),
                path: format!("webhooks/{event_type}"),
            }),
        );
    }
    table
}
