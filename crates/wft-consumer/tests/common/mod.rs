//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use wft_consumer::{
    BatchAccumulator, BulkImporter, Collaborators, Dispatcher, ErrorReport, ErrorSink,
    EventHandler, HandlerTable, MemoryPublisher, MentionHandler, Provisioner, StateDb,
    memory_queue,
};
use wft_core::Credentials;

/// Collects every report and remembers whether it was flushed.
#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<ErrorReport>>,
    pub flushes: AtomicUsize,
}

#[async_trait]
impl ErrorSink for RecordingSink {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().push(report);
    }

    async fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn tags(&self) -> Vec<Vec<String>> {
        self.reports.lock().iter().map(|r| r.tags.clone()).collect()
    }
}

/// Records every lifecycle call; each operation can be made to fail.
#[derive(Default)]
pub struct RecordingBackend {
    pub calls: Mutex<Vec<String>>,
    pub fail_setup: bool,
    pub fail_deprovision: bool,
    pub fail_resync: bool,
    pub fail_mention: bool,
}

impl RecordingBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: String, fail: bool) -> anyhow::Result<()> {
        self.calls.lock().push(call.clone());
        if fail {
            anyhow::bail!("{call} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for RecordingBackend {
    async fn setup(&self, resource_id: &str, credentials: &Credentials) -> anyhow::Result<()> {
        let user = credentials.username.as_deref().unwrap_or("-");
        self.record(format!("setup:{resource_id}:{user}"), self.fail_setup)
    }

    async fn deprovision(&self, resource_id: &str) -> anyhow::Result<()> {
        self.record(format!("deprovision:{resource_id}"), self.fail_deprovision)
    }
}

#[async_trait]
impl BulkImporter for RecordingBackend {
    async fn resync(&self, resource_id: &str, _hint: Option<&str>) -> anyhow::Result<()> {
        self.record(format!("resync:{resource_id}"), self.fail_resync)
    }
}

#[async_trait]
impl MentionHandler for RecordingBackend {
    async fn handle(&self, source: &str, target: &str) -> anyhow::Result<()> {
        self.record(format!("mention:{source}->{target}"), self.fail_mention)
    }
}

/// Records `data.seq` of each event it sees; fails when `data.fail` is true.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<i64>>,
}

impl RecordingHandler {
    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, data: &Value, payload: &Value) -> anyhow::Result<()> {
        assert_eq!(payload.get("data"), Some(data));
        self.seen
            .lock()
            .push(data.get("seq").and_then(Value::as_i64).unwrap_or(-1));
        if data.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            anyhow::bail!("handler failed");
        }
        Ok(())
    }
}

/// A dispatcher wired to recording doubles and a temporary state database.
pub struct Harness {
    pub state: Arc<StateDb>,
    pub backend: Arc<RecordingBackend>,
    pub handler: Arc<RecordingHandler>,
    pub sink: Arc<RecordingSink>,
    _tmp: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backend(RecordingBackend::default())
    }

    pub fn with_backend(backend: RecordingBackend) -> Self {
        let tmp = TempDir::new().unwrap();
        let state = Arc::new(StateDb::open(tmp.path()).unwrap());
        Self {
            state,
            backend: Arc::new(backend),
            handler: Arc::new(RecordingHandler::default()),
            sink: Arc::new(RecordingSink::default()),
            _tmp: tmp,
        }
    }

    /// `createCard` and `updateCard` are handled; nothing else is.
    pub fn dispatcher(&self) -> Dispatcher {
        let handlers = HandlerTable::new()
            .with("createCard", self.handler.clone())
            .with("updateCard", self.handler.clone());

        let collaborators = Collaborators {
            provisioner: self.backend.clone(),
            importer: self.backend.clone(),
            mentions: self.backend.clone(),
            handlers,
        };

        Dispatcher::new(
            collaborators,
            self.state.clone(),
            self.state.clone(),
            self.sink.clone(),
        )
    }
}

/// Publish `bodies`, collect them as one batch and dispatch it.
pub async fn dispatch_all(dispatcher: &mut Dispatcher, bodies: &[Value]) -> MemoryPublisher {
    let (publisher, mut queue) = memory_queue();
    for body in bodies {
        publisher.publish_json(body);
    }

    let batch = BatchAccumulator::new(bodies.len(), Duration::from_secs(1))
        .accumulate(&mut queue)
        .await
        .unwrap();
    assert_eq!(batch.len(), bodies.len());

    dispatcher.process(&mut queue, batch).await.unwrap();
    publisher
}

/// An upstream webhook event wrapped in `action`, as the producer sends them.
pub fn webhook(event_type: &str, board: &str, seq: i64, date: Option<i64>) -> Value {
    let mut action = serde_json::json!({
        "type": event_type,
        "data": { "board": { "id": board }, "seq": seq },
        "memberCreator": { "username": "alice" },
    });
    if let Some(date) = date {
        action["date"] = date.into();
    }
    serde_json::json!({ "action": action, "model": { "id": board } })
}
