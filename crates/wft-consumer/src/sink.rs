//! Error reporting for per-event failures.
//!
//! Reports are fire-and-forget: a sink never blocks the dispatcher and never
//! changes what happens to the event. Sinks that deliver in the background are
//! drained with [`ErrorSink::flush`] before the process exits.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Where in the pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Setup,
    BulkImport,
    Deprovision,
    Mention,
    Webhook,
    Resync,
    Store,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Setup => "setup",
            Self::BulkImport => "bulkImport",
            Self::Deprovision => "deprovision",
            Self::Mention => "mention",
            Self::Webhook => "webhook",
            Self::Resync => "resync",
            Self::Store => "store",
        }
    }
}

/// One structured failure report.
#[derive(Debug)]
pub struct ErrorReport {
    pub error: anyhow::Error,
    /// Whatever helps reproduce the failure (ids, the payload's `data`).
    pub context: Value,
    /// `[stage, event_type]`.
    pub tags: Vec<String>,
    /// The acting user, when known.
    pub user: Option<String>,
}

impl ErrorReport {
    pub fn new(stage: Stage, event_type: &str, error: anyhow::Error, context: Value) -> Self {
        Self {
            error,
            context,
            tags: vec![stage.as_str().to_string(), event_type.to_string()],
            user: None,
        }
    }

    pub fn with_user(mut self, user: Option<&str>) -> Self {
        self.user = user.map(str::to_string);
        self
    }

    pub fn stage(&self) -> &str {
        self.tags.first().map_or("", String::as_str)
    }

    fn to_json(&self) -> Value {
        json!({
            "error": format!("{:#}", self.error),
            "context": self.context,
            "tags": self.tags,
            "user": self.user,
        })
    }
}

/// Receives failure reports.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: ErrorReport);

    /// Wait for reports still being delivered. Called once at shutdown.
    async fn flush(&self) {}
}

/// Logs reports through `tracing`. Always installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, report: ErrorReport) {
        tracing::error!(
            error = %format!("{:#}", report.error),
            tags = ?report.tags,
            user = report.user.as_deref().unwrap_or("-"),
            context = %report.context,
            "Event processing failed"
        );
    }
}

/// Posts reports as JSON to an external error-tracking endpoint.
///
/// Each report is sent from its own task; [`flush`](ErrorSink::flush) waits for
/// the ones still in flight, up to the flush timeout.
pub struct HttpErrorSink {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    pending: Mutex<JoinSet<()>>,
    flush_timeout: Duration,
}

impl HttpErrorSink {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            api_key,
            pending: Mutex::new(JoinSet::new()),
            flush_timeout: Duration::from_secs(10),
        })
    }

    /// Bound how long [`flush`](ErrorSink::flush) waits for in-flight reports.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Reports spawned and not yet reaped.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl ErrorSink for HttpErrorSink {
    fn report(&self, report: ErrorReport) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime; dropping error report");
            return;
        };

        let mut request = self.client.post(&self.url).json(&report.to_json());
        if let Some(key) = &self.api_key {
            request = request.header("X-ApiKey", key);
        }

        let mut pending = self.pending.lock();
        while pending.try_join_next().is_some() {}
        pending.spawn_on(
            async move {
                match request.send().await.and_then(|r| r.error_for_status()) {
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Failed to deliver error report: {}", e),
                }
            },
            &runtime,
        );
    }

    async fn flush(&self) {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        let drained = tokio::time::timeout(self.flush_timeout, async {
            while pending.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("Delivered {} pending error reports", count),
            Err(_) => tracing::warn!(
                "Gave up on {} undelivered error reports after {:?}",
                pending.len(),
                self.flush_timeout
            ),
        }
    }
}

/// Sends every report to each inner sink.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ErrorSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ErrorSink for FanoutSink {
    fn report(&self, report: ErrorReport) {
        let Some((last, rest)) = self.sinks.split_last() else {
            return;
        };
        // anyhow::Error isn't Clone; earlier sinks get a rendered copy
        for sink in rest {
            sink.report(ErrorReport {
                error: anyhow::anyhow!("{:#}", report.error),
                context: report.context.clone(),
                tags: report.tags.clone(),
                user: report.user.clone(),
            });
        }
        last.report(report);
    }

    async fn flush(&self) {
        for sink in &self.sinks {
            sink.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ErrorReport>>);

    impl ErrorSink for Collect {
        fn report(&self, report: ErrorReport) {
            self.0.lock().push(report);
        }
    }

    #[test]
    fn test_report_tags() {
        let report = ErrorReport::new(
            Stage::Webhook,
            "createCard",
            anyhow::anyhow!("boom"),
            json!({ "resource_id": "b1" }),
        )
        .with_user(Some("alice"));

        assert_eq!(report.tags, vec!["webhook", "createCard"]);
        assert_eq!(report.stage(), "webhook");
        assert_eq!(report.user.as_deref(), Some("alice"));

        let body = report.to_json();
        assert_eq!(body["error"], "boom");
        assert_eq!(body["context"]["resource_id"], "b1");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let sinks: Vec<Arc<dyn ErrorSink>> = vec![a.clone(), b.clone()];
        let fanout = FanoutSink::new(sinks);

        fanout.report(ErrorReport::new(
            Stage::Resync,
            "updateCard",
            anyhow::anyhow!("import failed"),
            Value::Null,
        ));

        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 1);
        assert_eq!(a.0.lock()[0].error.to_string(), "import failed");
        assert_eq!(b.0.lock()[0].tags, vec!["resync", "updateCard"]);
    }

    #[test]
    fn test_empty_fanout_is_noop() {
        FanoutSink::default().report(ErrorReport::new(
            Stage::Decode,
            "untyped",
            anyhow::anyhow!("x"),
            Value::Null,
        ));
    }

    #[test]
    fn test_http_sink_without_runtime_drops_report() {
        let sink = HttpErrorSink::new("http://127.0.0.1:1/report", None).unwrap();
        sink.report(ErrorReport::new(
            Stage::Mention,
            "externalMentionReceived",
            anyhow::anyhow!("x"),
            Value::Null,
        ));
    }

    /// Accept one request, hold it for `delay`, record it, then answer 204.
    async fn slow_endpoint(delay: Duration) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/report", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);

                let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let body_len = text[..end]
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|len| len.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }

            tokio::time::sleep(delay).await;
            seen.lock()
                .push(String::from_utf8_lossy(&request).into_owned());
            socket
                .write_all(b"HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        (url, received)
    }

    fn webhook_failure() -> ErrorReport {
        ErrorReport::new(
            Stage::Webhook,
            "createCard",
            anyhow::anyhow!("boom"),
            json!({ "resource_id": "b1" }),
        )
    }

    #[tokio::test]
    async fn test_http_sink_flush_waits_for_delivery() {
        let (url, received) = slow_endpoint(Duration::from_millis(300)).await;
        let sink = HttpErrorSink::new(url, Some("secret".to_string())).unwrap();

        sink.report(webhook_failure());
        assert_eq!(sink.in_flight(), 1);
        assert!(received.lock().is_empty());

        sink.flush().await;

        let received = received.lock();
        assert_eq!(received.len(), 1);
        let request = received[0].to_ascii_lowercase();
        assert!(request.starts_with("post /report"));
        assert!(request.contains("x-apikey: secret"));
        assert!(received[0].contains(r#""tags":["webhook","createCard"]"#));
        assert_eq!(sink.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_http_sink_flush_is_bounded() {
        let (url, received) = slow_endpoint(Duration::from_secs(30)).await;
        let sink = HttpErrorSink::new(url, None)
            .unwrap()
            .with_flush_timeout(Duration::from_millis(200));

        sink.report(webhook_failure());
        let started = Instant::now();
        sink.flush().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fanout_flushes_inner_sinks() {
        let (url, received) = slow_endpoint(Duration::from_millis(100)).await;
        let http = HttpErrorSink::new(url, None).unwrap();
        let sinks: Vec<Arc<dyn ErrorSink>> = vec![Arc::new(TracingErrorSink), Arc::new(http)];
        let fanout = FanoutSink::new(sinks);

        fanout.report(webhook_failure());
        fanout.flush().await;

        assert_eq!(received.lock().len(), 1);
    }
}
