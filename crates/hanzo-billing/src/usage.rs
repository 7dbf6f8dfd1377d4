//! Best-effort usage reporting to the commerce back end.
//!
//! Records are queued in process memory, flushed in batches of 50 or on a
//! 5-second timer, and discarded when a flush fails. There is no durable
//! outbox; restart loses whatever is queued. The reporter is a no-op until
//! configured with commerce credentials.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

pub const USAGE_FLUSH_BATCH_SIZE: usize = 50;
pub const USAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const USAGE_POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Tenant attribution carried on a usage record.
pub struct UsageTenant {
    pub org_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
/// One billed unit of agent work; immutable after enqueue.
pub struct UsageRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<UsageTenant>,
    pub model: String,
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
/// Commerce ingestion endpoint and credentials.
pub struct UsageSinkConfig {
    pub base_url: String,
    pub service_token: Option<String>,
}

#[derive(Debug)]
struct UsageReporterInner {
    sink: Option<UsageSinkConfig>,
    http: reqwest::Client,
    flush_interval: Duration,
    queue: StdMutex<VecDeque<UsageRecord>>,
    pending_flush: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Process-wide FIFO usage queue with a single pending-flush timer.
#[derive(Debug, Clone)]
pub struct UsageReporter {
    inner: Arc<UsageReporterInner>,
}

impl UsageReporter {
    pub fn new(sink: Option<UsageSinkConfig>) -> Self {
        Self {
            inner: Arc::new(UsageReporterInner {
                sink,
                http: reqwest::Client::new(),
                flush_interval: USAGE_FLUSH_INTERVAL,
                queue: StdMutex::new(VecDeque::new()),
                pending_flush: StdMutex::new(None),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Overrides the flush timer interval (tests and aggressive deployments).
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.flush_interval = flush_interval;
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.sink.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    /// Enqueues a record; a full batch flushes immediately, otherwise the
    /// 5-second timer is armed.
    pub fn report(&self, record: UsageRecord) {
        if self.inner.sink.is_none() {
            return;
        }
        let queued = {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            queue.push_back(record);
            queue.len()
        };
        if queued >= USAGE_FLUSH_BATCH_SIZE {
            let reporter = self.clone();
            tokio::spawn(async move {
                reporter.flush_now().await;
            });
        } else {
            self.ensure_flush_timer();
        }
    }

    /// Cancels any pending timer and flushes one batch.
    pub async fn flush_now(&self) {
        self.cancel_pending_timer();
        self.flush_batch().await;
    }

    /// Drains the queue by flushing until it is empty.
    pub async fn shutdown(&self) {
        if self.inner.sink.is_none() {
            return;
        }
        self.cancel_pending_timer();
        while self.flush_batch().await {}
    }

    fn ensure_flush_timer(&self) {
        let mut pending = self
            .inner
            .pending_flush
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let reporter = self.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(reporter.inner.flush_interval).await;
            // Remove our own handle first so the flush below cannot be
            // aborted by a concurrent batch-threshold flush.
            reporter.cancel_pending_timer_slot_only();
            reporter.flush_batch().await;
        }));
    }

    fn cancel_pending_timer(&self) {
        let handle = self
            .inner
            .pending_flush
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    fn cancel_pending_timer_slot_only(&self) {
        let _ = self
            .inner
            .pending_flush
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
    }

    /// Takes up to one batch off the queue and posts it; returns true when a
    /// batch was taken. Failed batches are logged and discarded.
    async fn flush_batch(&self) -> bool {
        let Some(sink) = self.inner.sink.as_ref() else {
            return false;
        };
        let batch: Vec<UsageRecord> = {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            let take = queue.len().min(USAGE_FLUSH_BATCH_SIZE);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return false;
        }

        let url = format!(
            "{}/v1/usage/records",
            sink.base_url.trim_end_matches('/')
        );
        let mut request = self
            .inner
            .http
            .post(url)
            .timeout(USAGE_POST_TIMEOUT)
            .json(&json!({ "records": batch }));
        if let Some(service_token) = sink.service_token.as_deref() {
            request = request.bearer_auth(service_token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(records = batch.len(), "usage batch flushed");
            }
            Ok(response) => {
                warn!(
                    records = batch.len(),
                    status = response.status().as_u16(),
                    "usage batch rejected; records discarded"
                );
            }
            Err(error) => {
                warn!(
                    records = batch.len(),
                    "usage batch flush failed; records discarded: {error}"
                );
            }
        }
        true
    }
}
