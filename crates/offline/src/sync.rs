use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as FlushLock;
use tracing::{debug, warn};
use url::Url;

use crate::fetch::{FetchRequest, Fetcher};

pub const SYNC_FORMS_TAG: &str = "sync-forms";
pub const SYNC_ANALYTICS_TAG: &str = "sync-analytics";

/// Locally queued work flushed when connectivity returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    FormSubmissions,
    Analytics,
}

impl QueueKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            SYNC_FORMS_TAG => Some(Self::FormSubmissions),
            SYNC_ANALYTICS_TAG => Some(Self::Analytics),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::FormSubmissions => SYNC_FORMS_TAG,
            Self::Analytics => SYNC_ANALYTICS_TAG,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub id: u64,
    pub endpoint: Url,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
}

/// Pending form submissions and analytics events.
#[derive(Debug, Default)]
pub struct Outbox {
    queues: Mutex<HashMap<QueueKind, Vec<QueuedItem>>>,
    next_id: AtomicU64,
    forms_flush: FlushLock<()>,
    analytics_flush: FlushLock<()>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, kind: QueueKind, endpoint: Url, payload: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.with_queues(|queues| {
            queues.entry(kind).or_default().push(QueuedItem {
                id,
                endpoint,
                payload,
            })
        });
        id
    }

    pub fn pending(&self, kind: QueueKind) -> usize {
        self.with_queues(|queues| queues.get(&kind).map(Vec::len).unwrap_or_default())
    }

    /// Sends every queued item and drops the ones the server acknowledged
    /// with a 2xx. Failures stay queued for the next trigger.
    ///
    /// At most one flush per queue runs at a time; an overlapping trigger
    /// waits and then only sees what the first one left behind.
    pub async fn flush(&self, kind: QueueKind, fetcher: &dyn Fetcher) -> SyncReport {
        let _flushing = match kind {
            QueueKind::FormSubmissions => self.forms_flush.lock().await,
            QueueKind::Analytics => self.analytics_flush.lock().await,
        };
        let snapshot: Vec<QueuedItem> =
            self.with_queues(|queues| queues.get(&kind).cloned().unwrap_or_default());

        let mut report = SyncReport::default();
        for item in snapshot {
            let request = FetchRequest::post_json(item.endpoint.clone(), &item.payload);
            match fetcher.fetch(&request).await {
                Ok(response) if response.ok() => {
                    self.remove(kind, item.id);
                    report.sent += 1;
                }
                Ok(response) => {
                    debug!(stage = "offline", queue = kind.tag(), id = item.id, status = response.status, "queued item rejected, keeping");
                    report.failed += 1;
                }
                Err(err) => {
                    warn!(stage = "offline", queue = kind.tag(), id = item.id, error = %err, "queued item send failed");
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.pending(kind);
        report
    }

    fn remove(&self, kind: QueueKind, id: u64) {
        self.with_queues(|queues| {
            if let Some(items) = queues.get_mut(&kind) {
                items.retain(|item| item.id != id);
            }
        });
    }

    fn with_queues<R>(&self, f: impl FnOnce(&mut HashMap<QueueKind, Vec<QueuedItem>>) -> R) -> R {
        let mut queues = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut queues)
    }
}
