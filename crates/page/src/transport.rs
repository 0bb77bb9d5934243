use async_trait::async_trait;
use landing_core::form::{SubmitAck, SubmitTransport, TransportError};
use landing_offline::{QueueKind, WorkerHandle};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

pub const NETWORK_ERROR_MESSAGE: &str =
    "Network error. Please check your connection and try again.";
pub const QUEUED_OFFLINE_MESSAGE: &str =
    "You appear to be offline. Your submission will be sent when the connection returns.";

/// Envelope every capture-service response shares.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    success: Option<bool>,
    message: Option<String>,
    error: Option<String>,
}

/// Posts form payloads as JSON to endpoints on the site origin.
///
/// When an offline worker is attached, payloads that fail at the network
/// level are queued for the `sync-forms` trigger instead of being lost.
#[derive(Clone)]
pub struct HttpSubmitTransport {
    http: Client,
    origin: Url,
    outbox: Option<WorkerHandle>,
}

impl HttpSubmitTransport {
    pub fn new(origin: Url, http: Client) -> Self {
        Self {
            http,
            origin,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, worker: WorkerHandle) -> Self {
        self.outbox = Some(worker);
        self
    }

    async fn queue_offline(&self, endpoint: &str, payload: &Value) -> Option<u64> {
        let worker = self.outbox.as_ref()?;
        match worker
            .queue(QueueKind::FormSubmissions, endpoint, payload.clone())
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(stage = "form", endpoint, error = %err, "failed to queue submission offline");
                None
            }
        }
    }
}

#[async_trait]
impl SubmitTransport for HttpSubmitTransport {
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<SubmitAck, TransportError> {
        let url = self
            .origin
            .join(endpoint)
            .map_err(|err| TransportError::new(format!("invalid endpoint {endpoint}: {err}")))?;

        let response = match self.http.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(stage = "form", endpoint, error = %err, "submission failed at network level");
                return Err(match self.queue_offline(endpoint, payload).await {
                    Some(_) => TransportError::new(QUEUED_OFFLINE_MESSAGE),
                    None => TransportError::new(NETWORK_ERROR_MESSAGE),
                });
            }
        };

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let envelope = Envelope::deserialize(&body).unwrap_or_default();

        if status.is_success() && envelope.success != Some(false) {
            return Ok(SubmitAck {
                message: envelope.message,
                body,
            });
        }

        Err(TransportError {
            message: envelope
                .error
                .unwrap_or_else(|| fallback_message(status)),
            status: Some(status.as_u16()),
        })
    }
}

fn fallback_message(status: StatusCode) -> String {
    if status == StatusCode::TOO_MANY_REQUESTS {
        "Too many requests. Please try again later.".to_string()
    } else {
        format!("Request failed with status {}", status.as_u16())
    }
}
