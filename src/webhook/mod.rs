//! Webhook notifications.
//!
//! Delivery is asynchronous: jobs enqueue payloads onto a bounded queue that
//! never blocks the data plane, and a single worker drains it through a
//! retry loop guarded by a circuit breaker. A failing endpoint therefore
//! costs at most a queue slot, never a backup.

use core::time::Duration;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{config::WebhookConfig, spec::BackupSpec};

mod breaker;

pub use breaker::{BreakerOpen, CircuitBreaker};

/// Notification queue capacity. Enqueueing into a full queue drops the
/// payload with a warning.
const QUEUE_CAPACITY: usize = 100;

/// Consecutive failures before the breaker opens.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Hard ceiling on retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// The signature header attached when a secret is configured.
pub const SIGNATURE_HEADER: &str = "X-Signature-SHA256";

const USER_AGENT: &str = "label-backup/1.0";

/// The JSON body posted to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub container_id: String,
    pub container_name: String,
    pub database_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    pub destination_url: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_size_bytes: Option<u64>,
    pub duration_seconds: f64,
    #[serde(rename = "timestamp_utc")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<String>,
}

struct WorkItem {
    payload: NotificationPayload,
    target_url: String,
}

/// Asynchronous webhook sender.
pub struct Notifier {
    tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    global_url: Option<String>,
}

impl Notifier {
    /// Create the notifier and start its worker.
    pub fn new(config: &WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(NotifyError::BuildClient)?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let sender = Sender {
            client,
            secret: config.secret.clone(),
            max_retries: config.max_retries,
            breaker: CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, config.breaker_recovery),
        };

        let worker = tokio::spawn(sender.run(rx));

        info!(
            "Webhook sender initialized (global URL {}, max retries {}, secret {})",
            config.url.as_deref().unwrap_or("unset"),
            config.max_retries,
            if config.secret.is_some() { "configured" } else { "unset" },
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            global_url: config.url.clone(),
        })
    }

    /// Enqueue a notification. Never blocks: a full queue drops the payload.
    pub fn enqueue(&self, payload: NotificationPayload, spec: &BackupSpec) {
        let target_url = spec
            .webhook
            .clone()
            .or_else(|| self.global_url.clone());

        let Some(target_url) = target_url else {
            info!(
                "Webhook skipped for {}: no target URL configured",
                payload.container_id
            );
            return;
        };

        let guard = self.tx.lock().expect("notifier lock is never poisoned");
        let Some(tx) = guard.as_ref() else {
            warn!("Webhook sender is stopped, dropping notification");
            return;
        };

        match tx.try_send(WorkItem {
            payload,
            target_url,
        }) {
            Ok(()) => debug!("Enqueued webhook notification"),
            Err(_) => warn!("Webhook queue full, dropping notification"),
        }
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn stop(&self) {
        info!("Stopping webhook sender...");

        // Dropping the sender ends the worker's receive loop once the queue
        // is drained.
        self.tx
            .lock()
            .expect("notifier lock is never poisoned")
            .take();

        let worker = self
            .worker
            .lock()
            .expect("notifier lock is never poisoned")
            .take();

        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                error!("Webhook worker task failed: {error}");
            }
        }

        info!("Webhook sender stopped");
    }
}

struct Sender {
    client: reqwest::Client,
    secret: Option<String>,
    max_retries: u32,
    breaker: CircuitBreaker,
}

impl Sender {
    async fn run(self, mut rx: mpsc::Receiver<WorkItem>) {
        debug!("Webhook worker started");

        while let Some(item) = rx.recv().await {
            self.send_with_retries(&item).await;
        }

        debug!("Webhook worker stopped after draining queue");
    }

    async fn send_with_retries(&self, item: &WorkItem) {
        if self.breaker.try_acquire().is_err() {
            warn!(
                "Webhook to {} skipped: circuit breaker is open",
                item.target_url
            );
            return;
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match self.send_attempt(item).await {
                Ok(()) => {
                    info!(
                        "Webhook sent to {} for {} (attempt {})",
                        item.target_url,
                        item.payload.container_id,
                        attempt + 1,
                    );
                    self.breaker.record(true);
                    return;
                }
                Err(error) => {
                    warn!(
                        "Webhook attempt {}/{} to {} failed: {error}",
                        attempt + 1,
                        self.max_retries + 1,
                        item.target_url,
                    );
                    last_error = Some(error);
                }
            }

            if attempt < self.max_retries {
                let backoff = Duration::from_secs(2u64 << attempt).min(MAX_BACKOFF);
                debug!("Retrying webhook in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
        }

        self.breaker.record(false);

        if let Some(error) = last_error {
            error!(
                "Webhook to {} failed after {} attempts: {error}",
                item.target_url,
                self.max_retries + 1,
            );
        }
    }

    async fn send_attempt(&self, item: &WorkItem) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(&item.payload)?;

        let mut request = self
            .client
            .post(&item.target_url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(NotifyError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body: body.chars().take(1024).collect(),
            });
        }

        Ok(())
    }
}

/// The lowercase hex HMAC-SHA-256 of a request body.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to build the HTTP client:\n{0}")]
    BuildClient(#[source] reqwest::Error),

    #[error("Failed to serialize webhook payload:\n{0}")]
    Serialize(#[from] serde_json::Error),

    #[error("HTTP request failed:\n{0}")]
    Request(#[source] reqwest::Error),

    #[error("Webhook returned non-2xx status {status}: {body}")]
    Status { status: u16, body: String },
}
