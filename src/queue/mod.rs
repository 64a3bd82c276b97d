use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::config::QueueConfig;

/// One received message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Message {
    pub body: String,
    /// Opaque handle used to acknowledge this delivery.
    pub receipt: String,
}

/// Message queue transport.
///
/// Delivery is at-least-once: a message not acknowledged before its
/// visibility window lapses is redelivered.
pub trait MessageQueue: Send + Sync {
    /// Long-polls for up to `max` messages, waiting at most `wait`.
    fn receive(
        &self,
        max: usize,
        wait: Duration,
    ) -> impl std::future::Future<Output = Result<Vec<Message>>> + Send;

    /// Acknowledges one delivery so it is not redelivered.
    fn acknowledge(&self, receipt: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// HTTP queue client speaking the SQS-compatible JSON protocol.
pub struct HttpQueue {
    http: reqwest::Client,
    endpoint: String,
    queue_url: String,
}

impl HttpQueue {
    pub fn new(cfg: &QueueConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.clone(),
            queue_url: cfg.queue_url.clone(),
        })
    }

    /// Performs one queue API call and deserializes the JSON response.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        target: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("AmazonSQS.{target}"))
            .header("Content-Type", "application/x-amz-json-1.0")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("requesting {target}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {target}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding {target} response"))
    }
}

#[derive(Deserialize)]
struct ReceiveMessageResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "Body", default)]
    body: String,
    #[serde(rename = "ReceiptHandle", default)]
    receipt_handle: String,
}

impl MessageQueue for HttpQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Message>> {
        let resp: ReceiveMessageResponse = self
            .post_json(
                "ReceiveMessage",
                json!({
                    "QueueUrl": self.queue_url,
                    "MaxNumberOfMessages": max,
                    "WaitTimeSeconds": wait.as_secs(),
                }),
            )
            .await
            .context("receiving messages")?;

        Ok(resp
            .messages
            .into_iter()
            .map(|m| Message {
                body: m.body,
                receipt: m.receipt_handle,
            })
            .collect())
    }

    async fn acknowledge(&self, receipt: &str) -> Result<()> {
        // DeleteMessage responds with an empty body; only the status
        // matters.
        let response = self
            .http
            .post(&self.endpoint)
            .header("X-Amz-Target", "AmazonSQS.DeleteMessage")
            .header("Content-Type", "application/x-amz-json-1.0")
            .json(&json!({
                "QueueUrl": self.queue_url,
                "ReceiptHandle": receipt,
            }))
            .send()
            .await
            .context("acknowledging message")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from DeleteMessage: {body}");
        }

        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<String>,
    in_flight: HashMap<String, String>,
    next_receipt: u64,
}

/// In-process queue used by tests and local runs.
///
/// Unacknowledged messages stay in flight; `redeliver` moves them back
/// to the head of the queue, modeling a lapsed visibility window.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message body for delivery.
    pub fn push(&self, body: impl Into<String>) {
        self.state.lock().pending.push_back(body.into());
    }

    /// Returns all in-flight messages to the pending queue.
    pub fn redeliver(&self) -> usize {
        let mut state = self.state.lock();
        let bodies: Vec<String> = state.in_flight.drain().map(|(_, body)| body).collect();
        let count = bodies.len();
        for body in bodies {
            state.pending.push_front(body);
        }
        count
    }

    /// Number of messages delivered but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of messages waiting for delivery.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl MessageQueue for MemoryQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Message>> {
        {
            let mut state = self.state.lock();
            if !state.pending.is_empty() {
                let take = max.min(state.pending.len());
                let mut batch = Vec::with_capacity(take);
                for _ in 0..take {
                    let Some(body) = state.pending.pop_front() else {
                        break;
                    };
                    state.next_receipt += 1;
                    let receipt = format!("rcpt-{}", state.next_receipt);
                    state.in_flight.insert(receipt.clone(), body.clone());
                    batch.push(Message { body, receipt });
                }
                return Ok(batch);
            }
        }

        // Nothing queued; model the long-poll wait without busy-looping.
        tokio::time::sleep(wait.min(Duration::from_millis(20))).await;
        Ok(Vec::new())
    }

    async fn acknowledge(&self, receipt: &str) -> Result<()> {
        self.state.lock().in_flight.remove(receipt);
        Ok(())
    }
}
