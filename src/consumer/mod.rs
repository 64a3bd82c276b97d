use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsumerConfig;
use crate::event::{self, Decoded, EventKind};
use crate::health::PipelineMetrics;
use crate::queue::{Message, MessageQueue};
use crate::store::Store;

/// One long-poll consumer loop bound to a single queue and event kind.
///
/// Messages are acknowledged only after the event is durably persisted;
/// an unacknowledged message is redelivered and deduplicated by its
/// idempotency key. Malformed bodies and unknown event types are
/// acknowledged and dropped, since redelivery cannot fix them.
pub struct Consumer<Q> {
    kind: EventKind,
    queue: Arc<Q>,
    store: Store,
    metrics: Arc<PipelineMetrics>,
    cfg: ConsumerConfig,
}

impl<Q: MessageQueue + 'static> Consumer<Q> {
    pub fn new(
        kind: EventKind,
        queue: Arc<Q>,
        store: Store,
        metrics: Arc<PipelineMetrics>,
        cfg: ConsumerConfig,
    ) -> Self {
        Self {
            kind,
            queue,
            store,
            metrics,
            cfg,
        }
    }

    /// Spawns the consumer loop, running until the token is cancelled.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(kind = %self.kind, "consumer started");
            self.run(&token).await;
            info!(kind = %self.kind, "consumer stopped");
        })
    }

    async fn run(&self, token: &CancellationToken) {
        loop {
            let batch = tokio::select! {
                _ = token.cancelled() => break,
                batch = self
                    .queue
                    .receive(self.cfg.max_messages, self.cfg.wait_time) => batch,
            };

            match batch {
                Ok(messages) => {
                    for message in messages {
                        self.handle(message).await;
                    }
                }
                Err(e) => {
                    self.metrics
                        .queue_errors
                        .with_label_values(&[self.kind.as_str()])
                        .inc();
                    warn!(kind = %self.kind, error = %e, "queue receive failed, backing off");

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.cfg.error_backoff) => {}
                    }
                }
            }
        }
    }

    /// Processes one delivery end to end.
    async fn handle(&self, message: Message) {
        let ack = match event::decode(&message.body, self.kind) {
            Ok(Decoded::Event(ev)) => match self.store.insert_event(self.kind, &ev) {
                Ok(true) => {
                    self.metrics
                        .events_stored
                        .with_label_values(&[self.kind.as_str()])
                        .inc();
                    debug!(kind = %self.kind, event_id = %ev.event_id, "event stored");
                    true
                }
                Ok(false) => {
                    self.metrics
                        .events_duplicate
                        .with_label_values(&[self.kind.as_str()])
                        .inc();
                    debug!(kind = %self.kind, event_id = %ev.event_id, "duplicate delivery");
                    true
                }
                Err(e) => {
                    // Leave unacknowledged; redelivery retries the insert.
                    warn!(kind = %self.kind, event_id = %ev.event_id, error = %e, "persisting event failed");
                    false
                }
            },
            Ok(Decoded::Ignored(event_type)) => {
                self.metrics
                    .messages_dropped
                    .with_label_values(&[self.kind.as_str()])
                    .inc();
                debug!(kind = %self.kind, event_type = %event_type, "ignoring event type");
                true
            }
            Err(e) => {
                self.metrics
                    .messages_dropped
                    .with_label_values(&[self.kind.as_str()])
                    .inc();
                warn!(kind = %self.kind, error = %e, "dropping malformed message");
                true
            }
        };

        if ack {
            if let Err(e) = self.queue.acknowledge(&message.receipt).await {
                // The store is already consistent; redelivery is deduped.
                warn!(kind = %self.kind, error = %e, "acknowledge failed");
            }
        }
    }
}
