//! In-process broker.
//!
//! Backs tests and single-process runs with the same observable semantics as
//! the real providers: at-least-once delivery, a concurrency ceiling,
//! redelivery on nack-with-requeue, and dead-lettering on nack-without-requeue.
//! Published messages, dead letters, and ack/nack counters are all inspectable,
//! and individual publishes can be rigged to fail by message type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery, DeliveryHandler};
use crate::error::{FurlongError, Result};
use crate::message::{Envelope, ProcessingResult};

/// A message captured on publish, envelope included.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub body: Vec<u8>,
    pub envelope: Envelope,
}

struct FailRule {
    message_type: String,
    remaining: usize,
}

struct Inner {
    /// Adapter-default destination; the subscription is bound to it.
    destination: String,
    max_deliveries: u32,
    semaphore: Arc<Semaphore>,
    subscriber: RwLock<Option<DeliveryHandler>>,
    published: Mutex<Vec<PublishedMessage>>,
    dead_letters: Mutex<Vec<PublishedMessage>>,
    fail_rules: Mutex<Vec<FailRule>>,
    acked: AtomicUsize,
    nacked: AtomicUsize,
    requeued: AtomicUsize,
    in_flight: AtomicUsize,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

/// In-memory implementation of the [`Broker`] trait.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<Inner>,
}

impl LocalBroker {
    /// Create a broker whose default destination (and bound queue) is `destination`.
    pub fn new(destination: impl Into<String>) -> Self {
        Self::with_concurrency(destination, 5)
    }

    /// Create a broker with a custom in-flight handler ceiling.
    pub fn with_concurrency(destination: impl Into<String>, concurrency: usize) -> Self {
        Self::with_limits(destination, concurrency, 5)
    }

    /// Create a broker with custom concurrency and redelivery limits. A
    /// delivery nacked with requeue more than `max_deliveries` times is
    /// dead-lettered, standing in for a broker-side delivery cap.
    pub fn with_limits(
        destination: impl Into<String>,
        concurrency: usize,
        max_deliveries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                destination: destination.into(),
                max_deliveries: max_deliveries.max(1),
                semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
                subscriber: RwLock::new(None),
                published: Mutex::new(Vec::new()),
                dead_letters: Mutex::new(Vec::new()),
                fail_rules: Mutex::new(Vec::new()),
                acked: AtomicUsize::new(0),
                nacked: AtomicUsize::new(0),
                requeued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                connected: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Rig the next `times` publishes of `message_type` to fail.
    pub fn fail_next_publish(&self, message_type: impl Into<String>, times: usize) {
        self.inner.fail_rules.lock().push(FailRule {
            message_type: message_type.into(),
            remaining: times,
        });
    }

    /// All messages accepted by `publish`, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().clone()
    }

    /// Published messages of one type.
    pub fn published_of(&self, message_type: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.envelope.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Messages nacked without requeue.
    pub fn dead_letters(&self) -> Vec<PublishedMessage> {
        self.inner.dead_letters.lock().clone()
    }

    pub fn ack_count(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn nack_count(&self) -> usize {
        self.inner.nacked.load(Ordering::SeqCst)
    }

    pub fn requeue_count(&self) -> usize {
        self.inner.requeued.load(Ordering::SeqCst)
    }

    /// Wait until no deliveries are in flight.
    pub async fn wait_idle(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn take_fail_rule(&self, message_type: &str) -> bool {
        let mut rules = self.inner.fail_rules.lock();
        for rule in rules.iter_mut() {
            if rule.message_type == message_type && rule.remaining > 0 {
                rule.remaining -= 1;
                return true;
            }
        }
        rules.retain(|r| r.remaining > 0);
        false
    }

    fn deliver(&self, message: PublishedMessage, handler: DeliveryHandler) {
        let inner = self.inner.clone();
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut attempt: u32 = 1;
            loop {
                if inner.shutdown.is_cancelled() {
                    break;
                }
                let permit = match inner.semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let mut metadata = message.envelope.metadata.clone();
                metadata.insert(
                    "MessageType".to_string(),
                    message.envelope.message_type.clone(),
                );
                if let Some(correlation) = &message.envelope.correlation_id {
                    metadata.insert("CorrelationId".to_string(), correlation.clone());
                }
                let delivery = Delivery {
                    body: message.body.clone(),
                    message_id: message.envelope.message_id.clone(),
                    delivery_count: attempt,
                    metadata,
                };
                let result = handler(delivery).await;
                drop(permit);
                match result {
                    ProcessingResult::Success => {
                        inner.acked.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    ProcessingResult::Failure { requeue: true, .. }
                        if attempt < inner.max_deliveries =>
                    {
                        inner.requeued.fetch_add(1, Ordering::SeqCst);
                        attempt += 1;
                    }
                    ProcessingResult::Failure { requeue, reason } => {
                        inner.nacked.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(
                            message_id = %message.envelope.message_id,
                            message_type = %message.envelope.message_type,
                            requeue,
                            reason = %reason,
                            "delivery dead-lettered"
                        );
                        inner.dead_letters.lock().push(message.clone());
                        break;
                    }
                }
            }
            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, body: Vec<u8>, envelope: Envelope) -> Result<()> {
        if self.take_fail_rule(&envelope.message_type) {
            return Err(FurlongError::Broker(format!(
                "rigged publish failure for {}",
                envelope.message_type
            )));
        }

        let destination = envelope
            .destination
            .clone()
            .unwrap_or_else(|| self.inner.destination.clone());
        let message = PublishedMessage { body, envelope };
        self.inner.published.lock().push(message.clone());

        if destination == self.inner.destination {
            let handler = self.inner.subscriber.read().clone();
            if let Some(handler) = handler {
                self.deliver(message, handler);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, handler: DeliveryHandler) -> Result<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(FurlongError::NotConnected);
        }
        *self.inner.subscriber.write() = Some(handler);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.wait_idle(Duration::from_secs(5)).await;
        *self.inner.subscriber.write() = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message_type: &str, destination: Option<&str>) -> Envelope {
        Envelope {
            message_type: message_type.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            destination: destination.map(String::from),
            subject: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_recorded() {
        let broker = LocalBroker::new("work");
        broker.connect().await.unwrap();
        broker
            .publish(b"{}".to_vec(), envelope("Ping", None))
            .await
            .unwrap();
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.ack_count(), 0);
    }

    #[tokio::test]
    async fn success_acks_and_failure_dead_letters() {
        let broker = LocalBroker::new("work");
        broker.connect().await.unwrap();
        let handler: DeliveryHandler = Arc::new(|delivery: Delivery| {
            Box::pin(async move {
                if delivery.body == b"ok" {
                    ProcessingResult::Success
                } else {
                    ProcessingResult::failure(false, "poison")
                }
            })
        });
        broker.subscribe(handler).await.unwrap();

        broker
            .publish(b"ok".to_vec(), envelope("Ping", None))
            .await
            .unwrap();
        broker
            .publish(b"bad".to_vec(), envelope("Ping", None))
            .await
            .unwrap();
        broker.wait_idle(Duration::from_secs(1)).await;

        assert_eq!(broker.ack_count(), 1);
        assert_eq!(broker.nack_count(), 1);
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn requeue_redelivers_with_incremented_count() {
        let broker = LocalBroker::new("work");
        broker.connect().await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().push(delivery.delivery_count);
                if delivery.delivery_count < 3 {
                    ProcessingResult::failure(true, "try again")
                } else {
                    ProcessingResult::Success
                }
            })
        });
        broker.subscribe(handler).await.unwrap();

        broker
            .publish(b"{}".to_vec(), envelope("Ping", None))
            .await
            .unwrap();
        broker.wait_idle(Duration::from_secs(1)).await;

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(broker.ack_count(), 1);
        assert_eq!(broker.requeue_count(), 2);
    }

    #[tokio::test]
    async fn rigged_publish_fails_once_then_recovers() {
        let broker = LocalBroker::new("work");
        broker.connect().await.unwrap();
        broker.fail_next_publish("Ping", 1);

        let err = broker
            .publish(b"{}".to_vec(), envelope("Ping", None))
            .await
            .unwrap_err();
        assert!(matches!(err, FurlongError::Broker(_)));

        broker
            .publish(b"{}".to_vec(), envelope("Ping", None))
            .await
            .unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn foreign_destination_is_not_delivered() {
        let broker = LocalBroker::new("work");
        broker.connect().await.unwrap();
        let handler: DeliveryHandler =
            Arc::new(|_| Box::pin(async { ProcessingResult::Success }));
        broker.subscribe(handler).await.unwrap();

        broker
            .publish(b"{}".to_vec(), envelope("Ping", Some("events")))
            .await
            .unwrap();
        broker.wait_idle(Duration::from_secs(1)).await;

        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.ack_count(), 0);
    }
}
