//! Cloud queue/topic broker adapter over Azure Service Bus.
//!
//! Senders are cached per destination; the subscription runs a batched
//! receive loop whose batch size doubles as the concurrency ceiling.
//! Settlement maps `ProcessingResult` onto the provider verbs: success
//! completes the message, requeueable failure abandons it (the broker
//! redelivers and bumps the delivery count), and a poison failure
//! dead-letters it into the entity's native DLQ.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use azservicebus::{
    ServiceBusClient, ServiceBusClientOptions, ServiceBusMessage, ServiceBusReceiverOptions,
    ServiceBusSenderOptions,
};
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery, DeliveryHandler};
use crate::config::ConsumerConfig;
use crate::error::{FurlongError, Result};
use crate::message::{Envelope, ProcessingResult};

/// Settings for the queue/topic this adapter serves.
#[derive(Debug, Clone)]
pub struct ServiceBusOptions {
    /// Queue consumed by `subscribe`; also the adapter-default destination.
    pub queue: String,
    /// Max in-flight handlers per receive batch.
    pub concurrency: usize,
}

impl ServiceBusOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            concurrency: 5,
        }
    }

    pub fn from_consumer(consumer: &ConsumerConfig) -> Self {
        Self {
            queue: consumer.queue.clone(),
            concurrency: consumer.concurrency,
        }
    }
}

struct Inner {
    connection_string: String,
    options: ServiceBusOptions,
    client: Mutex<Option<ServiceBusClient>>,
    senders: Mutex<HashMap<String, azservicebus::ServiceBusSender>>,
    shutdown: CancellationToken,
}

/// Azure Service Bus implementation of the [`Broker`] trait.
#[derive(Clone)]
pub struct ServiceBusBroker {
    inner: Arc<Inner>,
}

fn broker_err(e: impl std::fmt::Display) -> FurlongError {
    FurlongError::Broker(e.to_string())
}

impl ServiceBusBroker {
    pub fn new(connection_string: impl Into<String>, options: ServiceBusOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection_string: connection_string.into(),
                options,
                client: Mutex::new(None),
                senders: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Inner {
    async fn ensure_client(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let client = ServiceBusClient::new_from_connection_string(
            self.connection_string.clone(),
            ServiceBusClientOptions::default(),
        )
        .await
        .map_err(broker_err)?;
        *guard = Some(client);
        Ok(())
    }

    async fn send(&self, destination: &str, message: ServiceBusMessage) -> Result<()> {
        self.ensure_client().await?;
        let mut senders = self.senders.lock().await;
        if !senders.contains_key(destination) {
            let mut client_guard = self.client.lock().await;
            let client = client_guard.as_mut().ok_or(FurlongError::NotConnected)?;
            let sender = client
                .create_sender(destination, ServiceBusSenderOptions::default())
                .await
                .map_err(broker_err)?;
            senders.insert(destination.to_string(), sender);
        }
        let sender = senders
            .get_mut(destination)
            .ok_or(FurlongError::NotConnected)?;
        sender.send_message(message).await.map_err(broker_err)
    }
}

#[async_trait]
impl Broker for ServiceBusBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.ensure_client().await
    }

    async fn publish(&self, body: Vec<u8>, envelope: Envelope) -> Result<()> {
        let destination = envelope
            .destination
            .clone()
            .unwrap_or_else(|| self.inner.options.queue.clone());

        let mut message = ServiceBusMessage::new(body);
        message.set_message_id(envelope.message_id.clone());
        if let Some(correlation) = &envelope.correlation_id {
            message.set_correlation_id(correlation.clone());
        }
        let subject = envelope
            .subject
            .clone()
            .unwrap_or_else(|| envelope.message_type.clone());
        message.set_subject(subject);

        self.inner.send(&destination, message).await
    }

    async fn subscribe(&self, handler: DeliveryHandler) -> Result<()> {
        self.inner.ensure_client().await?;
        let mut receiver = {
            let mut client_guard = self.inner.client.lock().await;
            let client = client_guard.as_mut().ok_or(FurlongError::NotConnected)?;
            client
                .create_receiver_for_queue(
                    self.inner.options.queue.clone(),
                    ServiceBusReceiverOptions::default(),
                )
                .await
                .map_err(broker_err)?
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let batch = inner.options.concurrency.max(1) as u32;
            loop {
                if inner.shutdown.is_cancelled() {
                    break;
                }
                let messages = tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    received = receiver.receive_messages(batch) => match received {
                        Ok(messages) => messages,
                        Err(e) => {
                            tracing::warn!(error = %e, "service bus receive failed; retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                            continue;
                        }
                    },
                };

                // Handlers run concurrently; settlement happens sequentially
                // afterwards because the receiver serializes disposition calls.
                let mut outcomes = Vec::with_capacity(messages.len());
                {
                    let mut pending = Vec::with_capacity(messages.len());
                    for message in &messages {
                        let body = message.body().map(<[u8]>::to_vec).unwrap_or_default();
                        let delivery = Delivery {
                            body,
                            message_id: uuid::Uuid::new_v4().to_string(),
                            delivery_count: (message.delivery_count() as u32).max(1),
                            metadata: HashMap::new(),
                        };
                        let handler = handler.clone();
                        pending.push(async move {
                            match AssertUnwindSafe(handler(delivery)).catch_unwind().await {
                                Ok(result) => result,
                                Err(_) => ProcessingResult::failure(
                                    false,
                                    "message handler panicked",
                                ),
                            }
                        });
                    }
                    outcomes.extend(futures::future::join_all(pending).await);
                }

                for (message, outcome) in messages.iter().zip(outcomes) {
                    let settled = match outcome {
                        ProcessingResult::Success => {
                            receiver.complete_message(message).await.map_err(broker_err)
                        }
                        ProcessingResult::Failure { requeue: true, reason } => {
                            tracing::warn!(reason = %reason, "abandoning delivery for redelivery");
                            receiver.abandon_message(message, None).await.map_err(broker_err)
                        }
                        ProcessingResult::Failure { requeue: false, reason } => {
                            tracing::warn!(reason = %reason, "dead-lettering delivery");
                            receiver
                                .dead_letter_message(message, Default::default())
                                .await
                                .map_err(broker_err)
                        }
                    };
                    if let Err(e) = settled {
                        tracing::error!(error = %e, "failed to settle delivery; broker will redeliver");
                    }
                }
            }
            if let Err(e) = receiver.dispose().await {
                tracing::debug!(error = %e, "receiver dispose failed");
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let mut senders = self.inner.senders.lock().await;
        for (_, sender) in senders.drain() {
            if let Err(e) = sender.dispose().await {
                tracing::debug!(error = %e, "sender dispose failed");
            }
        }
        if let Some(client) = self.inner.client.lock().await.take() {
            if let Err(e) = client.dispose().await {
                tracing::debug!(error = %e, "client dispose failed");
            }
        }
        Ok(())
    }
}
