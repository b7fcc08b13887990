//! Topic/exchange broker adapter over AMQP 0-9-1 (lapin).
//!
//! Declares a durable topic exchange and a bound queue on connect, publishes
//! with per-message properties (message id, correlation id, headers), and
//! consumes with a prefetch ceiling. Ack/nack calls are serialized behind a
//! per-channel lock; handlers still run concurrently. A supervising task
//! reconnects and resubscribes after transient connection loss.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery, DeliveryHandler};
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::message::{Envelope, ProcessingResult};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Declaration settings for the exchange/queue pair this adapter serves.
#[derive(Debug, Clone)]
pub struct RabbitOptions {
    /// Default exchange; also the adapter-default publish destination.
    pub exchange: String,
    /// Queue consumed by `subscribe`.
    pub queue: String,
    /// Binding pattern between exchange and queue.
    pub binding_key: String,
    /// Optional `x-dead-letter-exchange` for the queue declaration.
    pub dead_letter_exchange: Option<String>,
    /// Max in-flight handlers.
    pub concurrency: usize,
    /// Channel prefetch; normally equals `concurrency`.
    pub prefetch: u16,
}

impl RabbitOptions {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            exchange: exchange.into(),
            binding_key: format!("{queue}.#"),
            queue,
            dead_letter_exchange: None,
            concurrency: 5,
            prefetch: 5,
        }
    }

    pub fn from_consumer(exchange: impl Into<String>, consumer: &ConsumerConfig) -> Self {
        let mut options = Self::new(exchange, consumer.queue.clone());
        options.concurrency = consumer.concurrency;
        options.prefetch = consumer.prefetch();
        options
    }

    /// Publisher-only adapter: declares the exchange but no queue.
    pub fn publisher(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: String::new(),
            binding_key: String::new(),
            dead_letter_exchange: None,
            concurrency: 1,
            prefetch: 1,
        }
    }
}

struct RabbitState {
    connection: Connection,
    channel: Channel,
}

struct Inner {
    uri: String,
    options: RabbitOptions,
    state: Mutex<Option<Arc<RabbitState>>>,
    ack_lock: Arc<Mutex<()>>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// AMQP implementation of the [`Broker`] trait.
#[derive(Clone)]
pub struct RabbitBroker {
    inner: Arc<Inner>,
}

impl RabbitBroker {
    pub fn new(uri: impl Into<String>, options: RabbitOptions) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                uri: uri.into(),
                options,
                state: Mutex::new(None),
                ack_lock: Arc::new(Mutex::new(())),
                semaphore: Arc::new(Semaphore::new(concurrency)),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Inner {
    async fn ensure_state(&self) -> Result<Arc<RabbitState>> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_ref() {
            if state.connection.status().connected() {
                return Ok(state.clone());
            }
            *guard = None;
        }

        let connection = Connection::connect(
            &self.uri,
            ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::current())
                .with_reactor(tokio_reactor_trait::Tokio),
        )
        .await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.options.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        if !self.options.queue.is_empty() {
            let mut queue_args = FieldTable::default();
            if let Some(dlx) = &self.options.dead_letter_exchange {
                queue_args.insert(
                    ShortString::from("x-dead-letter-exchange"),
                    AMQPValue::LongString(dlx.clone().into()),
                );
            }
            channel
                .queue_declare(
                    &self.options.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    queue_args,
                )
                .await?;
            channel
                .queue_bind(
                    &self.options.queue,
                    &self.options.exchange,
                    &self.options.binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            channel
                .basic_qos(self.options.prefetch, BasicQosOptions::default())
                .await?;
        }

        let state = Arc::new(RabbitState {
            connection,
            channel,
        });
        *guard = Some(state.clone());
        Ok(state)
    }

    async fn drop_state(&self) {
        self.state.lock().await.take();
    }

    async fn consume_until_closed(
        &self,
        state: Arc<RabbitState>,
        handler: DeliveryHandler,
    ) -> std::result::Result<(), lapin::Error> {
        let mut consumer = state
            .channel
            .basic_consume(
                &self.options.queue,
                "furlong",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = consumer.next() => {
                    let delivery = match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => return Err(e),
                        // Stream ended: the channel or connection went away.
                        None => return Ok(()),
                    };
                    let handler = handler.clone();
                    let semaphore = self.semaphore.clone();
                    let ack_lock = self.ack_lock.clone();
                    tokio::spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let bridged = bridge_delivery(&delivery);
                        let message_id = bridged.message_id.clone();
                        let delivery_tag = delivery.delivery_tag;
                        let result = match AssertUnwindSafe(handler(bridged)).catch_unwind().await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                ProcessingResult::failure(false, "message handler panicked")
                            }
                        };
                        let _ack_guard = ack_lock.lock().await;
                        let settled = match &result {
                            ProcessingResult::Success => {
                                delivery.ack(BasicAckOptions::default()).await
                            }
                            ProcessingResult::Failure { requeue, reason } => {
                                tracing::warn!(
                                    message_id = %message_id,
                                    delivery_tag,
                                    requeue,
                                    reason = %reason,
                                    "processing failed; nacking delivery"
                                );
                                delivery
                                    .nack(BasicNackOptions {
                                        requeue: *requeue,
                                        ..Default::default()
                                    })
                                    .await
                            }
                        };
                        if let Err(e) = settled {
                            tracing::error!(
                                message_id = %message_id,
                                delivery_tag,
                                error = %e,
                                "failed to settle delivery; broker will redeliver"
                            );
                        }
                    });
                }
            }
        }
    }
}

fn bridge_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    let mut metadata = HashMap::new();
    let mut delivery_count = if delivery.redelivered { 2 } else { 1 };
    if let Some(headers) = delivery.properties.headers() {
        for (key, value) in headers.inner() {
            match value {
                AMQPValue::LongString(s) => {
                    metadata.insert(key.to_string(), s.to_string());
                }
                AMQPValue::LongLongInt(n) if key.as_str() == "x-delivery-count" => {
                    // Quorum queues track the exact count; prefer it.
                    delivery_count = (*n).max(1) as u32;
                }
                _ => {}
            }
        }
    }
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| delivery.delivery_tag.to_string());
    if let Some(correlation) = delivery.properties.correlation_id() {
        metadata.insert("CorrelationId".to_string(), correlation.to_string());
    }

    Delivery {
        body: delivery.data.clone(),
        message_id,
        delivery_count,
        metadata,
    }
}

#[async_trait]
impl Broker for RabbitBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.ensure_state().await?;
        Ok(())
    }

    async fn publish(&self, body: Vec<u8>, envelope: Envelope) -> Result<()> {
        let state = self.inner.ensure_state().await?;
        let exchange = envelope
            .destination
            .as_deref()
            .unwrap_or(&self.inner.options.exchange);
        let routing_key = envelope
            .subject
            .as_deref()
            .unwrap_or(&envelope.message_type);

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("MessageType"),
            AMQPValue::LongString(envelope.message_type.clone().into()),
        );
        for (key, value) in &envelope.metadata {
            headers.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(value.clone().into()),
            );
        }

        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(envelope.message_id.as_str().into())
            .with_headers(headers);
        if let Some(correlation) = &envelope.correlation_id {
            properties = properties.with_correlation_id(correlation.as_str().into());
        }

        state
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn subscribe(&self, handler: DeliveryHandler) -> Result<()> {
        // The first subscription must succeed synchronously; reconnects are
        // supervised afterwards.
        let state = self.inner.ensure_state().await?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut state = Some(state);
            loop {
                let current = match state.take() {
                    Some(state) => state,
                    None => match inner.ensure_state().await {
                        Ok(state) => state,
                        Err(e) => {
                            if inner.shutdown.is_cancelled() {
                                return;
                            }
                            tracing::warn!(error = %e, "rabbit reconnect failed; retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                    },
                };
                match inner.consume_until_closed(current, handler.clone()).await {
                    Ok(()) if inner.shutdown.is_cancelled() => return,
                    Ok(()) => {
                        tracing::warn!("rabbit consumer stream ended; reconnecting");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "rabbit consumer failed; reconnecting");
                    }
                }
                inner.drop_state().await;
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        // Drain in-flight handlers before tearing the channel down.
        let permits = self.inner.options.concurrency.max(1) as u32;
        let _ = tokio::time::timeout(
            Duration::from_secs(10),
            self.inner.semaphore.acquire_many(permits),
        )
        .await;
        if let Some(state) = self.inner.state.lock().await.take() {
            if let Err(e) = state.channel.close(200, "shutdown").await {
                tracing::debug!(error = %e, "channel close failed");
            }
            if let Err(e) = state.connection.close(200, "shutdown").await {
                tracing::debug!(error = %e, "connection close failed");
            }
        }
        Ok(())
    }
}
