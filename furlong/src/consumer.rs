//! Generic consumer: bridges broker deliveries to a typed domain processor.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery, DeliveryHandler};
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::message::{BusMessage, MessageContext, ProcessingResult};

/// A unit of domain work invoked once per delivery.
///
/// Implementations are shared across in-flight deliveries; per-message state
/// belongs in the [`MessageContext`] or inside the call.
#[async_trait]
pub trait Processor<M>: Send + Sync {
    async fn process(&self, message: M, ctx: &MessageContext) -> ProcessingResult;
}

/// Consumes one queue, deserializes each delivery into `M`, and runs `P`.
///
/// Deliveries that do not parse as `M` are logged and acknowledged so a
/// malformed message cannot poison-loop the queue. The concurrency ceiling
/// is enforced here with a semaphore and mirrored into broker prefetch by
/// the adapter configuration.
pub struct Consumer<M, P> {
    broker: Arc<dyn Broker>,
    processor: Arc<P>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
    semaphore: Arc<Semaphore>,
    _message: PhantomData<fn(M)>,
}

impl<M, P> Consumer<M, P>
where
    M: BusMessage + DeserializeOwned + Send + 'static,
    P: Processor<M> + 'static,
{
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<P>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            broker,
            processor,
            config,
            shutdown,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            _message: PhantomData,
        }
    }

    /// Connect the broker and bind the bridge handler.
    pub async fn start(&self) -> Result<()> {
        self.broker.connect().await?;

        let processor = self.processor.clone();
        let semaphore = self.semaphore.clone();
        let shutdown = self.shutdown.clone();
        let queue = self.config.queue.clone();

        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let processor = processor.clone();
            let semaphore = semaphore.clone();
            let shutdown = shutdown.clone();
            let queue = queue.clone();
            Box::pin(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ProcessingResult::failure(true, "consumer stopped"),
                };
                if shutdown.is_cancelled() {
                    return ProcessingResult::failure(true, "consumer shutting down");
                }

                let message: M = match serde_json::from_slice(&delivery.body) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(
                            queue = %queue,
                            message_id = %delivery.message_id,
                            expected = M::NAME,
                            error = %e,
                            "unrecognized message schema; acknowledging"
                        );
                        return ProcessingResult::Success;
                    }
                };

                let ctx = MessageContext {
                    message_id: delivery.message_id,
                    delivery_count: delivery.delivery_count,
                    metadata: delivery.metadata,
                    cancellation: shutdown.child_token(),
                };
                tracing::debug!(
                    queue = %queue,
                    message_id = %ctx.message_id,
                    message_type = M::NAME,
                    delivery_count = ctx.delivery_count,
                    "processing delivery"
                );
                processor.process(message, &ctx).await
            })
        });

        self.broker.subscribe(handler).await
    }

    /// Disconnect the broker; never fails.
    pub async fn stop(&self) {
        if let Err(e) = self.broker.disconnect().await {
            tracing::warn!(queue = %self.config.queue, error = %e, "broker disconnect failed");
        }
    }
}
