//! Broker adapter contract and the concrete providers.
//!
//! A broker adapter hides one messaging provider behind a uniform
//! publish/subscribe/ack surface. All adapters share the same semantics:
//! at-least-once delivery, no ordering guarantees, handler results bridged
//! to ack/nack, and a concurrency ceiling mirrored into broker prefetch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::message::{Envelope, ProcessingResult};

pub mod local;
#[cfg(feature = "rabbit")]
pub mod rabbit;
#[cfg(feature = "servicebus")]
pub mod servicebus;

pub use local::LocalBroker;
#[cfg(feature = "rabbit")]
pub use rabbit::{RabbitBroker, RabbitOptions};
#[cfg(feature = "servicebus")]
pub use servicebus::{ServiceBusBroker, ServiceBusOptions};

/// One delivery as seen by a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub message_id: String,
    pub delivery_count: u32,
    pub metadata: HashMap<String, String>,
}

/// Subscription callback. The adapter owns ack/nack; the handler's
/// [`ProcessingResult`] decides which is issued.
pub type DeliveryHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, ProcessingResult> + Send + Sync>;

/// Provider-specific driver behind a single publish+subscribe+ack interface.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the connection and declare the configured destination
    /// (exchange + queue binding, or topic + subscription). Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Publish a framed message. A `None` destination in the envelope falls
    /// back to the adapter-default destination.
    async fn publish(&self, body: Vec<u8>, envelope: Envelope) -> Result<()>;

    /// Bind a handler to the configured queue. Deliveries run concurrently
    /// up to the adapter's configured ceiling.
    async fn subscribe(&self, handler: DeliveryHandler) -> Result<()>;

    /// Drain in-flight acks and close the connection. Safe without a prior
    /// `connect`.
    async fn disconnect(&self) -> Result<()>;
}
