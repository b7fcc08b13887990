//! Provider-agnostic message bus.
//!
//! This crate turns one of several messaging providers into a uniform
//! publish/subscribe surface with at-least-once semantics:
//!
//! - [`Broker`] — the adapter contract (connect, publish, subscribe,
//!   ack/nack bridging, disconnect), with a topic/exchange implementation
//!   ([`RabbitBroker`]), a cloud queue/topic implementation
//!   ([`ServiceBusBroker`]), and an in-process implementation
//!   ([`LocalBroker`]) for tests and single-process runs.
//! - [`RoutingPublisher`] — resolves `(destination, subject)` per message
//!   type from configuration and delegates to the adapter.
//! - [`Consumer`] — binds a typed [`Processor`] to a queue, handling
//!   deserialization, per-message context, concurrency, and poison messages.
//! - [`resolve_provider`] — picks the concrete provider from configuration,
//!   inspecting connection strings when set to `auto`.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use furlong::{BusMessage, LocalBroker, RoutingConfig, RoutingPublisher};
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Serialize, Deserialize)]
//! struct PingRequested {
//!     request_id: Uuid,
//! }
//!
//! impl BusMessage for PingRequested {
//!     const NAME: &'static str = "PingRequested";
//!     fn correlation_id(&self) -> Option<Uuid> {
//!         Some(self.request_id)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> furlong::Result<()> {
//! let broker = Arc::new(LocalBroker::new("pings"));
//! let publisher = RoutingPublisher::new(broker, RoutingConfig::default());
//! publisher
//!     .publish(&PingRequested { request_id: Uuid::new_v4() })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod routing;

pub use broker::{Broker, Delivery, DeliveryHandler, LocalBroker};
#[cfg(feature = "rabbit")]
pub use broker::{RabbitBroker, RabbitOptions};
#[cfg(feature = "servicebus")]
pub use broker::{ServiceBusBroker, ServiceBusOptions};
pub use config::{
    resolve_provider, BusConfig, ConnectionStrings, ConsumerConfig, MessageRoute, Provider,
    RoutingConfig,
};
pub use consumer::{Consumer, Processor};
pub use error::{FurlongError, Result};
pub use message::{BusMessage, Envelope, MessageContext, ProcessingResult, PublishOptions};
pub use routing::RoutingPublisher;
