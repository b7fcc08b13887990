//! Message contract shared by publishers, brokers, and consumers.
//!
//! A wire message is any serde-serializable value that implements
//! [`BusMessage`]. The trait supplies the logical type name used for routing
//! and envelope metadata, and an optional correlation id carried through to
//! the broker-native message properties.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A value that can travel over the bus.
pub trait BusMessage {
    /// Simple type name, e.g. `"BreedingRequested"`.
    ///
    /// This is the routing-table key, the envelope `message_type`, and the
    /// final fallback for the routing subject.
    const NAME: &'static str;

    /// Correlation id propagated into broker-native message properties.
    /// Defaults to the publish-time message id when absent.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }
}

/// Caller-supplied overrides for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Exchange/topic to publish to; overrides the configured route.
    pub destination: Option<String>,
    /// Routing key or subject; overrides the configured route.
    pub subject: Option<String>,
    /// Metadata merged over route metadata (caller wins on collision).
    pub metadata: HashMap<String, String>,
}

/// Envelope handed to the broker adapter alongside the serialized body.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_type: String,
    pub message_id: String,
    pub correlation_id: Option<String>,
    /// `None` falls back to the adapter-default destination.
    pub destination: Option<String>,
    pub subject: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Per-delivery context handed to a handler.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub message_id: String,
    /// 1 on first delivery, incremented by the broker on redelivery.
    pub delivery_count: u32,
    pub metadata: HashMap<String, String>,
    /// Rooted at host shutdown; processors must honor it at I/O boundaries.
    pub cancellation: CancellationToken,
}

impl MessageContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Outcome of one processing attempt, bridged to broker ack/nack.
///
/// `Success` acks the delivery. `Failure { requeue: true }` nacks with
/// requeue (the broker redelivers). `Failure { requeue: false }` nacks
/// without requeue, deferring to the broker's dead-letter mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    Failure { requeue: bool, reason: String },
}

impl ProcessingResult {
    pub fn failure(requeue: bool, reason: impl Into<String>) -> Self {
        ProcessingResult::Failure {
            requeue,
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Success)
    }
}
