//! Routing publisher: resolves destination and subject from configuration
//! by message type, then delegates to the broker adapter.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::RoutingConfig;
use crate::error::{FurlongError, Result};
use crate::message::{BusMessage, Envelope, PublishOptions};

#[derive(Debug, Clone)]
struct ResolvedRoute {
    destination: Option<String>,
    subject: String,
    metadata: std::collections::HashMap<String, String>,
}

/// Decorator over a [`Broker`] that picks `(destination, subject)` per
/// message type.
///
/// Resolution order for the destination: explicit publish option, then the
/// route's destination, then `default_destination`, then the adapter
/// default. For the subject: explicit option, route `routing_key`, route
/// `subject`, `default_routing_key`, and finally the type's simple name.
/// Resolution is cached per type for the publisher's lifetime.
pub struct RoutingPublisher {
    broker: Arc<dyn Broker>,
    config: RoutingConfig,
    cache: DashMap<&'static str, ResolvedRoute>,
}

impl RoutingPublisher {
    pub fn new(broker: Arc<dyn Broker>, config: RoutingConfig) -> Self {
        Self {
            broker,
            config,
            cache: DashMap::new(),
        }
    }

    pub async fn publish<M>(&self, message: &M) -> Result<()>
    where
        M: BusMessage + Serialize,
    {
        self.publish_with(message, PublishOptions::default()).await
    }

    pub async fn publish_with<M>(&self, message: &M, options: PublishOptions) -> Result<()>
    where
        M: BusMessage + Serialize,
    {
        let body = serde_json::to_vec(message)?;
        if body == b"null" {
            return Err(FurlongError::Validation(
                "refusing to publish a null message body".to_string(),
            ));
        }

        let route = self.resolve::<M>();
        let mut metadata = route.metadata.clone();
        metadata.extend(options.metadata);

        let message_id = Uuid::new_v4().to_string();
        let correlation_id = message
            .correlation_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| message_id.clone());

        let envelope = Envelope {
            message_type: M::NAME.to_string(),
            correlation_id: Some(correlation_id),
            message_id,
            destination: options.destination.or_else(|| route.destination.clone()),
            subject: options.subject.or_else(|| Some(route.subject.clone())),
            metadata,
        };

        tracing::debug!(
            message_type = M::NAME,
            destination = envelope.destination.as_deref().unwrap_or("<adapter default>"),
            subject = envelope.subject.as_deref().unwrap_or(""),
            "publishing message"
        );
        self.broker.publish(body, envelope).await
    }

    fn resolve<M: BusMessage>(&self) -> ResolvedRoute {
        self.cache
            .entry(M::NAME)
            .or_insert_with(|| self.compute_route(M::NAME))
            .clone()
    }

    fn compute_route(&self, name: &str) -> ResolvedRoute {
        let route = self.config.routes.get(name);
        ResolvedRoute {
            destination: route
                .and_then(|r| r.destination.clone())
                .or_else(|| self.config.default_destination.clone()),
            subject: route
                .and_then(|r| r.routing_key.clone())
                .or_else(|| route.and_then(|r| r.subject.clone()))
                .or_else(|| self.config.default_routing_key.clone())
                .unwrap_or_else(|| name.to_string()),
            metadata: route.map(|r| r.metadata.clone()).unwrap_or_default(),
        }
    }
}
