//! Request lifecycle engine.
//!
//! Every domain processor runs the same claim-and-process state machine:
//! load the request row, guard terminal and in-flight states, claim it,
//! execute the domain work transactionally, publish the `Completed` event,
//! and translate any failure into the right broker disposition. The domain
//! differences live behind [`DomainWork`]; the engine owns the guards.
//!
//! Idempotency comes from at-least-once delivery plus the guards: a
//! redelivered message finds the row `Completed` (or `InProgress`) and acks
//! without re-executing. The one exception is a row whose side effects
//! committed but whose event never went out — recognizable by the
//! `"Publish failed: "` annotation — where redelivery republishes the event
//! and clears the annotation instead of skipping silently.

use std::sync::Arc;

use async_trait::async_trait;
use furlong::{BusMessage, MessageContext, ProcessingResult, Processor, RoutingPublisher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{Result, StablehandError};
use crate::requests::{RequestStatus, ServiceType, PUBLISH_FAILED_PREFIX};
use crate::store::RequestStore;

/// The domain-specific part of a request processor.
#[async_trait]
pub trait DomainWork: Send + Sync {
    type Message: BusMessage + DeserializeOwned + Send + Sync + 'static;
    type Event: BusMessage + Serialize + Send + Sync;

    const SERVICE: ServiceType;

    fn request_id(message: &Self::Message) -> Uuid;

    /// Execute the domain work inside one transaction: write the side
    /// effects and flip the request row to `Completed`. Returns the
    /// `Completed` event to publish. Must honor `ctx` cancellation at I/O
    /// boundaries by returning [`StablehandError::Cancelled`].
    async fn execute(&self, message: &Self::Message, ctx: &MessageContext) -> Result<Self::Event>;

    /// Rebuild the `Completed` event from the stored request row, for the
    /// republish-after-commit reconciliation path. `None` when the row is
    /// missing or has no output pointer yet.
    async fn completed_event(&self, id: Uuid) -> Result<Option<Self::Event>>;
}

/// Lifecycle engine wrapping one [`DomainWork`]; this is the [`Processor`]
/// handed to the consumer.
pub struct RequestProcessor<W, S> {
    work: W,
    store: Arc<S>,
    publisher: Arc<RoutingPublisher>,
}

impl<W, S> RequestProcessor<W, S>
where
    W: DomainWork,
    S: RequestStore,
{
    pub fn new(work: W, store: Arc<S>, publisher: Arc<RoutingPublisher>) -> Self {
        Self {
            work,
            store,
            publisher,
        }
    }

    async fn republish_completed(&self, id: Uuid) -> ProcessingResult {
        match self.work.completed_event(id).await {
            Ok(Some(event)) => match self.publisher.publish(&event).await {
                Ok(()) => {
                    if let Err(e) = self.store.clear_publish_failure(W::SERVICE, id).await {
                        tracing::warn!(
                            service = %W::SERVICE,
                            request_id = %id,
                            error = %e,
                            "republished event but failed to clear the annotation"
                        );
                    }
                    tracing::info!(
                        service = %W::SERVICE,
                        request_id = %id,
                        "republished completed event"
                    );
                    ProcessingResult::Success
                }
                Err(e) => {
                    ProcessingResult::failure(false, format!("{PUBLISH_FAILED_PREFIX}{e}"))
                }
            },
            Ok(None) => {
                tracing::warn!(
                    service = %W::SERVICE,
                    request_id = %id,
                    "publish-failure annotation without a completed event to rebuild"
                );
                ProcessingResult::Success
            }
            Err(e) => ProcessingResult::failure(false, e.to_string()),
        }
    }

    async fn run(&self, message: &W::Message, ctx: &MessageContext) -> ProcessingResult {
        let id = W::request_id(message);

        let head = match self.store.head(W::SERVICE, id).await {
            Ok(head) => head,
            Err(e) => {
                tracing::error!(
                    service = %W::SERVICE,
                    request_id = %id,
                    error = %e,
                    "failed to load request row"
                );
                return ProcessingResult::failure(false, format!("failed to load request: {e}"));
            }
        };

        // No row: already reconciled out-of-band, or fabricated. Ack.
        let Some(head) = head else {
            tracing::info!(
                service = %W::SERVICE,
                request_id = %id,
                "no request row for message; acknowledging"
            );
            return ProcessingResult::Success;
        };

        match head.status {
            RequestStatus::Completed => {
                if head.needs_event_republish() {
                    return self.republish_completed(id).await;
                }
                tracing::debug!(
                    service = %W::SERVICE,
                    request_id = %id,
                    "request already completed; acknowledging"
                );
                return ProcessingResult::Success;
            }
            // Another worker holds the lease, or a prior attempt crashed
            // mid-flight; the reaper or bulk replay recovers the latter.
            RequestStatus::InProgress => {
                tracing::debug!(
                    service = %W::SERVICE,
                    request_id = %id,
                    "request already in progress; acknowledging"
                );
                return ProcessingResult::Success;
            }
            RequestStatus::Failed => {
                tracing::info!(
                    service = %W::SERVICE,
                    request_id = %id,
                    delivery_count = ctx.delivery_count,
                    "reprocessing previously failed request"
                );
            }
            RequestStatus::Pending => {}
        }

        match self.store.claim(W::SERVICE, id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(
                    service = %W::SERVICE,
                    request_id = %id,
                    "lost the claim race; acknowledging"
                );
                return ProcessingResult::Success;
            }
            Err(e) => {
                tracing::warn!(
                    service = %W::SERVICE,
                    request_id = %id,
                    error = %e,
                    "claim persist failed; re-reading row"
                );
                match self.store.head(W::SERVICE, id).await {
                    Ok(Some(reread)) if reread.status == RequestStatus::InProgress => {
                        return ProcessingResult::Success;
                    }
                    // Proceed optimistically; the completion transaction has
                    // its own terminal guard.
                    _ => {}
                }
            }
        }

        if ctx.is_cancelled() {
            return ProcessingResult::failure(true, "cancelled before execution");
        }

        match self.work.execute(message, ctx).await {
            Ok(event) => match self.publisher.publish(&event).await {
                Ok(()) => {
                    tracing::info!(
                        service = %W::SERVICE,
                        request_id = %id,
                        "request completed"
                    );
                    ProcessingResult::Success
                }
                Err(e) => {
                    // Side effects are committed; keep the row Completed and
                    // leave a reconciliation marker for the republish path.
                    let reason = format!("{PUBLISH_FAILED_PREFIX}{e}");
                    tracing::error!(
                        service = %W::SERVICE,
                        request_id = %id,
                        error = %e,
                        "completed event publish failed after commit"
                    );
                    if let Err(annotate_err) = self
                        .store
                        .annotate_publish_failure(W::SERVICE, id, &reason)
                        .await
                    {
                        tracing::error!(
                            service = %W::SERVICE,
                            request_id = %id,
                            error = %annotate_err,
                            "failed to record publish failure"
                        );
                    }
                    ProcessingResult::failure(false, reason)
                }
            },
            Err(StablehandError::Cancelled) => {
                ProcessingResult::failure(true, "cancelled mid-process")
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    service = %W::SERVICE,
                    request_id = %id,
                    reason = %reason,
                    "request failed"
                );
                if let Err(record_err) = self.store.mark_failed(W::SERVICE, id, &reason).await {
                    tracing::error!(
                        service = %W::SERVICE,
                        request_id = %id,
                        error = %record_err,
                        "failed to record failure"
                    );
                }
                ProcessingResult::failure(false, reason)
            }
        }
    }
}

#[async_trait]
impl<W, S> Processor<W::Message> for RequestProcessor<W, S>
where
    W: DomainWork,
    S: RequestStore,
{
    async fn process(&self, message: W::Message, ctx: &MessageContext) -> ProcessingResult {
        self.run(&message, ctx).await
    }
}
