//! Replay: republish the originating message for non-terminal requests.
//!
//! The operator surface has two operations, dispatched by [`ServiceType`]:
//! a single-request replay and a bounded-parallel bulk replay over all
//! `Pending`/`Failed` rows (optionally including `InProgress` rows stuck
//! past a threshold). Redelivered messages land in the lifecycle guards, so
//! replay is always safe to repeat.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use furlong::{BusMessage, RoutingPublisher};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::Result;
use crate::requests::{RequestStatus, ServiceType};
use crate::store::Store;

/// Outcome of a single-request replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Published,
    NotFound,
}

/// Options for bulk replay.
#[derive(Debug, Clone)]
pub struct ReplayAllOptions {
    /// Publish fan-out ceiling.
    pub max_parallel: usize,
    /// Also replay `InProgress` rows untouched for at least this long.
    pub include_stuck_after: Option<Duration>,
}

impl Default for ReplayAllOptions {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            include_stuck_after: None,
        }
    }
}

/// Operator-facing replay controller over all four domains.
pub struct ReplayController<S> {
    store: Arc<S>,
    publisher: Arc<RoutingPublisher>,
}

impl<S> ReplayController<S>
where
    S: Store + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<RoutingPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Republish the originating message for one request.
    pub async fn replay(&self, service: ServiceType, request_id: Uuid) -> Result<ReplayOutcome> {
        match service {
            ServiceType::Breeding => match self.store.breeding_request(request_id).await? {
                None => Ok(ReplayOutcome::NotFound),
                Some(request) => {
                    self.publisher.publish(&request.to_requested()).await?;
                    Ok(ReplayOutcome::Published)
                }
            },
            ServiceType::Feeding => match self.store.feeding_request(request_id).await? {
                None => Ok(ReplayOutcome::NotFound),
                Some(request) => {
                    self.publisher.publish(&request.to_requested()).await?;
                    Ok(ReplayOutcome::Published)
                }
            },
            ServiceType::Training => match self.store.training_request(request_id).await? {
                None => Ok(ReplayOutcome::NotFound),
                Some(request) => {
                    self.publisher.publish(&request.to_requested()).await?;
                    Ok(ReplayOutcome::Published)
                }
            },
            ServiceType::Racing => match self.store.race_request(request_id).await? {
                None => Ok(ReplayOutcome::NotFound),
                Some(request) => {
                    self.publisher.publish(&request.to_requested()).await?;
                    Ok(ReplayOutcome::Published)
                }
            },
        }
    }

    /// Republish every non-terminal request of one domain. Returns the
    /// number of successful publishes.
    pub async fn replay_all_non_complete(
        &self,
        service: ServiceType,
        options: ReplayAllOptions,
    ) -> Result<usize> {
        let statuses: Vec<RequestStatus> = if options.include_stuck_after.is_some() {
            vec![
                RequestStatus::Pending,
                RequestStatus::Failed,
                RequestStatus::InProgress,
            ]
        } else {
            vec![RequestStatus::Pending, RequestStatus::Failed]
        };
        let stuck_cutoff = options.include_stuck_after.map(|age| {
            Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero())
        });

        macro_rules! collect {
            ($list:expr, $updated:ident) => {
                $list
                    .into_iter()
                    .filter(|request| match request.status {
                        RequestStatus::InProgress => stuck_cutoff
                            .map(|cutoff| request.$updated < cutoff)
                            .unwrap_or(false),
                        _ => true,
                    })
                    .map(|request| request.to_requested())
                    .collect::<Vec<_>>()
            };
        }

        let published = match service {
            ServiceType::Breeding => {
                let requests = self.store.breeding_requests_with_status(&statuses).await?;
                self.publish_bounded(collect!(requests, updated_date), options.max_parallel)
                    .await
            }
            ServiceType::Feeding => {
                let requests = self.store.feeding_requests_with_status(&statuses).await?;
                self.publish_bounded(collect!(requests, updated_date), options.max_parallel)
                    .await
            }
            ServiceType::Training => {
                let requests = self.store.training_requests_with_status(&statuses).await?;
                self.publish_bounded(collect!(requests, updated_date), options.max_parallel)
                    .await
            }
            ServiceType::Racing => {
                let requests = self.store.race_requests_with_status(&statuses).await?;
                self.publish_bounded(collect!(requests, updated_date), options.max_parallel)
                    .await
            }
        };

        tracing::info!(service = %service, published, "bulk replay finished");
        Ok(published)
    }

    async fn publish_bounded<M>(&self, messages: Vec<M>, max_parallel: usize) -> usize
    where
        M: BusMessage + Serialize + Send + Sync + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for message in messages {
            let semaphore = semaphore.clone();
            let publisher = self.publisher.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return false,
                };
                match publisher.publish(&message).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            message_type = M::NAME,
                            error = %e,
                            "replay publish failed"
                        );
                        false
                    }
                }
            });
        }

        let mut published = 0usize;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => published += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "replay publish task panicked"),
            }
        }
        published
    }
}
