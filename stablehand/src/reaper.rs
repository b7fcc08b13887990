//! Stuck-request reaper.
//!
//! A worker that crashes between claim and commit leaves its request row
//! `InProgress` forever; normal processing skips such rows. The reaper
//! periodically resets `InProgress` rows untouched past a threshold back to
//! `Pending`, so bulk replay (or the next delivery) can pick them up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::requests::ServiceType;
use crate::store::RequestStore;

pub struct StuckRequestReaper<S> {
    store: Arc<S>,
    stuck_after: Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl<S> StuckRequestReaper<S>
where
    S: RequestStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        stuck_after: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            stuck_after,
            interval,
            shutdown,
        }
    }

    /// Run until the shutdown token fires.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stuck_after).unwrap_or(chrono::Duration::zero());
        for service in ServiceType::ALL {
            match self.store.reset_stuck_in_progress(service, cutoff).await {
                Ok(0) => {}
                Ok(reset) => {
                    tracing::warn!(
                        service = %service,
                        reset,
                        stuck_after_secs = self.stuck_after.as_secs(),
                        "reset stuck in-progress requests to pending"
                    );
                }
                Err(e) => {
                    tracing::error!(service = %service, error = %e, "stuck-request sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{BreedingRequest, RequestStatus};
    use crate::store::{BreedingStore, MemoryStore};
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_resets_only_old_in_progress_rows() {
        let store = Arc::new(MemoryStore::new());

        let mut stuck = BreedingRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        stuck.status = RequestStatus::InProgress;
        stuck.updated_date = Utc::now() - chrono::Duration::minutes(30);
        store.insert_breeding_request(&stuck).await.unwrap();

        let mut fresh = BreedingRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );
        fresh.status = RequestStatus::InProgress;
        store.insert_breeding_request(&fresh).await.unwrap();

        let reaper = StuckRequestReaper::new(
            store.clone(),
            Duration::from_secs(600),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        reaper.sweep_once().await;

        let stuck_row = store.breeding_request(stuck.request_id).await.unwrap().unwrap();
        assert_eq!(stuck_row.status, RequestStatus::Pending);
        let fresh_row = store.breeding_request(fresh.request_id).await.unwrap().unwrap();
        assert_eq!(fresh_row.status, RequestStatus::InProgress);
    }
}
