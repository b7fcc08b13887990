//! Storage contract for request rows and game entities.
//!
//! Each lifecycle step maps to one atomic store operation. The claim is a
//! guarded update that reports whether the row was won; the per-domain
//! `complete_*` operations persist the side effects and flip the request row
//! to `Completed` inside one transaction, so a crash can never leave a
//! half-written completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Color, FeedResponse, Feeding, Horse, HorseStatistic, NewFoal, Race, Training,
};
use crate::error::Result;
use crate::requests::{
    BreedingRequest, FeedingRequest, RaceRequest, RequestHead, RequestStatus, ServiceType,
    TrainingRequest,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[cfg(test)]
mod tests;

/// Lifecycle operations shared by all four request tables, keyed by
/// [`ServiceType`].
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Status view of a request row; `None` when the row does not exist.
    async fn head(&self, service: ServiceType, id: Uuid) -> Result<Option<RequestHead>>;

    /// Guarded `Pending | Failed -> InProgress` transition. Returns `false`
    /// when the row is absent or another worker already moved it.
    async fn claim(&self, service: ServiceType, id: Uuid) -> Result<bool>;

    /// Persist `Failed` with a reason and a processed timestamp.
    async fn mark_failed(&self, service: ServiceType, id: Uuid, reason: &str) -> Result<()>;

    /// Record a publish failure on a row that stays `Completed`.
    async fn annotate_publish_failure(
        &self,
        service: ServiceType,
        id: Uuid,
        reason: &str,
    ) -> Result<()>;

    /// Erase the publish-failure annotation after a successful republish.
    async fn clear_publish_failure(&self, service: ServiceType, id: Uuid) -> Result<()>;

    /// Reset `InProgress` rows untouched since `older_than` back to
    /// `Pending`, recovering from workers that crashed between claim and
    /// commit. Returns the number of rows reset.
    async fn reset_stuck_in_progress(
        &self,
        service: ServiceType,
        older_than: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Read access to horses and the game catalogs.
#[async_trait]
pub trait HorseStore: Send + Sync {
    async fn horse(&self, id: Uuid) -> Result<Option<Horse>>;
    async fn statistics(&self, horse_id: Uuid) -> Result<Vec<HorseStatistic>>;
    async fn colors(&self) -> Result<Vec<Color>>;
    async fn feeding(&self, id: i16) -> Result<Option<Feeding>>;
    async fn feeding_preference(
        &self,
        horse_id: Uuid,
        feeding_id: i16,
    ) -> Result<Option<FeedResponse>>;
    async fn training(&self, id: i16) -> Result<Option<Training>>;
    async fn race(&self, id: i16) -> Result<Option<Race>>;
    /// Horses available to fill out a race field, excluding the requester.
    async fn race_field_fill(
        &self,
        limit: usize,
        exclude: Uuid,
    ) -> Result<Vec<(Horse, Vec<HorseStatistic>)>>;
}

#[async_trait]
pub trait BreedingStore: Send + Sync {
    async fn insert_breeding_request(&self, request: &BreedingRequest) -> Result<()>;
    async fn breeding_request(&self, id: Uuid) -> Result<Option<BreedingRequest>>;
    async fn breeding_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<BreedingRequest>>;
    /// Atomically: insert the foal and its statistics, bump both parents'
    /// `parented` counters, and mark the request `Completed` with the foal
    /// as output pointer. Returns the foal id.
    async fn complete_breeding(&self, id: Uuid, foal: NewFoal) -> Result<Uuid>;
}

/// Everything the store must persist when a feeding completes.
#[derive(Debug, Clone)]
pub struct FeedingOutcome {
    pub session_id: Uuid,
    pub horse_id: Uuid,
    pub feeding_id: i16,
    pub user_id: Uuid,
    pub response: FeedResponse,
    pub happiness_delta: i16,
    pub new_happiness: i16,
    /// True the first time this horse tastes this feed; persists the
    /// preference row.
    pub record_preference: bool,
}

#[async_trait]
pub trait FeedingStore: Send + Sync {
    async fn insert_feeding_request(&self, request: &FeedingRequest) -> Result<()>;
    async fn feeding_request(&self, id: Uuid) -> Result<Option<FeedingRequest>>;
    async fn feeding_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<FeedingRequest>>;
    /// Atomically: write the feeding session, update the horse's happiness,
    /// record the first-taste preference when asked, and mark the request
    /// `Completed`. Returns the feeding session id.
    async fn complete_feeding(&self, id: Uuid, outcome: FeedingOutcome) -> Result<Uuid>;
}

/// Everything the store must persist when a training completes.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub session_id: Uuid,
    pub horse_id: Uuid,
    pub training_id: i16,
    pub user_id: Uuid,
    pub statistic: crate::domain::StatisticType,
    pub gain: i16,
    pub new_actual: i16,
    pub new_happiness: i16,
    pub overworked: bool,
}

#[async_trait]
pub trait TrainingStore: Send + Sync {
    async fn insert_training_request(&self, request: &TrainingRequest) -> Result<()>;
    async fn training_request(&self, id: Uuid) -> Result<Option<TrainingRequest>>;
    async fn training_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<TrainingRequest>>;
    /// Atomically: write the training session, apply the stat gain and
    /// happiness cost, flag the horse as trained, and mark the request
    /// `Completed`. Returns the training session id.
    async fn complete_training(&self, id: Uuid, outcome: TrainingOutcome) -> Result<Uuid>;
}

/// Final placement of one horse, before the run id is known.
#[derive(Debug, Clone)]
pub struct RacePlacement {
    pub horse_id: Uuid,
    pub placement: i16,
    pub finish_ticks: i32,
    pub payout: i64,
}

/// Distance covered by one horse at one tick, before the run id is known.
#[derive(Debug, Clone)]
pub struct RaceTick {
    pub tick: i32,
    pub horse_id: Uuid,
    pub distance: f64,
}

/// Everything the store must persist when a race run completes.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub race_id: i16,
    /// The horse whose request is being completed; its career counters and
    /// earnings are updated.
    pub requester: Uuid,
    pub placements: Vec<RacePlacement>,
    pub ticks: Vec<RaceTick>,
}

#[async_trait]
pub trait RacingStore: Send + Sync {
    async fn insert_race_request(&self, request: &RaceRequest) -> Result<()>;
    async fn race_request(&self, id: Uuid) -> Result<Option<RaceRequest>>;
    async fn race_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RaceRequest>>;
    /// Atomically: write the run, its ticks and placements, update the
    /// requesting horse's career counters, and mark the request `Completed`.
    /// Returns the race run id.
    async fn complete_race(&self, id: Uuid, outcome: RaceOutcome) -> Result<Uuid>;
}

/// Full store surface used by the workers.
pub trait Store:
    RequestStore + HorseStore + BreedingStore + FeedingStore + TrainingStore + RacingStore
{
}

impl<T> Store for T where
    T: RequestStore + HorseStore + BreedingStore + FeedingStore + TrainingStore + RacingStore
{
}
