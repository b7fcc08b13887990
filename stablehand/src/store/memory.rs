//! In-memory store.
//!
//! Mirrors the Postgres semantics over concurrent maps. Backs the tests and
//! single-process runs; everything is lost on restart. Mutations that are
//! transactional in Postgres run under write locks here, so a completion is
//! still observed atomically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::{
    Color, FeedResponse, Feeding, FeedingSession, Horse, HorseStatistic, NewFoal, Race, RaceRun,
    RaceRunHorse, RaceRunTick, Training, TrainingSession,
};
use crate::error::{Result, StablehandError};
use crate::requests::{
    BreedingRequest, FeedingRequest, RaceRequest, RequestHead, RequestStatus, ServiceType,
    TrainingRequest,
};
use crate::store::{
    BreedingStore, FeedingOutcome, FeedingStore, HorseStore, RaceOutcome, RacingStore,
    RequestStore, TrainingOutcome, TrainingStore,
};

#[derive(Default)]
struct Inner {
    horses: RwLock<HashMap<Uuid, Horse>>,
    statistics: RwLock<HashMap<Uuid, Vec<HorseStatistic>>>,
    colors: RwLock<Vec<Color>>,
    feedings: RwLock<HashMap<i16, Feeding>>,
    trainings: RwLock<HashMap<i16, Training>>,
    races: RwLock<HashMap<i16, Race>>,
    preferences: RwLock<HashMap<(Uuid, i16), FeedResponse>>,
    feeding_sessions: RwLock<Vec<FeedingSession>>,
    training_sessions: RwLock<Vec<TrainingSession>>,
    race_runs: RwLock<Vec<RaceRun>>,
    race_run_horses: RwLock<Vec<RaceRunHorse>>,
    race_run_ticks: RwLock<Vec<RaceRunTick>>,
    breeding_requests: RwLock<HashMap<Uuid, BreedingRequest>>,
    feeding_requests: RwLock<HashMap<Uuid, FeedingRequest>>,
    training_requests: RwLock<HashMap<Uuid, TrainingRequest>>,
    race_requests: RwLock<HashMap<Uuid, RaceRequest>>,
}

/// In-memory implementation of the store traits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers used by tests and local runs.

    pub fn seed_color(&self, color: Color) {
        self.inner.colors.write().push(color);
    }

    pub fn seed_feeding(&self, feeding: Feeding) {
        self.inner.feedings.write().insert(feeding.id, feeding);
    }

    pub fn seed_training(&self, training: Training) {
        self.inner.trainings.write().insert(training.id, training);
    }

    pub fn seed_race(&self, race: Race) {
        self.inner.races.write().insert(race.id, race);
    }

    pub fn insert_horse(&self, horse: Horse, statistics: Vec<HorseStatistic>) {
        self.inner.statistics.write().insert(horse.id, statistics);
        self.inner.horses.write().insert(horse.id, horse);
    }

    pub fn horse_count(&self) -> usize {
        self.inner.horses.read().len()
    }

    pub fn feeding_sessions(&self) -> Vec<FeedingSession> {
        self.inner.feeding_sessions.read().clone()
    }

    pub fn training_sessions(&self) -> Vec<TrainingSession> {
        self.inner.training_sessions.read().clone()
    }

    pub fn race_runs(&self) -> Vec<RaceRun> {
        self.inner.race_runs.read().clone()
    }

    pub fn race_run_horses(&self, run_id: Uuid) -> Vec<RaceRunHorse> {
        self.inner
            .race_run_horses
            .read()
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Foals of a given sire, newest insertion order not guaranteed.
    pub fn foals_of(&self, sire_id: Uuid) -> Vec<Horse> {
        self.inner
            .horses
            .read()
            .values()
            .filter(|h| h.sire_id == Some(sire_id))
            .cloned()
            .collect()
    }

    fn request_head(&self, service: ServiceType, id: Uuid) -> Option<RequestHead> {
        match service {
            ServiceType::Breeding => self.inner.breeding_requests.read().get(&id).map(|r| {
                RequestHead {
                    status: r.status,
                    failure_reason: r.failure_reason.clone(),
                }
            }),
            ServiceType::Feeding => {
                self.inner
                    .feeding_requests
                    .read()
                    .get(&id)
                    .map(|r| RequestHead {
                        status: r.status,
                        failure_reason: r.failure_reason.clone(),
                    })
            }
            ServiceType::Training => {
                self.inner
                    .training_requests
                    .read()
                    .get(&id)
                    .map(|r| RequestHead {
                        status: r.status,
                        failure_reason: r.failure_reason.clone(),
                    })
            }
            ServiceType::Racing => {
                self.inner
                    .race_requests
                    .read()
                    .get(&id)
                    .map(|r| RequestHead {
                        status: r.status,
                        failure_reason: r.failure_reason.clone(),
                    })
            }
        }
    }

    fn update_row(
        &self,
        service: ServiceType,
        id: Uuid,
        f: impl FnOnce(&mut dyn RequestRow) -> bool,
    ) -> Result<bool> {
        macro_rules! apply {
            ($table:ident) => {{
                let mut table = self.inner.$table.write();
                match table.get_mut(&id) {
                    Some(row) => Ok(f(row)),
                    None => Ok(false),
                }
            }};
        }
        match service {
            ServiceType::Breeding => apply!(breeding_requests),
            ServiceType::Feeding => apply!(feeding_requests),
            ServiceType::Training => apply!(training_requests),
            ServiceType::Racing => apply!(race_requests),
        }
    }
}

/// Uniform mutable view over the four request row types.
trait RequestRow {
    fn status(&self) -> RequestStatus;
    fn set_status(&mut self, status: RequestStatus);
    fn set_failure_reason(&mut self, reason: Option<String>);
    fn set_processed_date(&mut self, at: Option<DateTime<Utc>>);
    fn touch(&mut self, at: DateTime<Utc>);
}

macro_rules! impl_request_row {
    ($type:ty) => {
        impl RequestRow for $type {
            fn status(&self) -> RequestStatus {
                self.status
            }
            fn set_status(&mut self, status: RequestStatus) {
                self.status = status;
            }
            fn set_failure_reason(&mut self, reason: Option<String>) {
                self.failure_reason = reason;
            }
            fn set_processed_date(&mut self, at: Option<DateTime<Utc>>) {
                self.processed_date = at;
            }
            fn touch(&mut self, at: DateTime<Utc>) {
                self.updated_date = at;
            }
        }
    };
}

impl_request_row!(BreedingRequest);
impl_request_row!(FeedingRequest);
impl_request_row!(TrainingRequest);
impl_request_row!(RaceRequest);

#[async_trait]
impl RequestStore for MemoryStore {
    async fn head(&self, service: ServiceType, id: Uuid) -> Result<Option<RequestHead>> {
        Ok(self.request_head(service, id))
    }

    async fn claim(&self, service: ServiceType, id: Uuid) -> Result<bool> {
        self.update_row(service, id, |row| {
            match row.status() {
                RequestStatus::Pending | RequestStatus::Failed => {
                    row.set_status(RequestStatus::InProgress);
                    row.touch(Utc::now());
                    true
                }
                _ => false,
            }
        })
    }

    async fn mark_failed(&self, service: ServiceType, id: Uuid, reason: &str) -> Result<()> {
        let now = Utc::now();
        self.update_row(service, id, |row| {
            row.set_status(RequestStatus::Failed);
            row.set_failure_reason(Some(reason.to_string()));
            row.set_processed_date(Some(now));
            row.touch(now);
            true
        })?;
        Ok(())
    }

    async fn annotate_publish_failure(
        &self,
        service: ServiceType,
        id: Uuid,
        reason: &str,
    ) -> Result<()> {
        self.update_row(service, id, |row| {
            row.set_failure_reason(Some(reason.to_string()));
            row.touch(Utc::now());
            true
        })?;
        Ok(())
    }

    async fn clear_publish_failure(&self, service: ServiceType, id: Uuid) -> Result<()> {
        self.update_row(service, id, |row| {
            row.set_failure_reason(None);
            row.touch(Utc::now());
            true
        })?;
        Ok(())
    }

    async fn reset_stuck_in_progress(
        &self,
        service: ServiceType,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        macro_rules! reset {
            ($table:ident) => {{
                let mut reset = 0u64;
                for row in self.inner.$table.write().values_mut() {
                    if row.status == RequestStatus::InProgress && row.updated_date < older_than {
                        row.status = RequestStatus::Pending;
                        row.updated_date = Utc::now();
                        reset += 1;
                    }
                }
                Ok(reset)
            }};
        }
        match service {
            ServiceType::Breeding => reset!(breeding_requests),
            ServiceType::Feeding => reset!(feeding_requests),
            ServiceType::Training => reset!(training_requests),
            ServiceType::Racing => reset!(race_requests),
        }
    }
}

#[async_trait]
impl HorseStore for MemoryStore {
    async fn horse(&self, id: Uuid) -> Result<Option<Horse>> {
        Ok(self.inner.horses.read().get(&id).cloned())
    }

    async fn statistics(&self, horse_id: Uuid) -> Result<Vec<HorseStatistic>> {
        Ok(self
            .inner
            .statistics
            .read()
            .get(&horse_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn colors(&self) -> Result<Vec<Color>> {
        Ok(self.inner.colors.read().clone())
    }

    async fn feeding(&self, id: i16) -> Result<Option<Feeding>> {
        Ok(self.inner.feedings.read().get(&id).cloned())
    }

    async fn feeding_preference(
        &self,
        horse_id: Uuid,
        feeding_id: i16,
    ) -> Result<Option<FeedResponse>> {
        Ok(self
            .inner
            .preferences
            .read()
            .get(&(horse_id, feeding_id))
            .copied())
    }

    async fn training(&self, id: i16) -> Result<Option<Training>> {
        Ok(self.inner.trainings.read().get(&id).cloned())
    }

    async fn race(&self, id: i16) -> Result<Option<Race>> {
        Ok(self.inner.races.read().get(&id).cloned())
    }

    async fn race_field_fill(
        &self,
        limit: usize,
        exclude: Uuid,
    ) -> Result<Vec<(Horse, Vec<HorseStatistic>)>> {
        let horses = self.inner.horses.read();
        let statistics = self.inner.statistics.read();
        Ok(horses
            .values()
            .filter(|h| h.id != exclude)
            .take(limit)
            .map(|h| {
                (
                    h.clone(),
                    statistics.get(&h.id).cloned().unwrap_or_default(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl BreedingStore for MemoryStore {
    async fn insert_breeding_request(&self, request: &BreedingRequest) -> Result<()> {
        let mut table = self.inner.breeding_requests.write();
        if table.contains_key(&request.request_id) {
            return Err(StablehandError::Validation(format!(
                "breeding request {} already exists",
                request.request_id
            )));
        }
        table.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn breeding_request(&self, id: Uuid) -> Result<Option<BreedingRequest>> {
        Ok(self.inner.breeding_requests.read().get(&id).cloned())
    }

    async fn breeding_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<BreedingRequest>> {
        Ok(self
            .inner
            .breeding_requests
            .read()
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn complete_breeding(&self, id: Uuid, foal: NewFoal) -> Result<Uuid> {
        let now = Utc::now();
        let mut requests = self.inner.breeding_requests.write();
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| StablehandError::not_found("BreedingRequest", id))?;
        if request.status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                request.status,
                "a non-terminal status",
            ));
        }

        let foal_id = Uuid::new_v4();
        let statistics = foal
            .statistics
            .iter()
            .map(|s| HorseStatistic {
                horse_id: foal_id,
                statistic: s.statistic,
                dominant_potential: s.dominant_potential,
                recessive_potential: s.recessive_potential,
                actual: s.actual,
            })
            .collect::<Vec<_>>();
        let happiness = statistics
            .iter()
            .find(|s| s.statistic == crate::domain::StatisticType::Happiness)
            .map(|s| s.actual)
            .unwrap_or(50);

        let mut horses = self.inner.horses.write();
        horses.insert(
            foal_id,
            Horse {
                id: foal_id,
                name: foal.name,
                sex: foal.sex,
                leg_type: foal.leg_type,
                color_id: foal.color_id,
                owner_id: foal.owner_id,
                sire_id: Some(foal.sire_id),
                dam_id: Some(foal.dam_id),
                happiness,
                parented: 0,
                race_starts: 0,
                race_wins: 0,
                earnings: 0,
                has_trained_since_last_race: false,
                created_date: now,
                updated_date: now,
            },
        );
        for parent in [foal.sire_id, foal.dam_id] {
            if let Some(horse) = horses.get_mut(&parent) {
                horse.parented += 1;
                horse.updated_date = now;
            }
        }
        self.inner.statistics.write().insert(foal_id, statistics);

        request.status = RequestStatus::Completed;
        request.foal_id = Some(foal_id);
        request.processed_date = Some(now);
        request.updated_date = now;
        Ok(foal_id)
    }
}

#[async_trait]
impl FeedingStore for MemoryStore {
    async fn insert_feeding_request(&self, request: &FeedingRequest) -> Result<()> {
        let mut table = self.inner.feeding_requests.write();
        if table.contains_key(&request.request_id) {
            return Err(StablehandError::Validation(format!(
                "feeding request {} already exists",
                request.request_id
            )));
        }
        table.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn feeding_request(&self, id: Uuid) -> Result<Option<FeedingRequest>> {
        Ok(self.inner.feeding_requests.read().get(&id).cloned())
    }

    async fn feeding_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<FeedingRequest>> {
        Ok(self
            .inner
            .feeding_requests
            .read()
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn complete_feeding(&self, id: Uuid, outcome: FeedingOutcome) -> Result<Uuid> {
        let now = Utc::now();
        let mut requests = self.inner.feeding_requests.write();
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| StablehandError::not_found("FeedingRequest", id))?;
        if request.status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                request.status,
                "a non-terminal status",
            ));
        }

        let session_row_id = Uuid::new_v4();
        self.inner.feeding_sessions.write().push(FeedingSession {
            id: session_row_id,
            session_id: outcome.session_id,
            horse_id: outcome.horse_id,
            feeding_id: outcome.feeding_id,
            user_id: outcome.user_id,
            response: outcome.response,
            happiness_delta: outcome.happiness_delta,
            created_date: now,
        });
        if outcome.record_preference {
            self.inner
                .preferences
                .write()
                .insert((outcome.horse_id, outcome.feeding_id), outcome.response);
        }
        if let Some(horse) = self.inner.horses.write().get_mut(&outcome.horse_id) {
            horse.happiness = outcome.new_happiness;
            horse.updated_date = now;
        }

        request.status = RequestStatus::Completed;
        request.feeding_session_id = Some(session_row_id);
        request.processed_date = Some(now);
        request.updated_date = now;
        Ok(session_row_id)
    }
}

#[async_trait]
impl TrainingStore for MemoryStore {
    async fn insert_training_request(&self, request: &TrainingRequest) -> Result<()> {
        let mut table = self.inner.training_requests.write();
        if table.contains_key(&request.request_id) {
            return Err(StablehandError::Validation(format!(
                "training request {} already exists",
                request.request_id
            )));
        }
        table.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn training_request(&self, id: Uuid) -> Result<Option<TrainingRequest>> {
        Ok(self.inner.training_requests.read().get(&id).cloned())
    }

    async fn training_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<TrainingRequest>> {
        Ok(self
            .inner
            .training_requests
            .read()
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn complete_training(&self, id: Uuid, outcome: TrainingOutcome) -> Result<Uuid> {
        let now = Utc::now();
        let mut requests = self.inner.training_requests.write();
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| StablehandError::not_found("TrainingRequest", id))?;
        if request.status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                request.status,
                "a non-terminal status",
            ));
        }

        let session_row_id = Uuid::new_v4();
        self.inner.training_sessions.write().push(TrainingSession {
            id: session_row_id,
            session_id: outcome.session_id,
            horse_id: outcome.horse_id,
            training_id: outcome.training_id,
            user_id: outcome.user_id,
            statistic: outcome.statistic,
            gain: outcome.gain,
            overworked: outcome.overworked,
            created_date: now,
        });
        if let Some(horse) = self.inner.horses.write().get_mut(&outcome.horse_id) {
            horse.happiness = outcome.new_happiness;
            horse.has_trained_since_last_race = true;
            horse.updated_date = now;
        }
        if let Some(stats) = self.inner.statistics.write().get_mut(&outcome.horse_id) {
            if let Some(stat) = stats.iter_mut().find(|s| s.statistic == outcome.statistic) {
                stat.actual = outcome.new_actual;
            }
        }

        request.status = RequestStatus::Completed;
        request.training_session_id = Some(session_row_id);
        request.processed_date = Some(now);
        request.updated_date = now;
        Ok(session_row_id)
    }
}

#[async_trait]
impl RacingStore for MemoryStore {
    async fn insert_race_request(&self, request: &RaceRequest) -> Result<()> {
        let mut table = self.inner.race_requests.write();
        if table.contains_key(&request.request_id) {
            return Err(StablehandError::Validation(format!(
                "race request {} already exists",
                request.request_id
            )));
        }
        table.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn race_request(&self, id: Uuid) -> Result<Option<RaceRequest>> {
        Ok(self.inner.race_requests.read().get(&id).cloned())
    }

    async fn race_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RaceRequest>> {
        Ok(self
            .inner
            .race_requests
            .read()
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn complete_race(&self, id: Uuid, outcome: RaceOutcome) -> Result<Uuid> {
        let now = Utc::now();
        let mut requests = self.inner.race_requests.write();
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| StablehandError::not_found("RaceRequest", id))?;
        if request.status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                request.status,
                "a non-terminal status",
            ));
        }

        let run_id = Uuid::new_v4();
        self.inner.race_runs.write().push(RaceRun {
            id: run_id,
            race_id: outcome.race_id,
            created_date: now,
        });
        {
            let mut ticks = self.inner.race_run_ticks.write();
            for tick in &outcome.ticks {
                ticks.push(RaceRunTick {
                    run_id,
                    tick: tick.tick,
                    horse_id: tick.horse_id,
                    distance: tick.distance,
                });
            }
        }
        {
            let mut placements = self.inner.race_run_horses.write();
            let mut horses = self.inner.horses.write();
            for placement in &outcome.placements {
                placements.push(RaceRunHorse {
                    run_id,
                    horse_id: placement.horse_id,
                    placement: placement.placement,
                    finish_ticks: placement.finish_ticks,
                    payout: placement.payout,
                });
                if placement.horse_id == outcome.requester {
                    if let Some(horse) = horses.get_mut(&placement.horse_id) {
                        horse.race_starts += 1;
                        if placement.placement == 1 {
                            horse.race_wins += 1;
                        }
                        horse.earnings += placement.payout;
                        horse.has_trained_since_last_race = false;
                        horse.updated_date = now;
                    }
                }
            }
        }

        request.status = RequestStatus::Completed;
        request.race_run_id = Some(run_id);
        request.processed_date = Some(now);
        request.updated_date = now;
        Ok(run_id)
    }
}
