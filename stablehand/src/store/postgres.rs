//! PostgreSQL implementation of the store traits.
//!
//! Uses runtime-bound queries against the migrated schema. The four request
//! tables share the same lifecycle columns, so the lifecycle operations are
//! written once against a table name selected by [`ServiceType`]; completion
//! operations run their side effects and the status flip in one transaction
//! with the request row locked first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{
    Color, FeedResponse, Feeding, Horse, HorseStatistic, LegType, NewFoal, Race, StatisticType,
    Training,
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

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a horse with its statistics. Horse creation is owned by the
    /// front-end API; this exists for seeding and tests.
    pub async fn insert_horse(&self, horse: &Horse, statistics: &[HorseStatistic]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO horses \
             (id, name, sex, leg_type, color_id, owner_id, sire_id, dam_id, happiness, \
              parented, race_starts, race_wins, earnings, has_trained_since_last_race, \
              created_date, updated_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(horse.id)
        .bind(&horse.name)
        .bind(horse.sex.as_i16())
        .bind(horse.leg_type.as_i16())
        .bind(horse.color_id)
        .bind(horse.owner_id)
        .bind(horse.sire_id)
        .bind(horse.dam_id)
        .bind(horse.happiness)
        .bind(horse.parented)
        .bind(horse.race_starts)
        .bind(horse.race_wins)
        .bind(horse.earnings)
        .bind(horse.has_trained_since_last_race)
        .bind(horse.created_date)
        .bind(horse.updated_date)
        .execute(&mut *tx)
        .await?;
        for statistic in statistics {
            sqlx::query(
                "INSERT INTO horse_statistics \
                 (horse_id, statistic, dominant_potential, recessive_potential, actual) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(statistic.horse_id)
            .bind(statistic.statistic.as_i16())
            .bind(statistic.dominant_potential)
            .bind(statistic.recessive_potential)
            .bind(statistic.actual)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn request_table(service: ServiceType) -> &'static str {
    match service {
        ServiceType::Breeding => "breeding_requests",
        ServiceType::Feeding => "feeding_requests",
        ServiceType::Training => "training_requests",
        ServiceType::Racing => "race_requests",
    }
}

#[derive(FromRow)]
struct HeadRow {
    status: i16,
    failure_reason: Option<String>,
}

#[derive(FromRow)]
struct HorseRow {
    id: Uuid,
    name: String,
    sex: i16,
    leg_type: i16,
    color_id: i16,
    owner_id: Uuid,
    sire_id: Option<Uuid>,
    dam_id: Option<Uuid>,
    happiness: i16,
    parented: i32,
    race_starts: i32,
    race_wins: i32,
    earnings: i64,
    has_trained_since_last_race: bool,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
}

impl From<HorseRow> for Horse {
    fn from(row: HorseRow) -> Self {
        Horse {
            id: row.id,
            name: row.name,
            sex: crate::domain::HorseSex::from_i16(row.sex),
            leg_type: LegType::from_i16(row.leg_type),
            color_id: row.color_id,
            owner_id: row.owner_id,
            sire_id: row.sire_id,
            dam_id: row.dam_id,
            happiness: row.happiness,
            parented: row.parented,
            race_starts: row.race_starts,
            race_wins: row.race_wins,
            earnings: row.earnings,
            has_trained_since_last_race: row.has_trained_since_last_race,
            created_date: row.created_date,
            updated_date: row.updated_date,
        }
    }
}

const HORSE_COLUMNS: &str = "id, name, sex, leg_type, color_id, owner_id, sire_id, dam_id, \
     happiness, parented, race_starts, race_wins, earnings, has_trained_since_last_race, \
     created_date, updated_date";

#[derive(FromRow)]
struct StatisticRow {
    horse_id: Uuid,
    statistic: i16,
    dominant_potential: i16,
    recessive_potential: i16,
    actual: i16,
}

impl From<StatisticRow> for HorseStatistic {
    fn from(row: StatisticRow) -> Self {
        HorseStatistic {
            horse_id: row.horse_id,
            statistic: StatisticType::from_i16(row.statistic),
            dominant_potential: row.dominant_potential,
            recessive_potential: row.recessive_potential,
            actual: row.actual,
        }
    }
}

#[derive(FromRow)]
struct BreedingRequestRow {
    request_id: Uuid,
    sire_id: Uuid,
    dam_id: Uuid,
    owner_id: Uuid,
    foal_id: Option<Uuid>,
    status: i16,
    failure_reason: Option<String>,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    processed_date: Option<DateTime<Utc>>,
}

impl From<BreedingRequestRow> for BreedingRequest {
    fn from(row: BreedingRequestRow) -> Self {
        BreedingRequest {
            request_id: row.request_id,
            sire_id: row.sire_id,
            dam_id: row.dam_id,
            owner_id: row.owner_id,
            foal_id: row.foal_id,
            status: RequestStatus::from_i16(row.status),
            failure_reason: row.failure_reason,
            created_date: row.created_date,
            updated_date: row.updated_date,
            processed_date: row.processed_date,
        }
    }
}

#[derive(FromRow)]
struct FeedingRequestRow {
    request_id: Uuid,
    horse_id: Uuid,
    feeding_id: i16,
    session_id: Uuid,
    user_id: Uuid,
    feeding_session_id: Option<Uuid>,
    status: i16,
    failure_reason: Option<String>,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    processed_date: Option<DateTime<Utc>>,
}

impl From<FeedingRequestRow> for FeedingRequest {
    fn from(row: FeedingRequestRow) -> Self {
        FeedingRequest {
            request_id: row.request_id,
            horse_id: row.horse_id,
            feeding_id: row.feeding_id,
            session_id: row.session_id,
            user_id: row.user_id,
            feeding_session_id: row.feeding_session_id,
            status: RequestStatus::from_i16(row.status),
            failure_reason: row.failure_reason,
            created_date: row.created_date,
            updated_date: row.updated_date,
            processed_date: row.processed_date,
        }
    }
}

#[derive(FromRow)]
struct TrainingRequestRow {
    request_id: Uuid,
    horse_id: Uuid,
    training_id: i16,
    session_id: Uuid,
    user_id: Uuid,
    training_session_id: Option<Uuid>,
    status: i16,
    failure_reason: Option<String>,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    processed_date: Option<DateTime<Utc>>,
}

impl From<TrainingRequestRow> for TrainingRequest {
    fn from(row: TrainingRequestRow) -> Self {
        TrainingRequest {
            request_id: row.request_id,
            horse_id: row.horse_id,
            training_id: row.training_id,
            session_id: row.session_id,
            user_id: row.user_id,
            training_session_id: row.training_session_id,
            status: RequestStatus::from_i16(row.status),
            failure_reason: row.failure_reason,
            created_date: row.created_date,
            updated_date: row.updated_date,
            processed_date: row.processed_date,
        }
    }
}

#[derive(FromRow)]
struct RaceRequestRow {
    request_id: Uuid,
    race_id: i16,
    horse_id: Uuid,
    owner_id: Uuid,
    race_run_id: Option<Uuid>,
    status: i16,
    failure_reason: Option<String>,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    processed_date: Option<DateTime<Utc>>,
}

impl From<RaceRequestRow> for RaceRequest {
    fn from(row: RaceRequestRow) -> Self {
        RaceRequest {
            request_id: row.request_id,
            race_id: row.race_id,
            horse_id: row.horse_id,
            owner_id: row.owner_id,
            race_run_id: row.race_run_id,
            status: RequestStatus::from_i16(row.status),
            failure_reason: row.failure_reason,
            created_date: row.created_date,
            updated_date: row.updated_date,
            processed_date: row.processed_date,
        }
    }
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn head(&self, service: ServiceType, id: Uuid) -> Result<Option<RequestHead>> {
        let sql = format!(
            "SELECT status, failure_reason FROM {} WHERE request_id = $1",
            request_table(service)
        );
        let row = sqlx::query_as::<_, HeadRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RequestHead {
            status: RequestStatus::from_i16(r.status),
            failure_reason: r.failure_reason,
        }))
    }

    async fn claim(&self, service: ServiceType, id: Uuid) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET status = $2, updated_date = $3 \
             WHERE request_id = $1 AND status IN ($4, $5)",
            request_table(service)
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(RequestStatus::InProgress.as_i16())
            .bind(Utc::now())
            .bind(RequestStatus::Pending.as_i16())
            .bind(RequestStatus::Failed.as_i16())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, service: ServiceType, id: Uuid, reason: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = $2, failure_reason = $3, processed_date = $4, \
             updated_date = $4 WHERE request_id = $1",
            request_table(service)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(RequestStatus::Failed.as_i16())
            .bind(reason)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn annotate_publish_failure(
        &self,
        service: ServiceType,
        id: Uuid,
        reason: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET failure_reason = $2, updated_date = $3 WHERE request_id = $1",
            request_table(service)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(reason)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_publish_failure(&self, service: ServiceType, id: Uuid) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET failure_reason = NULL, updated_date = $2 WHERE request_id = $1",
            request_table(service)
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_stuck_in_progress(
        &self,
        service: ServiceType,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = $1, updated_date = $2 \
             WHERE status = $3 AND updated_date < $4",
            request_table(service)
        );
        let result = sqlx::query(&sql)
            .bind(RequestStatus::Pending.as_i16())
            .bind(Utc::now())
            .bind(RequestStatus::InProgress.as_i16())
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl HorseStore for PostgresStore {
    async fn horse(&self, id: Uuid) -> Result<Option<Horse>> {
        let sql = format!("SELECT {HORSE_COLUMNS} FROM horses WHERE id = $1");
        let row = sqlx::query_as::<_, HorseRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Horse::from))
    }

    async fn statistics(&self, horse_id: Uuid) -> Result<Vec<HorseStatistic>> {
        let rows = sqlx::query_as::<_, StatisticRow>(
            "SELECT horse_id, statistic, dominant_potential, recessive_potential, actual \
             FROM horse_statistics WHERE horse_id = $1",
        )
        .bind(horse_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HorseStatistic::from).collect())
    }

    async fn colors(&self) -> Result<Vec<Color>> {
        #[derive(FromRow)]
        struct ColorRow {
            id: i16,
            name: String,
            weight: i32,
            is_special: bool,
        }
        let rows = sqlx::query_as::<_, ColorRow>(
            "SELECT id, name, weight, is_special FROM colors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| Color {
                id: r.id,
                name: r.name,
                weight: r.weight,
                is_special: r.is_special,
            })
            .collect())
    }

    async fn feeding(&self, id: i16) -> Result<Option<Feeding>> {
        #[derive(FromRow)]
        struct FeedingRow {
            id: i16,
            name: String,
            happiness_effect: i16,
        }
        let row = sqlx::query_as::<_, FeedingRow>(
            "SELECT id, name, happiness_effect FROM feedings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Feeding {
            id: r.id,
            name: r.name,
            happiness_effect: r.happiness_effect,
        }))
    }

    async fn feeding_preference(
        &self,
        horse_id: Uuid,
        feeding_id: i16,
    ) -> Result<Option<FeedResponse>> {
        let response: Option<i16> = sqlx::query_scalar(
            "SELECT response FROM horse_feeding_preferences \
             WHERE horse_id = $1 AND feeding_id = $2",
        )
        .bind(horse_id)
        .bind(feeding_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(response.map(FeedResponse::from_i16))
    }

    async fn training(&self, id: i16) -> Result<Option<Training>> {
        #[derive(FromRow)]
        struct TrainingRow {
            id: i16,
            name: String,
            statistic: i16,
            intensity: f64,
            happiness_cost: i16,
        }
        let row = sqlx::query_as::<_, TrainingRow>(
            "SELECT id, name, statistic, intensity, happiness_cost FROM trainings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Training {
            id: r.id,
            name: r.name,
            statistic: StatisticType::from_i16(r.statistic),
            intensity: r.intensity,
            happiness_cost: r.happiness_cost,
        }))
    }

    async fn race(&self, id: i16) -> Result<Option<Race>> {
        #[derive(FromRow)]
        struct RaceRow {
            id: i16,
            name: String,
            distance_m: i32,
            purse: i64,
        }
        let row = sqlx::query_as::<_, RaceRow>(
            "SELECT id, name, distance_m, purse FROM races WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Race {
            id: r.id,
            name: r.name,
            distance_m: r.distance_m,
            purse: r.purse,
        }))
    }

    async fn race_field_fill(
        &self,
        limit: usize,
        exclude: Uuid,
    ) -> Result<Vec<(Horse, Vec<HorseStatistic>)>> {
        let sql = format!(
            "SELECT {HORSE_COLUMNS} FROM horses WHERE id <> $1 ORDER BY race_starts DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, HorseRow>(&sql)
            .bind(exclude)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut field = Vec::with_capacity(rows.len());
        for row in rows {
            let horse = Horse::from(row);
            let statistics = self.statistics(horse.id).await?;
            field.push((horse, statistics));
        }
        Ok(field)
    }
}

#[async_trait]
impl BreedingStore for PostgresStore {
    async fn insert_breeding_request(&self, request: &BreedingRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO breeding_requests \
             (request_id, sire_id, dam_id, owner_id, foal_id, status, failure_reason, \
              created_date, updated_date, processed_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(request.request_id)
        .bind(request.sire_id)
        .bind(request.dam_id)
        .bind(request.owner_id)
        .bind(request.foal_id)
        .bind(request.status.as_i16())
        .bind(&request.failure_reason)
        .bind(request.created_date)
        .bind(request.updated_date)
        .bind(request.processed_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn breeding_request(&self, id: Uuid) -> Result<Option<BreedingRequest>> {
        let row = sqlx::query_as::<_, BreedingRequestRow>(
            "SELECT * FROM breeding_requests WHERE request_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BreedingRequest::from))
    }

    async fn breeding_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<BreedingRequest>> {
        let codes: Vec<i16> = statuses.iter().map(|s| s.as_i16()).collect();
        let rows = sqlx::query_as::<_, BreedingRequestRow>(
            "SELECT * FROM breeding_requests WHERE status = ANY($1)",
        )
        .bind(&codes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BreedingRequest::from).collect())
    }

    async fn complete_breeding(&self, id: Uuid, foal: NewFoal) -> Result<Uuid> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<i16> = sqlx::query_scalar(
            "SELECT status FROM breeding_requests WHERE request_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let status = status
            .map(RequestStatus::from_i16)
            .ok_or_else(|| StablehandError::not_found("BreedingRequest", id))?;
        if status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                status,
                "a non-terminal status",
            ));
        }

        let foal_id = Uuid::new_v4();
        let happiness = foal
            .statistics
            .iter()
            .find(|s| s.statistic == StatisticType::Happiness)
            .map(|s| s.actual)
            .unwrap_or(50);
        sqlx::query(
            "INSERT INTO horses \
             (id, name, sex, leg_type, color_id, owner_id, sire_id, dam_id, happiness, \
              parented, race_starts, race_wins, earnings, has_trained_since_last_race, \
              created_date, updated_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, 0, 0, FALSE, $10, $10)",
        )
        .bind(foal_id)
        .bind(&foal.name)
        .bind(foal.sex.as_i16())
        .bind(foal.leg_type.as_i16())
        .bind(foal.color_id)
        .bind(foal.owner_id)
        .bind(foal.sire_id)
        .bind(foal.dam_id)
        .bind(happiness)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for statistic in &foal.statistics {
            sqlx::query(
                "INSERT INTO horse_statistics \
                 (horse_id, statistic, dominant_potential, recessive_potential, actual) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(foal_id)
            .bind(statistic.statistic.as_i16())
            .bind(statistic.dominant_potential)
            .bind(statistic.recessive_potential)
            .bind(statistic.actual)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE horses SET parented = parented + 1, updated_date = $2 WHERE id = ANY($1)",
        )
        .bind(vec![foal.sire_id, foal.dam_id])
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE breeding_requests SET status = $2, foal_id = $3, processed_date = $4, \
             updated_date = $4 WHERE request_id = $1",
        )
        .bind(id)
        .bind(RequestStatus::Completed.as_i16())
        .bind(foal_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(foal_id)
    }
}

#[async_trait]
impl FeedingStore for PostgresStore {
    async fn insert_feeding_request(&self, request: &FeedingRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO feeding_requests \
             (request_id, horse_id, feeding_id, session_id, user_id, feeding_session_id, \
              status, failure_reason, created_date, updated_date, processed_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(request.request_id)
        .bind(request.horse_id)
        .bind(request.feeding_id)
        .bind(request.session_id)
        .bind(request.user_id)
        .bind(request.feeding_session_id)
        .bind(request.status.as_i16())
        .bind(&request.failure_reason)
        .bind(request.created_date)
        .bind(request.updated_date)
        .bind(request.processed_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn feeding_request(&self, id: Uuid) -> Result<Option<FeedingRequest>> {
        let row = sqlx::query_as::<_, FeedingRequestRow>(
            "SELECT * FROM feeding_requests WHERE request_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedingRequest::from))
    }

    async fn feeding_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<FeedingRequest>> {
        let codes: Vec<i16> = statuses.iter().map(|s| s.as_i16()).collect();
        let rows = sqlx::query_as::<_, FeedingRequestRow>(
            "SELECT * FROM feeding_requests WHERE status = ANY($1)",
        )
        .bind(&codes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedingRequest::from).collect())
    }

    async fn complete_feeding(&self, id: Uuid, outcome: FeedingOutcome) -> Result<Uuid> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<i16> = sqlx::query_scalar(
            "SELECT status FROM feeding_requests WHERE request_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let status = status
            .map(RequestStatus::from_i16)
            .ok_or_else(|| StablehandError::not_found("FeedingRequest", id))?;
        if status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                status,
                "a non-terminal status",
            ));
        }

        let session_row_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO feeding_sessions \
             (id, session_id, horse_id, feeding_id, user_id, response, happiness_delta, \
              created_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(session_row_id)
        .bind(outcome.session_id)
        .bind(outcome.horse_id)
        .bind(outcome.feeding_id)
        .bind(outcome.user_id)
        .bind(outcome.response.as_i16())
        .bind(outcome.happiness_delta)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if outcome.record_preference {
            sqlx::query(
                "INSERT INTO horse_feeding_preferences (horse_id, feeding_id, response) \
                 VALUES ($1, $2, $3) ON CONFLICT (horse_id, feeding_id) DO NOTHING",
            )
            .bind(outcome.horse_id)
            .bind(outcome.feeding_id)
            .bind(outcome.response.as_i16())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE horses SET happiness = $2, updated_date = $3 WHERE id = $1")
            .bind(outcome.horse_id)
            .bind(outcome.new_happiness)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE feeding_requests SET status = $2, feeding_session_id = $3, \
             processed_date = $4, updated_date = $4 WHERE request_id = $1",
        )
        .bind(id)
        .bind(RequestStatus::Completed.as_i16())
        .bind(session_row_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session_row_id)
    }
}

#[async_trait]
impl TrainingStore for PostgresStore {
    async fn insert_training_request(&self, request: &TrainingRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO training_requests \
             (request_id, horse_id, training_id, session_id, user_id, training_session_id, \
              status, failure_reason, created_date, updated_date, processed_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(request.request_id)
        .bind(request.horse_id)
        .bind(request.training_id)
        .bind(request.session_id)
        .bind(request.user_id)
        .bind(request.training_session_id)
        .bind(request.status.as_i16())
        .bind(&request.failure_reason)
        .bind(request.created_date)
        .bind(request.updated_date)
        .bind(request.processed_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn training_request(&self, id: Uuid) -> Result<Option<TrainingRequest>> {
        let row = sqlx::query_as::<_, TrainingRequestRow>(
            "SELECT * FROM training_requests WHERE request_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TrainingRequest::from))
    }

    async fn training_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<TrainingRequest>> {
        let codes: Vec<i16> = statuses.iter().map(|s| s.as_i16()).collect();
        let rows = sqlx::query_as::<_, TrainingRequestRow>(
            "SELECT * FROM training_requests WHERE status = ANY($1)",
        )
        .bind(&codes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TrainingRequest::from).collect())
    }

    async fn complete_training(&self, id: Uuid, outcome: TrainingOutcome) -> Result<Uuid> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<i16> = sqlx::query_scalar(
            "SELECT status FROM training_requests WHERE request_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let status = status
            .map(RequestStatus::from_i16)
            .ok_or_else(|| StablehandError::not_found("TrainingRequest", id))?;
        if status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                status,
                "a non-terminal status",
            ));
        }

        let session_row_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO training_sessions \
             (id, session_id, horse_id, training_id, user_id, statistic, gain, overworked, \
              created_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(session_row_id)
        .bind(outcome.session_id)
        .bind(outcome.horse_id)
        .bind(outcome.training_id)
        .bind(outcome.user_id)
        .bind(outcome.statistic.as_i16())
        .bind(outcome.gain)
        .bind(outcome.overworked)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE horses SET happiness = $2, has_trained_since_last_race = TRUE, \
             updated_date = $3 WHERE id = $1",
        )
        .bind(outcome.horse_id)
        .bind(outcome.new_happiness)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE horse_statistics SET actual = $3 WHERE horse_id = $1 AND statistic = $2",
        )
        .bind(outcome.horse_id)
        .bind(outcome.statistic.as_i16())
        .bind(outcome.new_actual)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE training_requests SET status = $2, training_session_id = $3, \
             processed_date = $4, updated_date = $4 WHERE request_id = $1",
        )
        .bind(id)
        .bind(RequestStatus::Completed.as_i16())
        .bind(session_row_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session_row_id)
    }
}

#[async_trait]
impl RacingStore for PostgresStore {
    async fn insert_race_request(&self, request: &RaceRequest) -> Result<()> {
        sqlx::query(
            "INSERT INTO race_requests \
             (request_id, race_id, horse_id, owner_id, race_run_id, status, failure_reason, \
              created_date, updated_date, processed_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(request.request_id)
        .bind(request.race_id)
        .bind(request.horse_id)
        .bind(request.owner_id)
        .bind(request.race_run_id)
        .bind(request.status.as_i16())
        .bind(&request.failure_reason)
        .bind(request.created_date)
        .bind(request.updated_date)
        .bind(request.processed_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn race_request(&self, id: Uuid) -> Result<Option<RaceRequest>> {
        let row = sqlx::query_as::<_, RaceRequestRow>(
            "SELECT * FROM race_requests WHERE request_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RaceRequest::from))
    }

    async fn race_requests_with_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RaceRequest>> {
        let codes: Vec<i16> = statuses.iter().map(|s| s.as_i16()).collect();
        let rows = sqlx::query_as::<_, RaceRequestRow>(
            "SELECT * FROM race_requests WHERE status = ANY($1)",
        )
        .bind(&codes)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RaceRequest::from).collect())
    }

    async fn complete_race(&self, id: Uuid, outcome: RaceOutcome) -> Result<Uuid> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<i16> = sqlx::query_scalar(
            "SELECT status FROM race_requests WHERE request_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let status = status
            .map(RequestStatus::from_i16)
            .ok_or_else(|| StablehandError::not_found("RaceRequest", id))?;
        if status == RequestStatus::Completed {
            return Err(StablehandError::InvalidState(
                id,
                status,
                "a non-terminal status",
            ));
        }

        let run_id = Uuid::new_v4();
        sqlx::query("INSERT INTO race_runs (id, race_id, created_date) VALUES ($1, $2, $3)")
            .bind(run_id)
            .bind(outcome.race_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        for tick in &outcome.ticks {
            sqlx::query(
                "INSERT INTO race_run_ticks (run_id, tick, horse_id, distance) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(run_id)
            .bind(tick.tick)
            .bind(tick.horse_id)
            .bind(tick.distance)
            .execute(&mut *tx)
            .await?;
        }

        for placement in &outcome.placements {
            sqlx::query(
                "INSERT INTO race_run_horses (run_id, horse_id, placement, finish_ticks, payout) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(run_id)
            .bind(placement.horse_id)
            .bind(placement.placement)
            .bind(placement.finish_ticks)
            .bind(placement.payout)
            .execute(&mut *tx)
            .await?;

            if placement.horse_id == outcome.requester {
                sqlx::query(
                    "UPDATE horses SET race_starts = race_starts + 1, \
                     race_wins = race_wins + CASE WHEN $2 = 1 THEN 1 ELSE 0 END, \
                     earnings = earnings + $3, has_trained_since_last_race = FALSE, \
                     updated_date = $4 WHERE id = $1",
                )
                .bind(placement.horse_id)
                .bind(placement.placement as i32)
                .bind(placement.payout)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            "UPDATE race_requests SET status = $2, race_run_id = $3, processed_date = $4, \
             updated_date = $4 WHERE request_id = $1",
        )
        .bind(id)
        .bind(RequestStatus::Completed.as_i16())
        .bind(run_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run_id)
    }
}
