//! Request records: one durable row per asynchronous game action.
//!
//! Every domain keeps its own table with the same lifecycle columns. The
//! `request_id` is both the primary key and the idempotency token carried by
//! the originating message; the output pointer stays null until the request
//! completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{BreedingRequested, FeedingRequested, RaceRequested, TrainingRequested};

/// Failure-reason prefix that marks a committed request whose `Completed`
/// event could not be published. The redelivery path recognizes it and
/// republishes the event instead of re-executing.
pub const PUBLISH_FAILED_PREFIX: &str = "Publish failed: ";

/// Lifecycle state of a request row.
///
/// `Pending -> InProgress -> Completed` on the happy path;
/// `Pending | InProgress -> Failed` on errors. A `Failed` row may be revived
/// to `InProgress` by replay; `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::InProgress => 1,
            RequestStatus::Completed => 2,
            RequestStatus::Failed => 3,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => RequestStatus::Pending,
            1 => RequestStatus::InProgress,
            2 => RequestStatus::Completed,
            _ => RequestStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == RequestStatus::Completed
    }
}

/// The domain a request belongs to; selects the backing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Breeding,
    Feeding,
    Racing,
    Training,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Breeding,
        ServiceType::Feeding,
        ServiceType::Racing,
        ServiceType::Training,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServiceType::Breeding => "breeding",
            ServiceType::Feeding => "feeding",
            ServiceType::Racing => "racing",
            ServiceType::Training => "training",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "breeding" => Ok(ServiceType::Breeding),
            "feeding" => Ok(ServiceType::Feeding),
            "racing" | "race" => Ok(ServiceType::Racing),
            "training" => Ok(ServiceType::Training),
            other => Err(format!("unknown service type `{other}`")),
        }
    }
}

/// Status view of a request row, enough for the lifecycle guards.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub status: RequestStatus,
    pub failure_reason: Option<String>,
}

impl RequestHead {
    /// True when the row committed but its `Completed` event never went out.
    pub fn needs_event_republish(&self) -> bool {
        self.status == RequestStatus::Completed
            && self
                .failure_reason
                .as_deref()
                .is_some_and(|reason| reason.starts_with(PUBLISH_FAILED_PREFIX))
    }
}

#[derive(Debug, Clone)]
pub struct BreedingRequest {
    pub request_id: Uuid,
    pub sire_id: Uuid,
    pub dam_id: Uuid,
    pub owner_id: Uuid,
    pub foal_id: Option<Uuid>,
    pub status: RequestStatus,
    pub failure_reason: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl BreedingRequest {
    pub fn new(request_id: Uuid, sire_id: Uuid, dam_id: Uuid, owner_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            sire_id,
            dam_id,
            owner_id,
            foal_id: None,
            status: RequestStatus::Pending,
            failure_reason: None,
            created_date: now,
            updated_date: now,
            processed_date: None,
        }
    }

    /// Reconstruct the originating message for replay.
    pub fn to_requested(&self) -> BreedingRequested {
        BreedingRequested {
            request_id: self.request_id,
            sire_id: self.sire_id,
            dam_id: self.dam_id,
            owner_id: self.owner_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedingRequest {
    pub request_id: Uuid,
    pub horse_id: Uuid,
    pub feeding_id: i16,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub feeding_session_id: Option<Uuid>,
    pub status: RequestStatus,
    pub failure_reason: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl FeedingRequest {
    pub fn new(
        request_id: Uuid,
        horse_id: Uuid,
        feeding_id: i16,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            horse_id,
            feeding_id,
            session_id,
            user_id,
            feeding_session_id: None,
            status: RequestStatus::Pending,
            failure_reason: None,
            created_date: now,
            updated_date: now,
            processed_date: None,
        }
    }

    pub fn to_requested(&self) -> FeedingRequested {
        FeedingRequested {
            request_id: self.request_id,
            horse_id: self.horse_id,
            feeding_id: self.feeding_id.clamp(0, u8::MAX as i16) as u8,
            session_id: self.session_id,
            user_id: self.user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub request_id: Uuid,
    pub horse_id: Uuid,
    pub training_id: i16,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub training_session_id: Option<Uuid>,
    pub status: RequestStatus,
    pub failure_reason: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl TrainingRequest {
    pub fn new(
        request_id: Uuid,
        horse_id: Uuid,
        training_id: i16,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            horse_id,
            training_id,
            session_id,
            user_id,
            training_session_id: None,
            status: RequestStatus::Pending,
            failure_reason: None,
            created_date: now,
            updated_date: now,
            processed_date: None,
        }
    }

    pub fn to_requested(&self) -> TrainingRequested {
        TrainingRequested {
            request_id: self.request_id,
            horse_id: self.horse_id,
            training_id: self.training_id.clamp(0, u8::MAX as i16) as u8,
            session_id: self.session_id,
            user_id: self.user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RaceRequest {
    pub request_id: Uuid,
    pub race_id: i16,
    pub horse_id: Uuid,
    pub owner_id: Uuid,
    pub race_run_id: Option<Uuid>,
    pub status: RequestStatus,
    pub failure_reason: Option<String>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub processed_date: Option<DateTime<Utc>>,
}

impl RaceRequest {
    pub fn new(request_id: Uuid, race_id: i16, horse_id: Uuid, owner_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            race_id,
            horse_id,
            owner_id,
            race_run_id: None,
            status: RequestStatus::Pending,
            failure_reason: None,
            created_date: now,
            updated_date: now,
            processed_date: None,
        }
    }

    pub fn to_requested(&self) -> RaceRequested {
        RaceRequested {
            request_id: self.request_id,
            race_id: self.race_id.clamp(0, u8::MAX as i16) as u8,
            horse_id: self.horse_id,
            owner_id: self.owner_id,
        }
    }
}
