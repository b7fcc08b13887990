//! Wire messages: one `*Requested` / `*Completed` pair per domain.
//!
//! Bodies are camelCase JSON; PascalCase field names are accepted on the
//! consumer side for compatibility with producers that serialize with
//! .NET-style casing. Every message carries its own `request_id`, which is
//! both the correlation key and the idempotency token.

use chrono::{DateTime, Utc};
use furlong::BusMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreedingRequested {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "SireId")]
    pub sire_id: Uuid,
    #[serde(alias = "DamId")]
    pub dam_id: Uuid,
    #[serde(alias = "OwnerId")]
    pub owner_id: Uuid,
}

impl BusMessage for BreedingRequested {
    const NAME: &'static str = "BreedingRequested";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreedingCompleted {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "SireId")]
    pub sire_id: Uuid,
    #[serde(alias = "DamId")]
    pub dam_id: Uuid,
    #[serde(alias = "FoalId")]
    pub foal_id: Uuid,
    #[serde(alias = "OwnerId")]
    pub owner_id: Uuid,
    #[serde(alias = "CompletedAt")]
    pub completed_at: DateTime<Utc>,
}

impl BusMessage for BreedingCompleted {
    const NAME: &'static str = "BreedingCompleted";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedingRequested {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "HorseId")]
    pub horse_id: Uuid,
    #[serde(alias = "FeedingId")]
    pub feeding_id: u8,
    #[serde(alias = "SessionId")]
    pub session_id: Uuid,
    #[serde(alias = "UserId")]
    pub user_id: Uuid,
}

impl BusMessage for FeedingRequested {
    const NAME: &'static str = "FeedingRequested";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedingCompleted {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "HorseId")]
    pub horse_id: Uuid,
    #[serde(alias = "FeedingId")]
    pub feeding_id: u8,
    #[serde(alias = "SessionId")]
    pub session_id: Uuid,
    #[serde(alias = "FeedingSessionId")]
    pub feeding_session_id: Uuid,
    #[serde(alias = "UserId")]
    pub user_id: Uuid,
    #[serde(alias = "CompletedAt")]
    pub completed_at: DateTime<Utc>,
}

impl BusMessage for FeedingCompleted {
    const NAME: &'static str = "FeedingCompleted";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRequested {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "HorseId")]
    pub horse_id: Uuid,
    #[serde(alias = "TrainingId")]
    pub training_id: u8,
    #[serde(alias = "SessionId")]
    pub session_id: Uuid,
    #[serde(alias = "UserId")]
    pub user_id: Uuid,
}

impl BusMessage for TrainingRequested {
    const NAME: &'static str = "TrainingRequested";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingCompleted {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "HorseId")]
    pub horse_id: Uuid,
    #[serde(alias = "TrainingId")]
    pub training_id: u8,
    #[serde(alias = "SessionId")]
    pub session_id: Uuid,
    #[serde(alias = "TrainingSessionId")]
    pub training_session_id: Uuid,
    #[serde(alias = "UserId")]
    pub user_id: Uuid,
    #[serde(alias = "CompletedAt")]
    pub completed_at: DateTime<Utc>,
}

impl BusMessage for TrainingCompleted {
    const NAME: &'static str = "TrainingCompleted";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceRequested {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "RaceId")]
    pub race_id: u8,
    #[serde(alias = "HorseId")]
    pub horse_id: Uuid,
    #[serde(alias = "OwnerId")]
    pub owner_id: Uuid,
}

impl BusMessage for RaceRequested {
    const NAME: &'static str = "RaceRequested";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceCompleted {
    #[serde(alias = "RequestId")]
    pub request_id: Uuid,
    #[serde(alias = "RaceId")]
    pub race_id: u8,
    #[serde(alias = "HorseId")]
    pub horse_id: Uuid,
    #[serde(alias = "RaceRunId")]
    pub race_run_id: Uuid,
    #[serde(alias = "OwnerId")]
    pub owner_id: Uuid,
    #[serde(alias = "CompletedAt")]
    pub completed_at: DateTime<Utc>,
}

impl BusMessage for RaceCompleted {
    const NAME: &'static str = "RaceCompleted";

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.request_id)
    }
}
