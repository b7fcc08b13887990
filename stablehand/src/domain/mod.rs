//! Game entities touched by the workers.
//!
//! Entities reference each other by id only; navigation goes through the
//! store. Catalog rows (colors, feedings, trainings, races) use small
//! integer ids and are seeded by migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sex of a horse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorseSex {
    Stallion,
    Mare,
}

impl HorseSex {
    pub fn as_i16(self) -> i16 {
        match self {
            HorseSex::Stallion => 0,
            HorseSex::Mare => 1,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => HorseSex::Stallion,
            _ => HorseSex::Mare,
        }
    }
}

/// Running style. Affects race pacing and gives a small training bonus on
/// the matching statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegType {
    FrontRunner,
    Stalker,
    Closer,
    DeepCloser,
}

impl LegType {
    pub const ALL: [LegType; 4] = [
        LegType::FrontRunner,
        LegType::Stalker,
        LegType::Closer,
        LegType::DeepCloser,
    ];

    pub fn as_i16(self) -> i16 {
        match self {
            LegType::FrontRunner => 0,
            LegType::Stalker => 1,
            LegType::Closer => 2,
            LegType::DeepCloser => 3,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => LegType::FrontRunner,
            1 => LegType::Stalker,
            2 => LegType::Closer,
            _ => LegType::DeepCloser,
        }
    }

    /// Training bonus for the statistic this style leans on.
    pub fn training_bonus(self, statistic: StatisticType) -> f64 {
        let favored = match self {
            LegType::FrontRunner => StatisticType::Speed,
            LegType::Stalker => StatisticType::Agility,
            LegType::Closer => StatisticType::Stamina,
            LegType::DeepCloser => StatisticType::Durability,
        };
        if favored == statistic { 1.1 } else { 1.0 }
    }

    /// Pace multiplier at a point of the race, `progress` in `[0, 1]`.
    pub fn pace_factor(self, progress: f64) -> f64 {
        match self {
            LegType::FrontRunner => 1.08 - 0.12 * progress,
            LegType::Stalker => 1.0,
            LegType::Closer => 0.94 + 0.12 * progress,
            LegType::DeepCloser => 0.90 + 0.18 * progress,
        }
    }
}

/// The tracked statistics. All but `Happiness` are inherited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticType {
    Speed,
    Stamina,
    Agility,
    Durability,
    Happiness,
}

impl StatisticType {
    pub const ALL: [StatisticType; 5] = [
        StatisticType::Speed,
        StatisticType::Stamina,
        StatisticType::Agility,
        StatisticType::Durability,
        StatisticType::Happiness,
    ];

    /// Statistics a foal inherits from its parents.
    pub const INHERITED: [StatisticType; 4] = [
        StatisticType::Speed,
        StatisticType::Stamina,
        StatisticType::Agility,
        StatisticType::Durability,
    ];

    pub fn as_i16(self) -> i16 {
        match self {
            StatisticType::Speed => 0,
            StatisticType::Stamina => 1,
            StatisticType::Agility => 2,
            StatisticType::Durability => 3,
            StatisticType::Happiness => 4,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => StatisticType::Speed,
            1 => StatisticType::Stamina,
            2 => StatisticType::Agility,
            3 => StatisticType::Durability,
            _ => StatisticType::Happiness,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StatisticType::Speed => "Speed",
            StatisticType::Stamina => "Stamina",
            StatisticType::Agility => "Agility",
            StatisticType::Durability => "Durability",
            StatisticType::Happiness => "Happiness",
        }
    }
}

/// Coat color catalog row. `weight` is rarity: the sampling frequency is
/// `1 / max(1, weight)`, boosted for special colors when parents are special.
#[derive(Debug, Clone, PartialEq)]
pub struct Color {
    pub id: i16,
    pub name: String,
    pub weight: i32,
    pub is_special: bool,
}

/// A horse, foal included.
#[derive(Debug, Clone)]
pub struct Horse {
    pub id: Uuid,
    pub name: String,
    pub sex: HorseSex,
    pub leg_type: LegType,
    pub color_id: i16,
    pub owner_id: Uuid,
    pub sire_id: Option<Uuid>,
    pub dam_id: Option<Uuid>,
    pub happiness: i16,
    /// Foals sired/foaled.
    pub parented: i32,
    pub race_starts: i32,
    pub race_wins: i32,
    pub earnings: i64,
    pub has_trained_since_last_race: bool,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

/// One statistic line of a horse.
#[derive(Debug, Clone)]
pub struct HorseStatistic {
    pub horse_id: Uuid,
    pub statistic: StatisticType,
    pub dominant_potential: i16,
    pub recessive_potential: i16,
    pub actual: i16,
}

/// Statistic values for a foal about to be created.
#[derive(Debug, Clone)]
pub struct NewStatistic {
    pub statistic: StatisticType,
    pub dominant_potential: i16,
    pub recessive_potential: i16,
    pub actual: i16,
}

/// A foal ready to be persisted, career counters zeroed.
#[derive(Debug, Clone)]
pub struct NewFoal {
    pub name: String,
    pub sex: HorseSex,
    pub leg_type: LegType,
    pub color_id: i16,
    pub owner_id: Uuid,
    pub sire_id: Uuid,
    pub dam_id: Uuid,
    pub statistics: Vec<NewStatistic>,
}

/// Feed catalog row.
#[derive(Debug, Clone)]
pub struct Feeding {
    pub id: i16,
    pub name: String,
    /// Base happiness effect, scaled by the horse's response tier.
    pub happiness_effect: i16,
}

/// How much a horse likes a feed. Sampled the first time the horse tastes
/// it, then fixed for life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedResponse {
    Loved,
    Liked,
    Neutral,
    Disliked,
}

impl FeedResponse {
    pub const ALL: [FeedResponse; 4] = [
        FeedResponse::Loved,
        FeedResponse::Liked,
        FeedResponse::Neutral,
        FeedResponse::Disliked,
    ];

    pub fn as_i16(self) -> i16 {
        match self {
            FeedResponse::Loved => 0,
            FeedResponse::Liked => 1,
            FeedResponse::Neutral => 2,
            FeedResponse::Disliked => 3,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => FeedResponse::Loved,
            1 => FeedResponse::Liked,
            2 => FeedResponse::Neutral,
            _ => FeedResponse::Disliked,
        }
    }

    /// Multiplier applied to the feed's base happiness effect.
    pub fn multiplier(self) -> f64 {
        match self {
            FeedResponse::Loved => 2.0,
            FeedResponse::Liked => 1.5,
            FeedResponse::Neutral => 1.0,
            FeedResponse::Disliked => -0.5,
        }
    }
}

/// Persisted record of one feeding.
#[derive(Debug, Clone)]
pub struct FeedingSession {
    pub id: Uuid,
    /// Client session id from the request; unique, the second idempotency layer.
    pub session_id: Uuid,
    pub horse_id: Uuid,
    pub feeding_id: i16,
    pub user_id: Uuid,
    pub response: FeedResponse,
    pub happiness_delta: i16,
    pub created_date: DateTime<Utc>,
}

/// Training catalog row.
#[derive(Debug, Clone)]
pub struct Training {
    pub id: i16,
    pub name: String,
    pub statistic: StatisticType,
    /// Fraction of the potential gap gained per session.
    pub intensity: f64,
    pub happiness_cost: i16,
}

/// Persisted record of one training session.
#[derive(Debug, Clone)]
pub struct TrainingSession {
    pub id: Uuid,
    pub session_id: Uuid,
    pub horse_id: Uuid,
    pub training_id: i16,
    pub user_id: Uuid,
    pub statistic: StatisticType,
    pub gain: i16,
    pub overworked: bool,
    pub created_date: DateTime<Utc>,
}

/// Race catalog row.
#[derive(Debug, Clone)]
pub struct Race {
    pub id: i16,
    pub name: String,
    pub distance_m: i32,
    pub purse: i64,
}

/// One simulated running of a race.
#[derive(Debug, Clone)]
pub struct RaceRun {
    pub id: Uuid,
    pub race_id: i16,
    pub created_date: DateTime<Utc>,
}

/// Final placement of one horse in a run.
#[derive(Debug, Clone)]
pub struct RaceRunHorse {
    pub run_id: Uuid,
    pub horse_id: Uuid,
    pub placement: i16,
    pub finish_ticks: i32,
    pub payout: i64,
}

/// Distance covered by one horse at one simulation tick.
#[derive(Debug, Clone)]
pub struct RaceRunTick {
    pub run_id: Uuid,
    pub tick: i32,
    pub horse_id: Uuid,
    pub distance: f64,
}
