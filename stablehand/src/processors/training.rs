//! Training: raise one statistic toward its potential.
//!
//! Eligibility: a horse trains at most once between races, and not below the
//! happiness floor. The gain closes a fraction of the potential gap, scaled
//! by career phase, happiness, and a leg-type affinity, clamped at the
//! potential. Training costs happiness; a tired horse risks an overwork
//! roll that halves the session's gain.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use furlong::MessageContext;
use rand::Rng;
use uuid::Uuid;

use crate::domain::{Horse, HorseStatistic, Training};
use crate::error::{Result, StablehandError};
use crate::lifecycle::DomainWork;
use crate::messages::{TrainingCompleted, TrainingRequested};
use crate::requests::ServiceType;
use crate::store::{Store, TrainingOutcome};

const HAPPINESS_FLOOR: i16 = 20;

fn career_phase_multiplier(race_starts: i32) -> f64 {
    match race_starts {
        0..=4 => 1.2,
        5..=19 => 1.0,
        _ => 0.8,
    }
}

fn happiness_modifier(happiness: i16) -> f64 {
    0.5 + f64::from(happiness) / 200.0
}

/// Overwork chance in percent after the happiness cost is paid.
fn overwork_chance(happiness_after: i16) -> i16 {
    if happiness_after < 30 {
        30 - happiness_after
    } else {
        0
    }
}

struct SessionPlan {
    gain: i16,
    new_actual: i16,
    new_happiness: i16,
    overworked: bool,
}

fn plan_session<R: Rng>(
    rng: &mut R,
    horse: &Horse,
    statistic: &HorseStatistic,
    training: &Training,
) -> SessionPlan {
    let gap = f64::from(statistic.dominant_potential - statistic.actual);
    let raw_gain = gap
        * training.intensity
        * career_phase_multiplier(horse.race_starts)
        * happiness_modifier(horse.happiness)
        * horse.leg_type.training_bonus(training.statistic);
    let mut gain = (raw_gain.round() as i16).max(0);

    let mut new_happiness = (horse.happiness - training.happiness_cost).max(0);
    let chance = overwork_chance(new_happiness);
    let overworked = chance > 0 && rng.random_range(1..=100) <= chance;
    if overworked {
        gain /= 2;
        new_happiness = (new_happiness - 5).max(0);
    }

    let new_actual = (statistic.actual + gain).min(statistic.dominant_potential);
    SessionPlan {
        gain: new_actual - statistic.actual,
        new_actual,
        new_happiness,
        overworked,
    }
}

/// Training domain processor.
pub struct TrainingProcessor<S> {
    store: Arc<S>,
}

impl<S> TrainingProcessor<S>
where
    S: Store,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> DomainWork for TrainingProcessor<S>
where
    S: Store + 'static,
{
    type Message = TrainingRequested;
    type Event = TrainingCompleted;

    const SERVICE: ServiceType = ServiceType::Training;

    fn request_id(message: &Self::Message) -> Uuid {
        message.request_id
    }

    async fn execute(
        &self,
        message: &Self::Message,
        ctx: &MessageContext,
    ) -> Result<Self::Event> {
        let horse = self
            .store
            .horse(message.horse_id)
            .await?
            .ok_or_else(|| StablehandError::not_found("Horse", message.horse_id))?;
        let training_id = i16::from(message.training_id);
        let training = self
            .store
            .training(training_id)
            .await?
            .ok_or_else(|| StablehandError::not_found("Training", training_id))?;

        if horse.has_trained_since_last_race {
            return Err(StablehandError::invariant(format!(
                "horse {} has already trained since its last race",
                horse.id
            )));
        }
        if horse.happiness < HAPPINESS_FLOOR {
            return Err(StablehandError::invariant(format!(
                "horse {} happiness {} is below the training floor {}",
                horse.id, horse.happiness, HAPPINESS_FLOOR
            )));
        }

        let statistics = self.store.statistics(horse.id).await?;
        let statistic = statistics
            .iter()
            .find(|s| s.statistic == training.statistic)
            .ok_or_else(|| {
                StablehandError::invariant(format!(
                    "horse {} is missing the {} statistic",
                    horse.id,
                    training.statistic.name()
                ))
            })?;
        if ctx.is_cancelled() {
            return Err(StablehandError::Cancelled);
        }

        let plan = plan_session(&mut rand::rng(), &horse, statistic, &training);

        let training_session_id = self
            .store
            .complete_training(
                message.request_id,
                TrainingOutcome {
                    session_id: message.session_id,
                    horse_id: horse.id,
                    training_id: training.id,
                    user_id: message.user_id,
                    statistic: training.statistic,
                    gain: plan.gain,
                    new_actual: plan.new_actual,
                    new_happiness: plan.new_happiness,
                    overworked: plan.overworked,
                },
            )
            .await?;

        Ok(TrainingCompleted {
            request_id: message.request_id,
            horse_id: message.horse_id,
            training_id: message.training_id,
            session_id: message.session_id,
            training_session_id,
            user_id: message.user_id,
            completed_at: Utc::now(),
        })
    }

    async fn completed_event(&self, id: Uuid) -> Result<Option<Self::Event>> {
        let Some(request) = self.store.training_request(id).await? else {
            return Ok(None);
        };
        let Some(training_session_id) = request.training_session_id else {
            return Ok(None);
        };
        Ok(Some(TrainingCompleted {
            request_id: request.request_id,
            horse_id: request.horse_id,
            training_id: request.training_id.clamp(0, u8::MAX as i16) as u8,
            session_id: request.session_id,
            training_session_id,
            user_id: request.user_id,
            completed_at: request.processed_date.unwrap_or_else(Utc::now),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HorseSex, LegType, StatisticType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn horse(happiness: i16, race_starts: i32) -> Horse {
        Horse {
            id: Uuid::new_v4(),
            name: "Trainee".to_string(),
            sex: HorseSex::Mare,
            leg_type: LegType::FrontRunner,
            color_id: 1,
            owner_id: Uuid::new_v4(),
            sire_id: None,
            dam_id: None,
            happiness,
            parented: 0,
            race_starts,
            race_wins: 0,
            earnings: 0,
            has_trained_since_last_race: false,
            created_date: Utc::now(),
            updated_date: Utc::now(),
        }
    }

    fn speed_statistic(horse_id: Uuid, dominant: i16, actual: i16) -> HorseStatistic {
        HorseStatistic {
            horse_id,
            statistic: StatisticType::Speed,
            dominant_potential: dominant,
            recessive_potential: 50,
            actual,
        }
    }

    fn sprint_training() -> Training {
        Training {
            id: 1,
            name: "Sprints".to_string(),
            statistic: StatisticType::Speed,
            intensity: 0.25,
            happiness_cost: 10,
        }
    }

    #[test]
    fn gain_never_exceeds_the_potential() {
        let mut rng = StdRng::seed_from_u64(31);
        let subject = horse(90, 0);
        let statistic = speed_statistic(subject.id, 80, 79);
        for _ in 0..100 {
            let plan = plan_session(&mut rng, &subject, &statistic, &sprint_training());
            assert!(plan.new_actual <= 80);
        }
    }

    #[test]
    fn happy_young_horses_gain_more() {
        let mut rng = StdRng::seed_from_u64(37);
        let young = horse(100, 0);
        let veteran = horse(40, 30);
        let statistic = speed_statistic(young.id, 90, 40);
        let young_plan = plan_session(&mut rng, &young, &statistic, &sprint_training());
        let veteran_plan = plan_session(&mut rng, &veteran, &statistic, &sprint_training());
        assert!(young_plan.gain > veteran_plan.gain);
    }

    #[test]
    fn overwork_halves_the_gain() {
        // Happiness 21 passes the floor but lands deep in overwork territory
        // after the cost, so some seeds must roll an overworked session.
        let mut rng = StdRng::seed_from_u64(41);
        let tired = horse(21, 0);
        let statistic = speed_statistic(tired.id, 90, 40);
        let mut saw_overwork = false;
        for _ in 0..200 {
            let plan = plan_session(&mut rng, &tired, &statistic, &sprint_training());
            if plan.overworked {
                saw_overwork = true;
                assert!(plan.gain <= 8);
            }
        }
        assert!(saw_overwork);
    }

    #[test]
    fn leg_type_favors_its_statistic() {
        assert_eq!(LegType::FrontRunner.training_bonus(StatisticType::Speed), 1.1);
        assert_eq!(LegType::FrontRunner.training_bonus(StatisticType::Stamina), 1.0);
    }
}
