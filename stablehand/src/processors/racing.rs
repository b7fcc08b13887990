//! Racing: simulate a full race tick-by-tick and record the run.
//!
//! Each tick every horse advances by a speed derived from its Speed
//! statistic, shaped by its running style over the course of the race and a
//! small jitter, with a fatigue penalty once its stamina pool runs dry.
//! Placements fall out of finish order; the requesting horse's career
//! counters and earnings are updated with its payout share of the purse.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use furlong::MessageContext;
use rand::Rng;
use uuid::Uuid;

use crate::domain::{Horse, HorseStatistic, Race, StatisticType};
use crate::error::{Result, StablehandError};
use crate::lifecycle::DomainWork;
use crate::messages::{RaceCompleted, RaceRequested};
use crate::requests::ServiceType;
use crate::store::{RaceOutcome, RacePlacement, RaceTick, Store};

/// Horses in a race, requester included.
const FIELD_SIZE: usize = 6;
/// Hard stop for the simulation loop.
const MAX_TICKS: i32 = 600;
/// Purse share by placement; later finishers get nothing.
const PAYOUT_SHARES: [f64; 3] = [0.6, 0.25, 0.15];

struct Runner {
    horse_id: Uuid,
    base_speed: f64,
    stamina_pool: f64,
    leg_type: crate::domain::LegType,
    distance: f64,
    finish_tick: Option<i32>,
}

fn statistic_actual(statistics: &[HorseStatistic], statistic: StatisticType) -> i16 {
    statistics
        .iter()
        .find(|s| s.statistic == statistic)
        .map(|s| s.actual)
        .unwrap_or(20)
}

fn runner_for(horse: &Horse, statistics: &[HorseStatistic]) -> Runner {
    let speed = statistic_actual(statistics, StatisticType::Speed);
    let stamina = statistic_actual(statistics, StatisticType::Stamina);
    Runner {
        horse_id: horse.id,
        // Meters per tick; a mid-tier horse covers ~1600m in ~90 ticks.
        base_speed: 14.0 + f64::from(speed) / 8.0,
        stamina_pool: f64::from(stamina) * 30.0,
        leg_type: horse.leg_type,
        distance: 0.0,
        finish_tick: None,
    }
}

struct Simulation {
    placements: Vec<RacePlacement>,
    ticks: Vec<RaceTick>,
}

fn simulate<R: Rng>(rng: &mut R, race: &Race, mut runners: Vec<Runner>) -> Simulation {
    let distance = f64::from(race.distance_m);
    let mut ticks = Vec::new();
    let mut finished = 0usize;
    let mut tick = 0i32;

    while finished < runners.len() && tick < MAX_TICKS {
        tick += 1;
        for runner in runners.iter_mut() {
            if runner.finish_tick.is_some() {
                continue;
            }
            let progress = (runner.distance / distance).min(1.0);
            let mut speed = runner.base_speed
                * runner.leg_type.pace_factor(progress)
                * rng.random_range(0.95..1.05);
            if runner.stamina_pool <= 0.0 {
                speed *= 0.75;
            } else {
                runner.stamina_pool -= speed;
            }
            runner.distance += speed;
            ticks.push(RaceTick {
                tick,
                horse_id: runner.horse_id,
                distance: runner.distance.min(distance),
            });
            if runner.distance >= distance {
                runner.finish_tick = Some(tick);
                finished += 1;
            }
        }
    }

    // Finish order, then distance covered for anything still running at the cap.
    runners.sort_by(|a, b| {
        match (a.finish_tick, b.finish_tick) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => b
                .distance
                .partial_cmp(&a.distance)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    });

    let placements = runners
        .iter()
        .enumerate()
        .map(|(index, runner)| {
            let share = PAYOUT_SHARES.get(index).copied().unwrap_or(0.0);
            RacePlacement {
                horse_id: runner.horse_id,
                placement: (index + 1) as i16,
                finish_ticks: runner.finish_tick.unwrap_or(MAX_TICKS),
                payout: (race.purse as f64 * share).round() as i64,
            }
        })
        .collect();

    Simulation { placements, ticks }
}

/// Racing domain processor.
pub struct RacingProcessor<S> {
    store: Arc<S>,
}

impl<S> RacingProcessor<S>
where
    S: Store,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> DomainWork for RacingProcessor<S>
where
    S: Store + 'static,
{
    type Message = RaceRequested;
    type Event = RaceCompleted;

    const SERVICE: ServiceType = ServiceType::Racing;

    fn request_id(message: &Self::Message) -> Uuid {
        message.request_id
    }

    async fn execute(
        &self,
        message: &Self::Message,
        ctx: &MessageContext,
    ) -> Result<Self::Event> {
        let race_id = i16::from(message.race_id);
        let race = self
            .store
            .race(race_id)
            .await?
            .ok_or_else(|| StablehandError::not_found("Race", race_id))?;
        let horse = self
            .store
            .horse(message.horse_id)
            .await?
            .ok_or_else(|| StablehandError::not_found("Horse", message.horse_id))?;
        let statistics = self.store.statistics(horse.id).await?;

        let field = self
            .store
            .race_field_fill(FIELD_SIZE - 1, horse.id)
            .await?;
        if ctx.is_cancelled() {
            return Err(StablehandError::Cancelled);
        }

        let simulation = {
            let mut rng = rand::rng();
            let mut runners = vec![runner_for(&horse, &statistics)];
            runners.extend(
                field
                    .iter()
                    .map(|(entrant, entrant_stats)| runner_for(entrant, entrant_stats)),
            );
            simulate(&mut rng, &race, runners)
        };

        let race_run_id = self
            .store
            .complete_race(
                message.request_id,
                RaceOutcome {
                    race_id: race.id,
                    requester: horse.id,
                    placements: simulation.placements,
                    ticks: simulation.ticks,
                },
            )
            .await?;

        Ok(RaceCompleted {
            request_id: message.request_id,
            race_id: message.race_id,
            horse_id: message.horse_id,
            race_run_id,
            owner_id: message.owner_id,
            completed_at: Utc::now(),
        })
    }

    async fn completed_event(&self, id: Uuid) -> Result<Option<Self::Event>> {
        let Some(request) = self.store.race_request(id).await? else {
            return Ok(None);
        };
        let Some(race_run_id) = request.race_run_id else {
            return Ok(None);
        };
        Ok(Some(RaceCompleted {
            request_id: request.request_id,
            race_id: request.race_id.clamp(0, u8::MAX as i16) as u8,
            horse_id: request.horse_id,
            race_run_id,
            owner_id: request.owner_id,
            completed_at: request.processed_date.unwrap_or_else(Utc::now),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HorseSex, LegType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn entrant(speed: i16, stamina: i16) -> (Horse, Vec<HorseStatistic>) {
        let id = Uuid::new_v4();
        let horse = Horse {
            id,
            name: "Entrant".to_string(),
            sex: HorseSex::Stallion,
            leg_type: LegType::Stalker,
            color_id: 1,
            owner_id: Uuid::new_v4(),
            sire_id: None,
            dam_id: None,
            happiness: 80,
            parented: 0,
            race_starts: 0,
            race_wins: 0,
            earnings: 0,
            has_trained_since_last_race: false,
            created_date: Utc::now(),
            updated_date: Utc::now(),
        };
        let statistics = vec![
            HorseStatistic {
                horse_id: id,
                statistic: StatisticType::Speed,
                dominant_potential: 90,
                recessive_potential: 50,
                actual: speed,
            },
            HorseStatistic {
                horse_id: id,
                statistic: StatisticType::Stamina,
                dominant_potential: 90,
                recessive_potential: 50,
                actual: stamina,
            },
        ];
        (horse, statistics)
    }

    fn test_race() -> Race {
        Race {
            id: 1,
            name: "Test Stakes".to_string(),
            distance_m: 1600,
            purse: 10_000,
        }
    }

    #[test]
    fn every_runner_gets_a_distinct_placement() {
        let mut rng = StdRng::seed_from_u64(43);
        let runners: Vec<Runner> = (0..4)
            .map(|_| {
                let (horse, stats) = entrant(60, 60);
                runner_for(&horse, &stats)
            })
            .collect();
        let simulation = simulate(&mut rng, &test_race(), runners);

        let mut placements: Vec<i16> =
            simulation.placements.iter().map(|p| p.placement).collect();
        placements.sort_unstable();
        assert_eq!(placements, vec![1, 2, 3, 4]);
    }

    #[test]
    fn payouts_follow_the_share_table() {
        let mut rng = StdRng::seed_from_u64(47);
        let runners: Vec<Runner> = (0..4)
            .map(|_| {
                let (horse, stats) = entrant(60, 60);
                runner_for(&horse, &stats)
            })
            .collect();
        let simulation = simulate(&mut rng, &test_race(), runners);

        let by_placement = |p: i16| {
            simulation
                .placements
                .iter()
                .find(|r| r.placement == p)
                .unwrap()
                .payout
        };
        assert_eq!(by_placement(1), 6_000);
        assert_eq!(by_placement(2), 2_500);
        assert_eq!(by_placement(3), 1_500);
        assert_eq!(by_placement(4), 0);
    }

    #[test]
    fn faster_horses_usually_win() {
        let mut wins = 0;
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (fast, fast_stats) = entrant(95, 90);
            let (slow, slow_stats) = entrant(30, 30);
            let runners = vec![
                runner_for(&fast, &fast_stats),
                runner_for(&slow, &slow_stats),
            ];
            let simulation = simulate(&mut rng, &test_race(), runners);
            let winner = simulation
                .placements
                .iter()
                .find(|p| p.placement == 1)
                .unwrap();
            if winner.horse_id == fast.id {
                wins += 1;
            }
        }
        assert!(wins >= 18, "fast horse won only {wins}/20");
    }

    #[test]
    fn tick_log_covers_the_whole_field() {
        let mut rng = StdRng::seed_from_u64(53);
        let (a, a_stats) = entrant(70, 70);
        let (b, b_stats) = entrant(50, 50);
        let runners = vec![runner_for(&a, &a_stats), runner_for(&b, &b_stats)];
        let simulation = simulate(&mut rng, &test_race(), runners);

        assert!(simulation.ticks.iter().any(|t| t.horse_id == a.id));
        assert!(simulation.ticks.iter().any(|t| t.horse_id == b.id));
        let max_distance = simulation
            .ticks
            .iter()
            .map(|t| t.distance)
            .fold(0.0f64, f64::max);
        assert!(max_distance <= 1600.0);
    }
}
