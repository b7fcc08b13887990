//! Breeding: genetic inheritance of a foal from sire and dam.
//!
//! Sex and leg type are uniform draws. The coat color is a weighted sample
//! over the catalog where stored weight means rarity (frequency is
//! `1 / max(1, weight)`), with special colors boosted when parents are
//! special. Statistics run a Punnett-square selection over the parents'
//! dominant/recessive potentials, then a rarity-bucketed mutation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use furlong::MessageContext;
use rand::Rng;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::domain::{
    Color, Horse, HorseSex, HorseStatistic, LegType, NewFoal, NewStatistic, StatisticType,
};
use crate::error::{Result, StablehandError};
use crate::lifecycle::DomainWork;
use crate::messages::{BreedingCompleted, BreedingRequested};
use crate::processors::names::NameGenerator;
use crate::requests::ServiceType;
use crate::store::Store;

/// Potentials outside this band after mutation collapse to the baseline.
const POTENTIAL_RANGE: std::ops::RangeInclusive<i16> = 30..=95;
const POTENTIAL_BASELINE: i16 = 50;

pub(crate) struct Parent {
    pub horse: Horse,
    pub statistics: HashMap<StatisticType, HorseStatistic>,
}

pub(crate) fn sample_sex<R: Rng>(rng: &mut R) -> HorseSex {
    if rng.random_bool(0.5) {
        HorseSex::Stallion
    } else {
        HorseSex::Mare
    }
}

pub(crate) fn sample_leg_type<R: Rng>(rng: &mut R) -> LegType {
    LegType::ALL[rng.random_range(0..LegType::ALL.len())]
}

/// Frequency boost applied to special colors, by how many parents are special.
pub(crate) fn special_multiplier(sire_special: bool, dam_special: bool) -> f64 {
    match (sire_special, dam_special) {
        (true, true) => 50.0,
        (true, false) | (false, true) => 10.0,
        (false, false) => 1.0,
    }
}

/// Weighted sample over the color catalog via cumulative-frequency walk.
pub(crate) fn sample_color<'a, R: Rng>(
    rng: &mut R,
    colors: &'a [Color],
    multiplier: f64,
) -> Result<&'a Color> {
    if colors.is_empty() {
        return Err(StablehandError::Validation(
            "color catalog is empty".to_string(),
        ));
    }
    let frequencies: Vec<f64> = colors
        .iter()
        .map(|color| {
            let frequency = 1.0 / f64::from(color.weight.max(1));
            if color.is_special {
                frequency * multiplier
            } else {
                frequency
            }
        })
        .collect();
    let total: f64 = frequencies.iter().sum();
    let draw = rng.random_range(0.0..total);
    let mut cumulative = 0.0;
    for (color, frequency) in colors.iter().zip(&frequencies) {
        cumulative += frequency;
        if draw < cumulative {
            return Ok(color);
        }
    }
    Ok(colors.last().expect("catalog checked non-empty"))
}

/// Punnett-square allele selection over four quadrants. Two quadrants pair
/// one parent's dominant with the other's recessive directly; the other two
/// flip which parent contributes which allele on a secondary coin toss.
fn punnett<R: Rng>(rng: &mut R, sire: &HorseStatistic, dam: &HorseStatistic) -> (i16, i16) {
    match rng.random_range(0..4) {
        0 => (sire.dominant_potential, dam.recessive_potential),
        1 => (dam.dominant_potential, sire.recessive_potential),
        2 => {
            if rng.random_bool(0.5) {
                (sire.recessive_potential, dam.dominant_potential)
            } else {
                (dam.dominant_potential, sire.recessive_potential)
            }
        }
        _ => {
            if rng.random_bool(0.5) {
                (dam.recessive_potential, sire.dominant_potential)
            } else {
                (sire.dominant_potential, dam.recessive_potential)
            }
        }
    }
}

/// 100-bucket mutation: bucket 1 is a large positive swing, bucket 2 a large
/// negative one, everything else a small drift. Out-of-band results collapse
/// to the baseline.
fn mutate_potential<R: Rng>(rng: &mut R, value: i16) -> i16 {
    let bucket = rng.random_range(1..=100);
    let delta: i16 = match bucket {
        1 => rng.random_range(0..=15),
        2 => -rng.random_range(0..=15),
        _ => rng.random_range(-5..=5),
    };
    let mutated = value + delta;
    if POTENTIAL_RANGE.contains(&mutated) {
        mutated
    } else {
        POTENTIAL_BASELINE
    }
}

fn roll_actual<R: Rng>(rng: &mut R, dominant: i16) -> i16 {
    let low = (dominant / 3).max(1);
    let high = (dominant / 2).max(low);
    rng.random_range(low..=high)
}

pub(crate) fn foal_statistics<R: Rng>(
    rng: &mut R,
    sire: &Parent,
    dam: &Parent,
) -> Result<Vec<NewStatistic>> {
    let mut statistics = Vec::with_capacity(StatisticType::ALL.len());
    for statistic in StatisticType::INHERITED {
        let from_sire = sire.statistics.get(&statistic).ok_or_else(|| {
            StablehandError::invariant(format!(
                "sire is missing the {} statistic",
                statistic.name()
            ))
        })?;
        let from_dam = dam.statistics.get(&statistic).ok_or_else(|| {
            StablehandError::invariant(format!(
                "dam is missing the {} statistic",
                statistic.name()
            ))
        })?;
        let (dominant, recessive) = punnett(rng, from_sire, from_dam);
        let dominant = mutate_potential(rng, dominant);
        let recessive = mutate_potential(rng, recessive);
        statistics.push(NewStatistic {
            statistic,
            dominant_potential: dominant,
            recessive_potential: recessive,
            actual: roll_actual(rng, dominant),
        });
    }
    statistics.push(NewStatistic {
        statistic: StatisticType::Happiness,
        dominant_potential: 100,
        recessive_potential: 100,
        actual: 50,
    });
    Ok(statistics)
}

/// Breeding domain processor.
pub struct BreedingProcessor<S> {
    store: Arc<S>,
    names: Arc<dyn NameGenerator>,
    /// Color catalog, loaded on first use and immutable for the process
    /// lifetime.
    colors: OnceCell<Vec<Color>>,
}

impl<S> BreedingProcessor<S>
where
    S: Store,
{
    pub fn new(store: Arc<S>, names: Arc<dyn NameGenerator>) -> Self {
        Self {
            store,
            names,
            colors: OnceCell::new(),
        }
    }

    async fn colors(&self) -> Result<&[Color]> {
        let colors = self
            .colors
            .get_or_try_init(|| async { self.store.colors().await })
            .await?;
        Ok(colors.as_slice())
    }

    async fn load_parent(&self, role: &'static str, id: Uuid) -> Result<Parent> {
        let horse = self
            .store
            .horse(id)
            .await?
            .ok_or_else(|| StablehandError::not_found(role, id))?;
        let statistics = self
            .store
            .statistics(id)
            .await?
            .into_iter()
            .map(|s| (s.statistic, s))
            .collect();
        Ok(Parent { horse, statistics })
    }
}

#[async_trait]
impl<S> DomainWork for BreedingProcessor<S>
where
    S: Store + 'static,
{
    type Message = BreedingRequested;
    type Event = BreedingCompleted;

    const SERVICE: ServiceType = ServiceType::Breeding;

    fn request_id(message: &Self::Message) -> Uuid {
        message.request_id
    }

    async fn execute(
        &self,
        message: &Self::Message,
        ctx: &MessageContext,
    ) -> Result<Self::Event> {
        let sire = self.load_parent("Sire", message.sire_id).await?;
        let dam = self.load_parent("Dam", message.dam_id).await?;
        let colors = self.colors().await?;
        if ctx.is_cancelled() {
            return Err(StablehandError::Cancelled);
        }

        let sire_special = colors
            .iter()
            .find(|c| c.id == sire.horse.color_id)
            .is_some_and(|c| c.is_special);
        let dam_special = colors
            .iter()
            .find(|c| c.id == dam.horse.color_id)
            .is_some_and(|c| c.is_special);

        let foal = {
            let mut rng = rand::rng();
            let color = sample_color(
                &mut rng,
                colors,
                special_multiplier(sire_special, dam_special),
            )?;
            NewFoal {
                name: self.names.generate(),
                sex: sample_sex(&mut rng),
                leg_type: sample_leg_type(&mut rng),
                color_id: color.id,
                owner_id: message.owner_id,
                sire_id: message.sire_id,
                dam_id: message.dam_id,
                statistics: foal_statistics(&mut rng, &sire, &dam)?,
            }
        };

        if ctx.is_cancelled() {
            return Err(StablehandError::Cancelled);
        }
        let foal_id = self
            .store
            .complete_breeding(message.request_id, foal)
            .await?;

        Ok(BreedingCompleted {
            request_id: message.request_id,
            sire_id: message.sire_id,
            dam_id: message.dam_id,
            foal_id,
            owner_id: message.owner_id,
            completed_at: Utc::now(),
        })
    }

    async fn completed_event(&self, id: Uuid) -> Result<Option<Self::Event>> {
        let Some(request) = self.store.breeding_request(id).await? else {
            return Ok(None);
        };
        let Some(foal_id) = request.foal_id else {
            return Ok(None);
        };
        Ok(Some(BreedingCompleted {
            request_id: request.request_id,
            sire_id: request.sire_id,
            dam_id: request.dam_id,
            foal_id,
            owner_id: request.owner_id,
            completed_at: request.processed_date.unwrap_or_else(Utc::now),
        }))
    }
}
