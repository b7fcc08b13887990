//! Feeding: apply a feed to a horse and record the session.
//!
//! The first time a horse tastes a feed, its response tier is sampled
//! uniformly and persisted as a preference; every later feeding reuses it.
//! The happiness delta is the feed's base effect scaled by the tier.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use furlong::MessageContext;
use rand::Rng;
use uuid::Uuid;

use crate::domain::FeedResponse;
use crate::error::{Result, StablehandError};
use crate::lifecycle::DomainWork;
use crate::messages::{FeedingCompleted, FeedingRequested};
use crate::requests::ServiceType;
use crate::store::{FeedingOutcome, Store};

const HAPPINESS_MAX: i16 = 100;

fn sample_response<R: Rng>(rng: &mut R) -> FeedResponse {
    FeedResponse::ALL[rng.random_range(0..FeedResponse::ALL.len())]
}

fn happiness_delta(base_effect: i16, response: FeedResponse) -> i16 {
    (f64::from(base_effect) * response.multiplier()).round() as i16
}

/// Feeding domain processor.
pub struct FeedingProcessor<S> {
    store: Arc<S>,
}

impl<S> FeedingProcessor<S>
where
    S: Store,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> DomainWork for FeedingProcessor<S>
where
    S: Store + 'static,
{
    type Message = FeedingRequested;
    type Event = FeedingCompleted;

    const SERVICE: ServiceType = ServiceType::Feeding;

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
        let feeding_id = i16::from(message.feeding_id);
        let feeding = self
            .store
            .feeding(feeding_id)
            .await?
            .ok_or_else(|| StablehandError::not_found("Feeding", feeding_id))?;

        let known = self
            .store
            .feeding_preference(horse.id, feeding.id)
            .await?;
        if ctx.is_cancelled() {
            return Err(StablehandError::Cancelled);
        }

        let (response, first_taste) = match known {
            Some(response) => (response, false),
            None => (sample_response(&mut rand::rng()), true),
        };
        let delta = happiness_delta(feeding.happiness_effect, response);
        let new_happiness = (horse.happiness + delta).clamp(0, HAPPINESS_MAX);

        let feeding_session_id = self
            .store
            .complete_feeding(
                message.request_id,
                FeedingOutcome {
                    session_id: message.session_id,
                    horse_id: horse.id,
                    feeding_id: feeding.id,
                    user_id: message.user_id,
                    response,
                    happiness_delta: new_happiness - horse.happiness,
                    new_happiness,
                    record_preference: first_taste,
                },
            )
            .await?;

        Ok(FeedingCompleted {
            request_id: message.request_id,
            horse_id: message.horse_id,
            feeding_id: message.feeding_id,
            session_id: message.session_id,
            feeding_session_id,
            user_id: message.user_id,
            completed_at: Utc::now(),
        })
    }

    async fn completed_event(&self, id: Uuid) -> Result<Option<Self::Event>> {
        let Some(request) = self.store.feeding_request(id).await? else {
            return Ok(None);
        };
        let Some(feeding_session_id) = request.feeding_session_id else {
            return Ok(None);
        };
        Ok(Some(FeedingCompleted {
            request_id: request.request_id,
            horse_id: request.horse_id,
            feeding_id: request.feeding_id.clamp(0, u8::MAX as i16) as u8,
            session_id: request.session_id,
            feeding_session_id,
            user_id: request.user_id,
            completed_at: request.processed_date.unwrap_or_else(Utc::now),
        }))
    }
}
