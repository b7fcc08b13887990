//! End-to-end lifecycle scenarios over the in-process broker and store:
//! happy paths, duplicate delivery, failure reasons, publish-after-commit
//! reconciliation, concurrent claims, cancellation, and replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use furlong::{
    Broker, Consumer, ConsumerConfig, LocalBroker, MessageContext, MessageRoute,
    ProcessingResult, Processor, RoutingConfig, RoutingPublisher,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stablehand::domain::{
    Color, Feeding, Horse, HorseSex, HorseStatistic, LegType, Race, StatisticType, Training,
};
use stablehand::lifecycle::{DomainWork, RequestProcessor};
use stablehand::messages::{
    BreedingRequested, FeedingRequested, RaceRequested, TrainingRequested,
};
use stablehand::processors::{
    BreedingProcessor, FeedingProcessor, RacingProcessor, RandomNameGenerator, TrainingProcessor,
};
use stablehand::replay::{ReplayAllOptions, ReplayController, ReplayOutcome};
use stablehand::requests::{
    BreedingRequest, FeedingRequest, RaceRequest, RequestStatus, ServiceType, TrainingRequest,
    PUBLISH_FAILED_PREFIX,
};
use stablehand::store::{BreedingStore, FeedingStore, HorseStore, RacingStore, TrainingStore};
use stablehand::MemoryStore;

const WORK: &str = "work";
const IDLE: Duration = Duration::from_secs(3);

fn routing_config() -> RoutingConfig {
    let mut routes = HashMap::new();
    for requested in [
        "BreedingRequested",
        "FeedingRequested",
        "TrainingRequested",
        "RaceRequested",
    ] {
        routes.insert(
            requested.to_string(),
            MessageRoute {
                destination: Some(WORK.to_string()),
                routing_key: Some(format!("{}.{requested}", WORK)),
                subject: None,
                metadata: HashMap::new(),
            },
        );
    }
    RoutingConfig {
        provider: "auto".to_string(),
        default_destination: Some("events".to_string()),
        default_routing_key: None,
        routes,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    broker: Arc<LocalBroker>,
    publisher: Arc<RoutingPublisher>,
    shutdown: CancellationToken,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.seed_color(Color {
        id: 1,
        name: "Bay".to_string(),
        weight: 1,
        is_special: false,
    });
    let broker = Arc::new(LocalBroker::new(WORK));
    let publisher = Arc::new(RoutingPublisher::new(broker.clone(), routing_config()));
    Harness {
        store,
        broker,
        publisher,
        shutdown: CancellationToken::new(),
    }
}

impl Harness {
    async fn start<W>(&self, work: W)
    where
        W: DomainWork + 'static,
    {
        let processor = Arc::new(RequestProcessor::new(
            work,
            self.store.clone(),
            self.publisher.clone(),
        ));
        let consumer = Consumer::new(
            self.broker.clone() as Arc<dyn Broker>,
            processor,
            ConsumerConfig::default().with_queue(WORK),
            self.shutdown.clone(),
        );
        consumer.start().await.unwrap();
    }

    fn breeding_processor(&self) -> RequestProcessor<BreedingProcessor<MemoryStore>, MemoryStore> {
        RequestProcessor::new(
            BreedingProcessor::new(self.store.clone(), Arc::new(RandomNameGenerator)),
            self.store.clone(),
            self.publisher.clone(),
        )
    }

    fn seed_parent(&self, name: &str) -> Horse {
        let id = Uuid::new_v4();
        let horse = Horse {
            id,
            name: name.to_string(),
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
        let statistics = StatisticType::ALL
            .iter()
            .map(|&statistic| HorseStatistic {
                horse_id: id,
                statistic,
                dominant_potential: 80,
                recessive_potential: 60,
                actual: if statistic == StatisticType::Happiness {
                    80
                } else {
                    40
                },
            })
            .collect();
        self.store.insert_horse(horse.clone(), statistics);
        horse
    }

    async fn seed_breeding_request(&self, sire: Uuid, dam: Uuid) -> BreedingRequested {
        let request = BreedingRequest::new(Uuid::new_v4(), sire, dam, Uuid::new_v4());
        self.store.insert_breeding_request(&request).await.unwrap();
        request.to_requested()
    }
}

fn test_context() -> MessageContext {
    MessageContext {
        message_id: Uuid::new_v4().to_string(),
        delivery_count: 1,
        metadata: HashMap::new(),
        cancellation: CancellationToken::new(),
    }
}

// Scenario: happy path, breeding.
#[tokio::test]
async fn breeding_happy_path_creates_one_foal_and_one_event() {
    let h = harness();
    h.start(BreedingProcessor::new(
        h.store.clone(),
        Arc::new(RandomNameGenerator),
    ))
    .await;

    let sire = h.seed_parent("Sire");
    let dam = h.seed_parent("Dam");
    let message = h.seed_breeding_request(sire.id, dam.id).await;

    h.publisher.publish(&message).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let request = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    let foal_id = request.foal_id.expect("foal pointer set");
    assert!(request.processed_date.is_some());
    assert!(request.failure_reason.is_none());

    let foal = h.store.horse(foal_id).await.unwrap().unwrap();
    assert_eq!(foal.owner_id, message.owner_id);
    assert_eq!(foal.sire_id, Some(sire.id));
    assert_eq!(foal.race_starts, 0);

    assert_eq!(h.store.horse(sire.id).await.unwrap().unwrap().parented, 1);
    assert_eq!(h.store.horse(dam.id).await.unwrap().unwrap().parented, 1);

    let events = h.broker.published_of("BreedingCompleted");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].envelope.destination.as_deref(), Some("events"));
    assert_eq!(h.broker.ack_count(), 1);
}

// Scenario: duplicate delivery is a no-op ack.
#[tokio::test]
async fn duplicate_delivery_does_not_repeat_side_effects() {
    let h = harness();
    h.start(BreedingProcessor::new(
        h.store.clone(),
        Arc::new(RandomNameGenerator),
    ))
    .await;

    let sire = h.seed_parent("Sire");
    let dam = h.seed_parent("Dam");
    let message = h.seed_breeding_request(sire.id, dam.id).await;

    h.publisher.publish(&message).await.unwrap();
    h.broker.wait_idle(IDLE).await;
    let first = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    let horses_after_first = h.store.horse_count();

    h.publisher.publish(&message).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let second = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.status, RequestStatus::Completed);
    assert_eq!(second.processed_date, first.processed_date);
    assert_eq!(second.foal_id, first.foal_id);
    assert_eq!(h.store.horse_count(), horses_after_first);
    assert_eq!(h.broker.published_of("BreedingCompleted").len(), 1);
    assert_eq!(h.broker.ack_count(), 2);
}

// Scenario: missing sire fails the request and dead-letters the message.
#[tokio::test]
async fn missing_sire_fails_with_reason_and_no_requeue() {
    let h = harness();
    h.start(BreedingProcessor::new(
        h.store.clone(),
        Arc::new(RandomNameGenerator),
    ))
    .await;

    let dam = h.seed_parent("Dam");
    let message = h.seed_breeding_request(Uuid::new_v4(), dam.id).await;

    h.publisher.publish(&message).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let request = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RequestStatus::Failed);
    assert!(request.failure_reason.as_deref().unwrap().contains("Sire"));
    assert!(request.foal_id.is_none());

    assert_eq!(h.store.horse_count(), 1);
    assert_eq!(h.broker.dead_letters().len(), 1);
    assert_eq!(h.broker.requeue_count(), 0);
    assert!(h.broker.published_of("BreedingCompleted").is_empty());
}

// Scenario: publish-after-commit failure, then reconciliation on redelivery.
#[tokio::test]
async fn publish_failure_after_commit_keeps_completed_and_republishes() {
    let h = harness();
    h.start(BreedingProcessor::new(
        h.store.clone(),
        Arc::new(RandomNameGenerator),
    ))
    .await;

    let sire = h.seed_parent("Sire");
    let dam = h.seed_parent("Dam");
    let message = h.seed_breeding_request(sire.id, dam.id).await;

    h.broker.fail_next_publish("BreedingCompleted", 1);
    h.publisher.publish(&message).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let request = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(request.foal_id.is_some());
    assert!(request
        .failure_reason
        .as_deref()
        .unwrap()
        .starts_with(PUBLISH_FAILED_PREFIX));
    assert_eq!(h.store.horse_count(), 3);
    assert!(h.broker.published_of("BreedingCompleted").is_empty());
    assert_eq!(h.broker.dead_letters().len(), 1);

    // Redelivery (via replay) republishes the event without new side effects.
    h.publisher.publish(&message).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let reconciled = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reconciled.status, RequestStatus::Completed);
    assert!(reconciled.failure_reason.is_none());
    assert_eq!(reconciled.foal_id, request.foal_id);
    assert_eq!(h.store.horse_count(), 3);
    assert_eq!(h.broker.published_of("BreedingCompleted").len(), 1);
}

// Scenario: two concurrent deliveries of one request produce one foal.
#[tokio::test]
async fn concurrent_deliveries_complete_exactly_once() {
    let h = harness();
    let sire = h.seed_parent("Sire");
    let dam = h.seed_parent("Dam");
    let message = h.seed_breeding_request(sire.id, dam.id).await;

    let processor = Arc::new(h.breeding_processor());
    let left = {
        let processor = processor.clone();
        let message = message.clone();
        tokio::spawn(async move { processor.process(message, &test_context()).await })
    };
    let right = {
        let processor = processor.clone();
        let message = message.clone();
        tokio::spawn(async move { processor.process(message, &test_context()).await })
    };
    let (left, right) = (left.await.unwrap(), right.await.unwrap());

    assert_eq!(left, ProcessingResult::Success);
    assert_eq!(right, ProcessingResult::Success);

    let request = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(h.store.foals_of(sire.id).len(), 1);
    assert_eq!(h.broker.published_of("BreedingCompleted").len(), 1);
}

// Scenario: cancellation mid-process requeues without partial side effects.
#[tokio::test]
async fn cancelled_processing_requeues_and_rolls_back() {
    let h = harness();
    let sire = h.seed_parent("Sire");
    let dam = h.seed_parent("Dam");
    let message = h.seed_breeding_request(sire.id, dam.id).await;

    let processor = h.breeding_processor();
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let ctx = MessageContext {
        message_id: Uuid::new_v4().to_string(),
        delivery_count: 1,
        metadata: HashMap::new(),
        cancellation: cancelled,
    };

    let result = processor.process(message.clone(), &ctx).await;
    assert!(matches!(
        result,
        ProcessingResult::Failure { requeue: true, .. }
    ));

    let request = h
        .store
        .breeding_request(message.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(request.status, RequestStatus::Completed);
    assert!(request.foal_id.is_none());
    assert_eq!(h.store.horse_count(), 2);
}

// Scenario: fabricated message with no request row is acknowledged.
#[tokio::test]
async fn message_without_request_row_is_acknowledged() {
    let h = harness();
    let sire = h.seed_parent("Sire");
    let dam = h.seed_parent("Dam");

    let processor = h.breeding_processor();
    let message = BreedingRequested {
        request_id: Uuid::new_v4(),
        sire_id: sire.id,
        dam_id: dam.id,
        owner_id: Uuid::new_v4(),
    };
    let result = processor.process(message, &test_context()).await;
    assert_eq!(result, ProcessingResult::Success);
    assert_eq!(h.store.horse_count(), 2);
}

// Scenario: replay-all republishes pending and failed, skips completed.
#[tokio::test]
async fn replay_all_republishes_only_non_complete_requests() {
    let h = harness();

    let pending = BreedingRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    h.store.insert_breeding_request(&pending).await.unwrap();

    let mut failed = BreedingRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    failed.status = RequestStatus::Failed;
    h.store.insert_breeding_request(&failed).await.unwrap();

    let mut completed = BreedingRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    completed.status = RequestStatus::Completed;
    h.store.insert_breeding_request(&completed).await.unwrap();

    let controller = ReplayController::new(h.store.clone(), h.publisher.clone());
    let published = controller
        .replay_all_non_complete(
            ServiceType::Breeding,
            ReplayAllOptions {
                max_parallel: 2,
                include_stuck_after: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(published, 2);
    let replayed: Vec<Uuid> = h
        .broker
        .published_of("BreedingRequested")
        .iter()
        .map(|m| {
            serde_json::from_slice::<BreedingRequested>(&m.body)
                .unwrap()
                .request_id
        })
        .collect();
    assert!(replayed.contains(&pending.request_id));
    assert!(replayed.contains(&failed.request_id));
    assert!(!replayed.contains(&completed.request_id));
}

#[tokio::test]
async fn replay_of_unknown_request_reports_not_found() {
    let h = harness();
    let controller = ReplayController::new(h.store.clone(), h.publisher.clone());
    for service in ServiceType::ALL {
        let outcome = controller.replay(service, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, ReplayOutcome::NotFound);
    }
}

#[tokio::test]
async fn single_replay_republishes_the_original_message() {
    let h = harness();
    let request = BreedingRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    h.store.insert_breeding_request(&request).await.unwrap();

    let controller = ReplayController::new(h.store.clone(), h.publisher.clone());
    let outcome = controller
        .replay(ServiceType::Breeding, request.request_id)
        .await
        .unwrap();
    assert_eq!(outcome, ReplayOutcome::Published);

    let published = h.broker.published_of("BreedingRequested");
    assert_eq!(published.len(), 1);
    let replayed: BreedingRequested = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(replayed, request.to_requested());
}

// Routing fallback: an unrouted completed event targets the default
// destination under its simple type name.
#[tokio::test]
async fn race_completed_falls_back_to_default_destination() {
    let broker = Arc::new(LocalBroker::new(WORK));
    let publisher = RoutingPublisher::new(
        broker.clone(),
        RoutingConfig {
            provider: "auto".to_string(),
            default_destination: Some("events".to_string()),
            default_routing_key: None,
            routes: HashMap::new(),
        },
    );

    publisher
        .publish(&stablehand::messages::RaceCompleted {
            request_id: Uuid::new_v4(),
            race_id: 1,
            horse_id: Uuid::new_v4(),
            race_run_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            completed_at: Utc::now(),
        })
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].envelope.destination.as_deref(), Some("events"));
    assert_eq!(
        published[0].envelope.subject.as_deref(),
        Some("RaceCompleted")
    );
}

// Feeding end to end, including preference persistence across sessions.
#[tokio::test]
async fn feeding_completes_and_preference_sticks() {
    let h = harness();
    h.start(FeedingProcessor::new(h.store.clone())).await;

    let horse = h.seed_parent("Eater");
    h.store.seed_feeding(Feeding {
        id: 2,
        name: "Oats".to_string(),
        happiness_effect: 4,
    });
    let user = Uuid::new_v4();

    let first = FeedingRequest::new(Uuid::new_v4(), horse.id, 2, Uuid::new_v4(), user);
    h.store.insert_feeding_request(&first).await.unwrap();
    h.publisher.publish(&first.to_requested()).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let row = h
        .store
        .feeding_request(first.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert!(row.feeding_session_id.is_some());
    let preference = h
        .store
        .feeding_preference(horse.id, 2)
        .await
        .unwrap()
        .expect("preference recorded on first taste");

    let second = FeedingRequest::new(Uuid::new_v4(), horse.id, 2, Uuid::new_v4(), user);
    h.store.insert_feeding_request(&second).await.unwrap();
    h.publisher.publish(&second.to_requested()).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let sessions = h.store.feeding_sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.response == preference));
    assert_eq!(h.broker.published_of("FeedingCompleted").len(), 2);
}

// Training end to end: gain applied, capped by potential, horse flagged.
#[tokio::test]
async fn training_completes_and_updates_the_horse() {
    let h = harness();
    h.start(TrainingProcessor::new(h.store.clone())).await;

    let horse = h.seed_parent("Trainee");
    h.store.seed_training(Training {
        id: 1,
        name: "Sprint Drills".to_string(),
        statistic: StatisticType::Speed,
        intensity: 0.25,
        happiness_cost: 10,
    });

    let request = TrainingRequest::new(Uuid::new_v4(), horse.id, 1, Uuid::new_v4(), Uuid::new_v4());
    h.store.insert_training_request(&request).await.unwrap();
    h.publisher.publish(&request.to_requested()).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let row = h
        .store
        .training_request(request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert!(row.training_session_id.is_some());

    let after = h.store.horse(horse.id).await.unwrap().unwrap();
    assert!(after.has_trained_since_last_race);
    assert!(after.happiness < horse.happiness);

    let speed = h
        .store
        .statistics(horse.id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.statistic == StatisticType::Speed)
        .unwrap();
    assert!(speed.actual > 40);
    assert!(speed.actual <= speed.dominant_potential);
}

// Training eligibility: a horse that already trained fails the invariant.
#[tokio::test]
async fn training_twice_between_races_fails_the_request() {
    let h = harness();
    h.start(TrainingProcessor::new(h.store.clone())).await;

    let mut horse = h.seed_parent("Trainee");
    horse.has_trained_since_last_race = true;
    h.store.insert_horse(horse.clone(), vec![]);
    h.store.seed_training(Training {
        id: 1,
        name: "Sprint Drills".to_string(),
        statistic: StatisticType::Speed,
        intensity: 0.25,
        happiness_cost: 10,
    });

    let request = TrainingRequest::new(Uuid::new_v4(), horse.id, 1, Uuid::new_v4(), Uuid::new_v4());
    h.store.insert_training_request(&request).await.unwrap();
    h.publisher.publish(&request.to_requested()).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let row = h
        .store
        .training_request(request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert!(row
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("already trained"));
    assert_eq!(h.broker.dead_letters().len(), 1);
}

// Racing end to end: run recorded, career counters updated.
#[tokio::test]
async fn racing_completes_with_a_full_run_record() {
    let h = harness();
    h.start(RacingProcessor::new(h.store.clone())).await;

    let runner = h.seed_parent("Runner");
    let rival = h.seed_parent("Rival");
    h.store.seed_race(Race {
        id: 1,
        name: "Maiden Stakes".to_string(),
        distance_m: 1200,
        purse: 5000,
    });

    let request = RaceRequest::new(Uuid::new_v4(), 1, runner.id, runner.owner_id);
    h.store.insert_race_request(&request).await.unwrap();
    h.publisher.publish(&request.to_requested()).await.unwrap();
    h.broker.wait_idle(IDLE).await;

    let row = h
        .store
        .race_request(request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    let run_id = row.race_run_id.expect("run pointer set");

    let placements = h.store.race_run_horses(run_id);
    assert_eq!(placements.len(), 2);
    assert!(placements.iter().any(|p| p.horse_id == runner.id));
    assert!(placements.iter().any(|p| p.horse_id == rival.id));

    let after = h.store.horse(runner.id).await.unwrap().unwrap();
    assert_eq!(after.race_starts, 1);
    assert_eq!(h.broker.published_of("RaceCompleted").len(), 1);
}
