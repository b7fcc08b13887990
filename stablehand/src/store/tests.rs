use rstest::{fixture, rstest};
use uuid::Uuid;

use chrono::Utc;

use crate::domain::{
    HorseSex, LegType, NewFoal, NewStatistic, StatisticType,
};
use crate::error::StablehandError;
use crate::requests::{BreedingRequest, RequestStatus, ServiceType};
use crate::store::memory::MemoryStore;
use crate::store::postgres::PostgresStore;
use crate::store::{BreedingStore, FeedingOutcome, FeedingStore, HorseStore, RequestStore, Store};

fn sample_request() -> BreedingRequest {
    BreedingRequest::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
        Uuid::new_v4(),
    )
}

fn sample_foal(sire_id: Uuid, dam_id: Uuid, owner_id: Uuid) -> NewFoal {
    NewFoal {
        name: "Test Foal".to_string(),
        sex: HorseSex::Mare,
        leg_type: LegType::Closer,
        color_id: 1,
        owner_id,
        sire_id,
        dam_id,
        statistics: vec![
            NewStatistic {
                statistic: StatisticType::Speed,
                dominant_potential: 70,
                recessive_potential: 55,
                actual: 30,
            },
            NewStatistic {
                statistic: StatisticType::Happiness,
                dominant_potential: 100,
                recessive_potential: 100,
                actual: 50,
            },
        ],
    }
}

fn sample_horse(id: Uuid) -> crate::domain::Horse {
    crate::domain::Horse {
        id,
        name: "Seeded".to_string(),
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
    }
}

/// Fixture that returns a MemoryStore with the default color seeded.
#[fixture]
fn memory_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.seed_color(crate::domain::Color {
        id: 1,
        name: "Bay".to_string(),
        weight: 1,
        is_special: false,
    });
    store
}

async fn run_test_claim_is_won_once<S: Store>(store: &S) {
    let request = sample_request();
    store.insert_breeding_request(&request).await.unwrap();

    assert!(store
        .claim(ServiceType::Breeding, request.request_id)
        .await
        .unwrap());
    // Second claim loses: the row is already InProgress.
    assert!(!store
        .claim(ServiceType::Breeding, request.request_id)
        .await
        .unwrap());

    let head = store
        .head(ServiceType::Breeding, request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.status, RequestStatus::InProgress);
}

#[rstest]
#[tokio::test]
async fn test_claim_is_won_once(memory_store: MemoryStore) {
    run_test_claim_is_won_once(&memory_store).await;
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_claim_is_won_once_postgres(pool: sqlx::PgPool) {
    run_test_claim_is_won_once(&PostgresStore::new(pool)).await;
}

async fn run_test_claim_revives_failed<S: Store>(store: &S) {
    let request = sample_request();
    store.insert_breeding_request(&request).await.unwrap();
    store.claim(ServiceType::Breeding, request.request_id).await.unwrap();
    store
        .mark_failed(ServiceType::Breeding, request.request_id, "sire missing")
        .await
        .unwrap();

    let head = store
        .head(ServiceType::Breeding, request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.status, RequestStatus::Failed);
    assert_eq!(head.failure_reason.as_deref(), Some("sire missing"));

    assert!(store
        .claim(ServiceType::Breeding, request.request_id)
        .await
        .unwrap());
}

#[rstest]
#[tokio::test]
async fn test_claim_revives_failed(memory_store: MemoryStore) {
    run_test_claim_revives_failed(&memory_store).await;
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_claim_revives_failed_postgres(pool: sqlx::PgPool) {
    run_test_claim_revives_failed(&PostgresStore::new(pool)).await;
}

async fn run_test_claim_of_missing_row_is_lost<S: Store>(store: &S) {
    assert!(!store
        .claim(ServiceType::Breeding, Uuid::new_v4())
        .await
        .unwrap());
    assert!(store
        .head(ServiceType::Breeding, Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[rstest]
#[tokio::test]
async fn test_claim_of_missing_row_is_lost(memory_store: MemoryStore) {
    run_test_claim_of_missing_row_is_lost(&memory_store).await;
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_claim_of_missing_row_is_lost_postgres(pool: sqlx::PgPool) {
    run_test_claim_of_missing_row_is_lost(&PostgresStore::new(pool)).await;
}

async fn run_test_publish_failure_annotation_round_trip<S: Store>(store: &S) {
    let request = sample_request();
    store.insert_breeding_request(&request).await.unwrap();
    store
        .annotate_publish_failure(
            ServiceType::Breeding,
            request.request_id,
            "Publish failed: broker down",
        )
        .await
        .unwrap();

    let head = store
        .head(ServiceType::Breeding, request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(head.failure_reason.as_deref().unwrap().starts_with("Publish failed: "));

    store
        .clear_publish_failure(ServiceType::Breeding, request.request_id)
        .await
        .unwrap();
    let head = store
        .head(ServiceType::Breeding, request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(head.failure_reason.is_none());
}

#[rstest]
#[tokio::test]
async fn test_publish_failure_annotation_round_trip(memory_store: MemoryStore) {
    run_test_publish_failure_annotation_round_trip(&memory_store).await;
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_publish_failure_annotation_round_trip_postgres(pool: sqlx::PgPool) {
    run_test_publish_failure_annotation_round_trip(&PostgresStore::new(pool)).await;
}

async fn run_test_status_listing_filters<S: Store>(store: &S) {
    let pending = sample_request();
    store.insert_breeding_request(&pending).await.unwrap();

    let failed = sample_request();
    store.insert_breeding_request(&failed).await.unwrap();
    store.claim(ServiceType::Breeding, failed.request_id).await.unwrap();
    store
        .mark_failed(ServiceType::Breeding, failed.request_id, "boom")
        .await
        .unwrap();

    let rows = store
        .breeding_requests_with_status(&[RequestStatus::Pending, RequestStatus::Failed])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let only_failed = store
        .breeding_requests_with_status(&[RequestStatus::Failed])
        .await
        .unwrap();
    assert_eq!(only_failed.len(), 1);
    assert_eq!(only_failed[0].request_id, failed.request_id);
}

#[rstest]
#[tokio::test]
async fn test_status_listing_filters(memory_store: MemoryStore) {
    run_test_status_listing_filters(&memory_store).await;
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_status_listing_filters_postgres(pool: sqlx::PgPool) {
    run_test_status_listing_filters(&PostgresStore::new(pool)).await;
}

#[rstest]
#[tokio::test]
async fn test_complete_breeding_is_atomic_and_terminal(memory_store: MemoryStore) {
    let sire = sample_horse(Uuid::new_v4());
    let dam = sample_horse(Uuid::new_v4());
    memory_store.insert_horse(sire.clone(), vec![]);
    memory_store.insert_horse(dam.clone(), vec![]);

    let request = BreedingRequest::new(Uuid::new_v4(), sire.id, dam.id, Uuid::new_v4());
    memory_store.insert_breeding_request(&request).await.unwrap();
    memory_store
        .claim(ServiceType::Breeding, request.request_id)
        .await
        .unwrap();

    let foal_id = memory_store
        .complete_breeding(
            request.request_id,
            sample_foal(sire.id, dam.id, request.owner_id),
        )
        .await
        .unwrap();

    let row = memory_store
        .breeding_request(request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.foal_id, Some(foal_id));
    assert!(row.processed_date.is_some());

    let foal = memory_store.horse(foal_id).await.unwrap().unwrap();
    assert_eq!(foal.sire_id, Some(sire.id));
    assert_eq!(foal.parented, 0);
    assert_eq!(foal.happiness, 50);

    let sire_after = memory_store.horse(sire.id).await.unwrap().unwrap();
    assert_eq!(sire_after.parented, 1);

    // A second completion must refuse the terminal row.
    let err = memory_store
        .complete_breeding(
            request.request_id,
            sample_foal(sire.id, dam.id, request.owner_id),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StablehandError::InvalidState(..)));
}

#[sqlx::test]
#[ignore = "requires a PostgreSQL database"]
async fn test_complete_breeding_is_atomic_and_terminal_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    let sire = sample_horse(Uuid::new_v4());
    let dam = sample_horse(Uuid::new_v4());
    store.insert_horse(&sire, &[]).await.unwrap();
    store.insert_horse(&dam, &[]).await.unwrap();

    let request = BreedingRequest::new(Uuid::new_v4(), sire.id, dam.id, Uuid::new_v4());
    store.insert_breeding_request(&request).await.unwrap();
    store.claim(ServiceType::Breeding, request.request_id).await.unwrap();

    let foal_id = store
        .complete_breeding(
            request.request_id,
            sample_foal(sire.id, dam.id, request.owner_id),
        )
        .await
        .unwrap();

    let row = store
        .breeding_request(request.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.foal_id, Some(foal_id));

    let sire_after = store.horse(sire.id).await.unwrap().unwrap();
    assert_eq!(sire_after.parented, 1);

    let err = store
        .complete_breeding(
            request.request_id,
            sample_foal(sire.id, dam.id, request.owner_id),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StablehandError::InvalidState(..)));
}

#[rstest]
#[tokio::test]
async fn test_feeding_preference_recorded_on_first_taste(memory_store: MemoryStore) {
    let horse = sample_horse(Uuid::new_v4());
    memory_store.insert_horse(horse.clone(), vec![]);
    memory_store.seed_feeding(crate::domain::Feeding {
        id: 3,
        name: "Carrots".to_string(),
        happiness_effect: 6,
    });

    let request = crate::requests::FeedingRequest::new(
        Uuid::new_v4(),
        horse.id,
        3,
        Uuid::new_v4(),
        Uuid::new_v4(),
    );
    memory_store.insert_feeding_request(&request).await.unwrap();
    memory_store
        .claim(ServiceType::Feeding, request.request_id)
        .await
        .unwrap();

    memory_store
        .complete_feeding(
            request.request_id,
            FeedingOutcome {
                session_id: request.session_id,
                horse_id: horse.id,
                feeding_id: 3,
                user_id: request.user_id,
                response: crate::domain::FeedResponse::Liked,
                happiness_delta: 9,
                new_happiness: 89,
                record_preference: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        memory_store
            .feeding_preference(horse.id, 3)
            .await
            .unwrap(),
        Some(crate::domain::FeedResponse::Liked)
    );
    let after = memory_store.horse(horse.id).await.unwrap().unwrap();
    assert_eq!(after.happiness, 89);
    assert_eq!(memory_store.feeding_sessions().len(), 1);
}
