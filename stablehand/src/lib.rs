//! Back-end workers for the stable game: breeding, feeding, training, and
//! racing requests flow from the front-end API through a message bus into
//! the processors here.
//!
//! The moving parts:
//!
//! - [`requests`] — durable request records with the
//!   `Pending -> InProgress -> Completed | Failed` state machine.
//! - [`lifecycle`] — the claim-and-process engine every domain runs;
//!   idempotent under at-least-once delivery.
//! - [`processors`] — the four domain processors (the work under the
//!   lifecycle), including the breeding genetics.
//! - [`store`] — storage traits with PostgreSQL and in-memory backends;
//!   completions are single transactions.
//! - [`replay`] — operator tooling to republish non-terminal requests.
//! - [`reaper`] — recovery for rows stuck `InProgress` after a crash.
//!
//! The bus itself (broker adapters, routing publisher, consumers) lives in
//! the `furlong` crate.

pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod messages;
pub mod processors;
pub mod reaper;
pub mod replay;
pub mod requests;
pub mod store;

pub use config::{Args, Config};
pub use error::{Result, StablehandError};
pub use lifecycle::{DomainWork, RequestProcessor};
pub use processors::{
    BreedingProcessor, FeedingProcessor, NameGenerator, RacingProcessor, RandomNameGenerator,
    TrainingProcessor,
};
pub use reaper::StuckRequestReaper;
pub use replay::{ReplayAllOptions, ReplayController, ReplayOutcome};
pub use requests::{RequestStatus, ServiceType, PUBLISH_FAILED_PREFIX};
pub use store::{MemoryStore, PostgresStore, Store};
