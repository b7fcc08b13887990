//! Domain processors, one per game action. All of them run under the
//! lifecycle engine in [`crate::lifecycle`]; only the `execute` step differs.

pub mod breeding;
pub mod feeding;
pub mod names;
pub mod racing;
pub mod training;

pub use breeding::BreedingProcessor;
pub use feeding::FeedingProcessor;
pub use names::{NameGenerator, RandomNameGenerator};
pub use racing::RacingProcessor;
pub use training::TrainingProcessor;
