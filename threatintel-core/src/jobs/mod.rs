//! Job descriptors and their persistence.

pub mod record;
pub mod store;

pub use record::{IntervalUnit, JobRecord, JobState, Schedule, UpdateStats};
pub use store::JobStore;
