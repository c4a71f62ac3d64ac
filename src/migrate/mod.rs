//! Legacy -> partitioned migration: the durable plan document and the
//! coordinator that advances it.

pub mod plan;
pub mod service;

pub use plan::{IntervalStatus, MigrationInterval, MigrationPlan, MigrationVenue};
pub use service::{DiskEstimate, MigrationOutcome, MigrationService, VerifyReport};
