//! EvoBot Backend Library
//!
//! Exposes the full engine for use by the CLI binary and integration tests:
//! the ledger, the decision pipeline, fitness scoring, generation lifecycle,
//! and the live-capital safety path.

pub mod breeding;
pub mod config;
pub mod engine;
pub mod execution;
pub mod fitness;
pub mod ledger;
pub mod lifecycle;
pub mod live;
pub mod market;
pub mod models;

pub use config::AppConfig;
pub use engine::{CycleOrchestrator, CycleOutcome};
pub use fitness::FitnessEngine;
pub use ledger::LedgerDb;
pub use lifecycle::LifecycleManager;
