//! The per-cycle decision pipeline: gate evaluation, drought resolution,
//! adaptive threshold tuning, and the orchestrator that ties them to the
//! ledger and the execution collaborator.

pub mod cycle;
pub mod drought;
pub mod gates;
pub mod tuner;

pub use cycle::{CycleOrchestrator, CycleOutcome};
pub use drought::DroughtResolver;
pub use gates::ThresholdSet;
pub use tuner::AdaptiveTuner;
