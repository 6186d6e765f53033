//! Self-evolution loop: mines finalized outcomes for recurring correction
//! patterns and publishes amended operating instructions.

pub mod cycle;
pub mod ledger;
pub mod patterns;
pub mod scheduler;

pub use cycle::{CycleOutcome, CyclePhase, EvolutionLoop, NoOpReason};
pub use ledger::{CycleRecord, CycleStatus, EvolutionLedger};
pub use patterns::{builtin_patterns, CorrectionPattern, PatternCatalogue, PatternFinding};
pub use scheduler::{next_fire, parse_schedule, spawn_scheduler, ScheduleZone};
