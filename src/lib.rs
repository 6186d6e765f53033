pub mod api;
pub mod config;
pub mod directive;
pub mod engine;
pub mod error;
pub mod evolution;
pub mod instructions;
pub mod knowledge;
pub mod outcome;
pub mod providers;
pub mod router;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use directive::{Directive, Disposition, ExecutionPath, Intent, RoutedResult, VerificationStatus};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
