//! Bifurcated router: classify, dispatch to the fast or deep path, gate
//! deep output on grounding, log the outcome.

pub mod bifurcated;
pub mod prompt;

pub use bifurcated::BifurcatedRouter;
pub use prompt::{PromptContext, PromptSection, SystemPromptBuilder};
