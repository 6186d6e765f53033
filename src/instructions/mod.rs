//! Versioned operating instructions: the document that sets the router's
//! tie-break threshold and the generators' system prompt.

pub mod document;
pub mod store;

pub use document::{FrontMatter, OperatingInstructions};
pub use store::{InstructionsBackend, InstructionsMeta, InstructionsStore, SqliteInstructionsBackend};
