use thiserror::Error;
use uuid::Uuid;

use crate::directive::ExecutionPath;

/// Typed failures of the decision engine.
///
/// Classification errors are recovered inside the router by defaulting to the
/// deep path; generation and verification errors degrade into flagged
/// results; log and commit errors stay internal. Only the operational
/// variants at the bottom ever reach a caller of `submit_directive`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("classification timed out after {0} ms")]
    ClassificationTimeout(u64),

    #[error("classifier returned malformed output: {0}")]
    ClassificationMalformed(String),

    #[error("{path} path generation failed: {reason}")]
    GenerationFailure { path: ExecutionPath, reason: String },

    #[error("unsupported constrained-domain claims: {}", .0.join("; "))]
    VerificationUnsupported(Vec<String>),

    #[error("outcome log write failed: {0}")]
    LogWriteFailure(String),

    #[error("operating instructions commit failed: {0}")]
    InstructionsCommitFailure(String),

    #[error("insufficient evidence: {found} qualifying records, {required} required")]
    InsufficientEvidence { found: usize, required: usize },

    #[error("directive text is empty")]
    EmptyDirective,

    #[error("directive processing cancelled")]
    Cancelled,

    #[error("no outcome recorded for directive {0}")]
    UnknownDirective(Uuid),

    #[error("disposition for directive {0} is already final")]
    DispositionFinal(Uuid),

    #[error("disposition window closed for directive {0}")]
    DispositionWindowClosed(Uuid),

    #[error("operating instructions version {0} does not exist")]
    UnknownVersion(u64),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClassificationTimeout(_) => "classification_timeout",
            Self::ClassificationMalformed(_) => "classification_malformed",
            Self::GenerationFailure { .. } => "generation_failure",
            Self::VerificationUnsupported(_) => "verification_unsupported",
            Self::LogWriteFailure(_) => "log_write_failure",
            Self::InstructionsCommitFailure(_) => "instructions_commit_failure",
            Self::InsufficientEvidence { .. } => "insufficient_evidence",
            Self::EmptyDirective => "empty_directive",
            Self::Cancelled => "cancelled",
            Self::UnknownDirective(_) => "unknown_directive",
            Self::DispositionFinal(_) => "disposition_final",
            Self::DispositionWindowClosed(_) => "disposition_window_closed",
            Self::UnknownVersion(_) => "unknown_version",
            Self::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
