//! Outcome log: durable, append-mostly record of every completed directive
//! and the user's reaction to it. Input of the evolution loop.

pub mod cursor;
pub mod retry;
pub mod store;

pub use cursor::{Checkpoint, OutcomeCursor};
pub use retry::RetryQueue;
pub use store::OutcomeLog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directive::{
    truncate_chars, Directive, Disposition, ExecutionPath, Intent, RoutedResult, VerificationStatus,
};

/// Stored summaries keep this many characters of the result content.
pub const SUMMARY_MAX_CHARS: usize = 500;

/// One row per completed directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Log sequence number; 0 until appended.
    #[serde(default)]
    pub seq: i64,
    pub directive_id: Uuid,
    pub directive_text: String,
    pub path: ExecutionPath,
    pub intent: Intent,
    pub confidence: f64,
    pub verification_status: VerificationStatus,
    pub latency_ms: u64,
    pub content_summary: String,
    /// Released with an unverified/degraded caveat.
    pub caveated: bool,
    pub deep_attempts: u8,
    pub instructions_version: u64,
    pub disposition: Disposition,
    /// Free-text description of the user's edit, when one was observed.
    pub edit_note: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub disposition_at: Option<DateTime<Utc>>,
}

impl OutcomeRecord {
    /// Summary of a routed result, disposition `unknown`, stamped now.
    pub fn from_result(directive: &Directive, result: &RoutedResult) -> Self {
        Self {
            seq: 0,
            directive_id: directive.id(),
            directive_text: directive.text().to_string(),
            path: result.path,
            intent: result.intent,
            confidence: result.confidence,
            verification_status: result.verification_status,
            latency_ms: result.latency_ms,
            content_summary: truncate_chars(&result.content, SUMMARY_MAX_CHARS),
            caveated: result.caveat.is_some(),
            deep_attempts: result.deep_attempts,
            instructions_version: result.instructions_version,
            disposition: Disposition::Unknown,
            edit_note: None,
            recorded_at: Utc::now(),
            disposition_at: None,
        }
    }
}

/// Append side of the outcome log, as seen by the router.
///
/// Appends are blocking; callers on the async path run them on the blocking
/// pool. Appending a directive id that is already present is a no-op so a
/// retried append cannot duplicate a record.
pub trait OutcomeSink: Send + Sync {
    fn append(&self, record: &OutcomeRecord) -> anyhow::Result<()>;
}
