//! Core data model: directives, classifications, routed results and citations.
//!
//! The fast/deep bifurcation is a tagged variant ([`ExecutionPath`]) carried
//! by one uniform [`RoutedResult`] shape; there is no per-path result type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Directive ────────────────────────────────────────────────────

/// A single user-submitted task or query. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    id: Uuid,
    text: String,
    submitted_at: DateTime<Utc>,
}

impl Directive {
    /// Create a directive with a fresh id, stamped now.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

// ── Intent classification ────────────────────────────────────────

/// Intent label produced by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Shallow request answerable by the fast path.
    Quick,
    /// Strategic request that needs deep reasoning and grounding.
    Strategy,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Strategy => "strategy",
        }
    }

    /// Parse a raw classifier label. Accepts a few aliases emitted by small
    /// models; anything else is `None` (malformed).
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "quick" | "quick_action" | "fast" | "cortex" => Some(Self::Quick),
            "strategy" | "strategic" | "deep" | "deep_mind" => Some(Self::Strategy),
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of intent analysis on a directive. Not persisted beyond the
/// routing decision except as audit fields of the outcome record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub directive_id: Uuid,
    pub intent: Intent,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

// ── Execution path ───────────────────────────────────────────────

/// Which execution path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    /// Low-latency, shallow-reasoning route (the cortex).
    Fast,
    /// Multi-step reasoning route (the deep mind), always verified.
    Deep,
}

impl ExecutionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Deep => "deep",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "fast" => Self::Fast,
            _ => Self::Deep,
        }
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Verification ─────────────────────────────────────────────────

/// Verification state of a routed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Fast-path results are never verified.
    NotApplicable,
    /// Every constrained-domain claim is cited.
    Approved,
    /// At least one constrained-domain claim lacks support.
    Rejected,
    /// Approved on the single regeneration attempt.
    Regenerated,
}

impl VerificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotApplicable => "not_applicable",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Regenerated => "regenerated",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "regenerated" => Self::Regenerated,
            _ => Self::NotApplicable,
        }
    }
}

/// Position of a supporting passage inside a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocator {
    /// 1-based page number, when the source is paginated.
    pub page: Option<u32>,
    /// 1-based first line of the passage.
    pub line_start: u32,
    /// 1-based last line of the passage (inclusive).
    pub line_end: u32,
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(page) = self.page {
            write!(f, "p.{page} ")?;
        }
        if self.line_start == self.line_end {
            write!(f, "L{}", self.line_start)
        } else {
            write!(f, "L{}-{}", self.line_start, self.line_end)
        }
    }
}

/// A claim-to-source link produced during verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub claim: String,
    pub source_id: String,
    pub locator: SourceLocator,
    /// Match confidence in [0, 1].
    pub confidence: f64,
}

// ── Routed result ────────────────────────────────────────────────

/// Outcome of executing a directive on a chosen path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedResult {
    pub directive_id: Uuid,
    pub path: ExecutionPath,
    /// Intent the router acted on (after tie-break and failure defaults).
    pub intent: Intent,
    /// Raw classifier confidence; 0.0 when classification failed.
    pub confidence: f64,
    pub content: String,
    pub latency_ms: u64,
    /// Present only for `deep` results.
    pub reasoning_trace: Option<String>,
    pub verification_status: VerificationStatus,
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Claims outside constrained domains that no source supports.
    #[serde(default)]
    pub unverified_claims: Vec<String>,
    /// Visible disclaimer when a deep result is released without full
    /// grounding. Also appended to `content`.
    pub caveat: Option<String>,
    /// Number of generation calls made on the deep path (0..=2).
    pub deep_attempts: u8,
    /// Operating-instructions version active when the directive was routed.
    pub instructions_version: u64,
}

impl RoutedResult {
    /// Whether the result is approved with every constrained claim cited.
    pub fn is_fully_grounded(&self) -> bool {
        matches!(
            self.verification_status,
            VerificationStatus::Approved | VerificationStatus::Regenerated
        ) && self.caveat.is_none()
    }
}

// ── Disposition ──────────────────────────────────────────────────

/// User reaction to a delivered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accepted,
    Rejected,
    Unknown,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::str::FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" | "accept" => Ok(Self::Accepted),
            "rejected" | "reject" => Ok(Self::Rejected),
            other => Err(format!("unknown disposition '{other}' (expected accepted|rejected)")),
        }
    }
}

/// Truncate text to at most `max_chars` characters, appending "..." when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
