use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const FRONT_MATTER_DELIMITER: &str = "+++";
const AMENDMENTS_HEADING: &str = "## Amendments";

/// Body of version 1, seeded into an empty store.
pub const SEED_BODY: &str = "\
You are TwinMind, the decision engine of a small business.

- Answer quick questions directly and briefly.
- For strategic requests, reason step by step before answering.
- State prices, brand rules and legal terms only as they appear in the reference documents.
- When a figure is not in the reference documents, say so instead of guessing.";

pub const SEED_RATIONALE: &str = "initial operating instructions";

/// Keys recognised in the TOML front matter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontMatter {
    /// Overrides `router.confidence_threshold` while this version is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
}

/// One immutable version of the operating instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingInstructions {
    pub version: u64,
    /// Markdown, optionally preceded by a `+++` TOML front matter block.
    pub content: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl OperatingInstructions {
    /// Split content into front matter and body. Unparseable front matter
    /// is ignored with a warning rather than failing the serving path.
    pub fn parts(&self) -> (FrontMatter, &str) {
        split_front_matter(&self.content)
    }

    pub fn body(&self) -> &str {
        self.parts().1
    }

    pub fn confidence_threshold(&self) -> Option<f64> {
        self.parts()
            .0
            .confidence_threshold
            .filter(|t| (0.0..=1.0).contains(t))
    }

    /// Whether the body already carries `amendment`.
    pub fn has_amendment(&self, amendment: &str) -> bool {
        self.body().contains(amendment.trim())
    }

    /// Same body with the threshold override replaced.
    pub fn with_threshold(&self, threshold: f64) -> String {
        let (mut front, body) = self.parts();
        front.confidence_threshold = Some(threshold);
        render(&front, body)
    }

    /// Content of the next version: this body plus one amendment bullet,
    /// and the threshold override when given.
    pub fn amended(&self, amendment: &str, next_version: u64, threshold: Option<f64>) -> String {
        let (mut front, body) = self.parts();
        if threshold.is_some() {
            front.confidence_threshold = threshold;
        }

        let mut body = body.trim_end().to_string();
        if !body.contains(AMENDMENTS_HEADING) {
            body.push_str("\n\n");
            body.push_str(AMENDMENTS_HEADING);
            body.push('\n');
        }
        body.push_str(&format!("\n- (v{next_version}) {}", amendment.trim()));
        render(&front, &body)
    }
}

pub(crate) fn split_front_matter(content: &str) -> (FrontMatter, &str) {
    let Some(rest) = content.strip_prefix(FRONT_MATTER_DELIMITER) else {
        return (FrontMatter::default(), content);
    };
    let rest = rest.trim_start_matches([' ', '\t']);
    let Some(rest) = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n")) else {
        return (FrontMatter::default(), content);
    };
    let Some(end) = rest.find(&format!("\n{FRONT_MATTER_DELIMITER}")) else {
        return (FrontMatter::default(), content);
    };

    let raw = &rest[..end];
    let after = &rest[end + 1 + FRONT_MATTER_DELIMITER.len()..];
    let body = after.trim_start_matches(['\r', '\n']);
    match toml::from_str::<FrontMatter>(raw) {
        Ok(front) => (front, body),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unparseable instructions front matter");
            (FrontMatter::default(), body)
        }
    }
}

pub(crate) fn render(front: &FrontMatter, body: &str) -> String {
    if front == &FrontMatter::default() {
        return body.to_string();
    }
    let toml = toml::to_string(front).unwrap_or_default();
    format!(
        "{FRONT_MATTER_DELIMITER}\n{}\n{FRONT_MATTER_DELIMITER}\n\n{}",
        toml.trim_end(),
        body
    )
}
