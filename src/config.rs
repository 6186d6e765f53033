//! TOML configuration with per-section defaults.
//!
//! Every field is defaulted, so an empty or missing file yields a working
//! configuration. `twinmind config schema` prints the JSON schema.

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "TWINMIND_CONFIG";

/// Environment fallback for the Gemini API key.
pub const GEMINI_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Directory holding the SQLite files. Defaults to the platform data dir.
    pub data_dir: Option<String>,
    pub router: RouterConfig,
    pub verifier: VerifierConfig,
    pub outcome: OutcomeConfig,
    pub evolution: EvolutionConfig,
    pub providers: ProvidersConfig,
    pub knowledge: KnowledgeConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

// ── Router ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RouterConfig {
    /// Classifications below this confidence are routed to the deep path.
    pub confidence_threshold: f64,
    /// Bound on the classifier call.
    pub classify_timeout_ms: u64,
    /// Hard timeout on fast-path generation.
    pub fast_timeout_ms: u64,
    /// Finite timeout on each deep-path generation attempt.
    pub deep_timeout_secs: u64,
    /// Delay before an outcome-log append is retried in the background.
    pub log_retry_delay_ms: u64,
    /// Background retry attempts for a failed outcome-log append.
    pub log_retry_attempts: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            classify_timeout_ms: 100,
            fast_timeout_ms: 200,
            deep_timeout_secs: 60,
            log_retry_delay_ms: 500,
            log_retry_attempts: 3,
        }
    }
}

// ── Verifier ─────────────────────────────────────────────────────

/// A topic category where unsupported claims are unacceptable.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DomainConfig {
    pub name: String,
    /// Case-insensitive regular expressions; a sentence matching any of them
    /// is a claim in this domain.
    pub patterns: Vec<String>,
    /// Per-domain override of `verifier.similarity_threshold`.
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VerifierConfig {
    /// Minimum normalized similarity for a passage to support a claim.
    pub similarity_threshold: f64,
    pub domains: Vec<DomainConfig>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.75,
            domains: default_domains(),
        }
    }
}

fn default_domains() -> Vec<DomainConfig> {
    vec![
        DomainConfig {
            name: "pricing".into(),
            patterns: vec![
                r"[$€£]\s?\d".into(),
                r"\bpric(e|es|ed|ing)\b".into(),
                r"\btier\b".into(),
                r"\bdiscount".into(),
                r"\bper (seat|user|month|year)\b".into(),
            ],
            similarity_threshold: None,
        },
        DomainConfig {
            name: "brand".into(),
            patterns: vec![
                r"\bbrand".into(),
                r"\blogo\b".into(),
                r"\btagline\b".into(),
                r"\btrademark".into(),
                r"\bcolou?r palette\b".into(),
            ],
            similarity_threshold: None,
        },
        DomainConfig {
            name: "legal".into(),
            patterns: vec![
                r"\blegal(ly)?\b".into(),
                r"\bcomplian(ce|t)\b".into(),
                r"\bcontract".into(),
                r"\bliabilit".into(),
                r"\bgdpr\b".into(),
                r"\bterms of service\b".into(),
            ],
            similarity_threshold: None,
        },
    ]
}

// ── Outcome log ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OutcomeConfig {
    /// Dispositions are only accepted this long after the record was written.
    pub grace_window_hours: u32,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            grace_window_hours: 24,
        }
    }
}

// ── Evolution loop ───────────────────────────────────────────────

/// A recurring correction the evolution loop can address.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CorrectionPatternConfig {
    pub id: String,
    /// Case-insensitive keywords matched against edit notes and directives.
    pub keywords: Vec<String>,
    /// Sentence appended to the operating instructions.
    pub amendment: String,
    /// Optional change to the router confidence threshold.
    #[serde(default)]
    pub threshold_delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EvolutionConfig {
    pub enabled: bool,
    /// Cron expression (with seconds) for the scheduled cycle.
    pub schedule: String,
    /// IANA timezone for the schedule; host local time when unset.
    pub timezone: Option<String>,
    /// Fewer qualifying records than this makes the cycle a no-op.
    pub min_samples: usize,
    /// Cycles whose rejection rate is below this are no-ops.
    pub min_rejection_rate: f64,
    /// Upper bound for threshold amendments.
    pub max_confidence_threshold: f64,
    /// Extra correction patterns, checked after the built-in catalogue.
    pub patterns: Vec<CorrectionPatternConfig>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 0 3 * * *".into(),
            timezone: None,
            min_samples: 5,
            min_rejection_rate: 0.15,
            max_confidence_threshold: 0.95,
            patterns: Vec::new(),
        }
    }
}

// ── Model providers ──────────────────────────────────────────────

/// Which classifier backs `ModelGateway::classify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Local keyword heuristics, no model call.
    Keyword,
    /// Small local model via Ollama.
    Slm,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProvidersConfig {
    pub ollama_url: String,
    pub fast_model: String,
    pub classifier_model: String,
    /// Local model for the deep path when no Gemini key is available.
    pub deep_model: String,
    pub classifier: ClassifierKind,
    /// Falls back to `GEMINI_API_KEY`.
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://127.0.0.1:11434".into(),
            fast_model: "llama3".into(),
            classifier_model: "qwen3:0.6b".into(),
            deep_model: "qwen3:8b".into(),
            classifier: ClassifierKind::Keyword,
            gemini_api_key: None,
            gemini_model: "gemini-2.5-flash".into(),
        }
    }
}

impl ProvidersConfig {
    /// Configured key, else the environment fallback. Empty keys count as unset.
    pub fn resolved_gemini_key(&self) -> Option<String> {
        self.gemini_api_key
            .clone()
            .or_else(|| std::env::var(GEMINI_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

// ── Knowledge store ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Directory of reference documents loaded at startup.
    pub dir: Option<String>,
    pub max_document_chars: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_document_chars: 5000,
        }
    }
}

// ── Server / logging ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LogConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Load from an explicit path, `$TWINMIND_CONFIG`, or the platform
    /// config dir. A missing default file yields defaults; a missing
    /// explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (Some(p.to_path_buf()), true),
            None => match std::env::var(CONFIG_ENV) {
                Ok(p) if !p.trim().is_empty() => (Some(PathBuf::from(p)), true),
                _ => (Self::default_path(), false),
            },
        };

        let config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Invalid config: {}", path.display()))?
            }
            Some(path) if required => {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            _ => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// `<platform config dir>/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "twinmind", "twinmind")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Resolved data directory (expanded, not yet created).
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(expand_path(dir));
        }
        directories::ProjectDirs::from("dev", "twinmind", "twinmind")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine a data directory; set data_dir in config")
    }

    /// Resolved knowledge directory, if configured.
    pub fn knowledge_dir(&self) -> Option<PathBuf> {
        self.knowledge.dir.as_deref().map(expand_path)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("{name} must be within [0, 1], got {v}");
            }
            Ok(())
        };

        unit("router.confidence_threshold", self.router.confidence_threshold)?;
        unit("verifier.similarity_threshold", self.verifier.similarity_threshold)?;
        unit("evolution.min_rejection_rate", self.evolution.min_rejection_rate)?;
        unit(
            "evolution.max_confidence_threshold",
            self.evolution.max_confidence_threshold,
        )?;
        for domain in &self.verifier.domains {
            if let Some(t) = domain.similarity_threshold {
                unit(&format!("verifier.domains.{}.similarity_threshold", domain.name), t)?;
            }
        }

        if self.router.fast_timeout_ms == 0
            || self.router.classify_timeout_ms == 0
            || self.router.deep_timeout_secs == 0
        {
            anyhow::bail!("router timeouts must be greater than zero");
        }
        if self.evolution.min_samples == 0 {
            anyhow::bail!("evolution.min_samples must be at least 1");
        }
        Ok(())
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!((config.router.confidence_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.router.fast_timeout_ms, 200);
        assert_eq!(config.router.deep_timeout_secs, 60);
        assert!((config.verifier.similarity_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.outcome.grace_window_hours, 24);
        assert_eq!(config.evolution.min_samples, 5);
        assert_eq!(config.verifier.domains.len(), 3);
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [router]
            confidence_threshold = 0.7

            [[verifier.domains]]
            name = "pricing"
            patterns = ["\\$\\d"]
            similarity_threshold = 0.9
            "#,
        )
        .unwrap();
        assert!((config.router.confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.router.fast_timeout_ms, 200);
        assert_eq!(config.verifier.domains.len(), 1);
        assert_eq!(config.verifier.domains[0].similarity_threshold, Some(0.9));
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.router.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.router.fast_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_explicit_missing_file_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn load_explicit_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "data_dir = \"/tmp/twinmind-test\"\n[server]\nport = 8080\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/twinmind-test"));
    }

    #[test]
    fn schema_mentions_sections() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("confidence_threshold"));
        assert!(schema.contains("similarity_threshold"));
    }
}
