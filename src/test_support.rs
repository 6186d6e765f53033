//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::directive::{Disposition, ExecutionPath, Intent, VerificationStatus};
use crate::instructions::{InstructionsBackend, OperatingInstructions, SqliteInstructionsBackend};
use crate::knowledge::{Document, KnowledgeStore, LexicalKnowledgeStore};
use crate::outcome::{OutcomeRecord, OutcomeSink};
use crate::providers::{DeepContext, DeepGeneration, FastGeneration, IntentVerdict, ModelGateway};

// ── Records ──────────────────────────────────────────────────────

/// Approved deep result with an unknown disposition.
pub(crate) fn outcome_record(text: &str, recorded_at: DateTime<Utc>) -> OutcomeRecord {
    OutcomeRecord {
        seq: 0,
        directive_id: Uuid::new_v4(),
        directive_text: text.to_string(),
        path: ExecutionPath::Deep,
        intent: Intent::Strategy,
        confidence: 0.9,
        verification_status: VerificationStatus::Approved,
        latency_ms: 1200,
        content_summary: format!("answer to {text}"),
        caveated: false,
        deep_attempts: 1,
        instructions_version: 1,
        disposition: Disposition::Unknown,
        edit_note: None,
        recorded_at,
        disposition_at: None,
    }
}

/// Outcome sink that fails a fixed number of appends before succeeding.
pub(crate) struct FlakySink {
    failures_left: AtomicUsize,
    written: Mutex<Vec<OutcomeRecord>>,
}

impl FlakySink {
    pub(crate) fn failing_first(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            written: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub(crate) fn written(&self) -> Vec<OutcomeRecord> {
        self.written.lock().clone()
    }
}

impl OutcomeSink for FlakySink {
    fn append(&self, record: &OutcomeRecord) -> anyhow::Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n.saturating_sub(1)))
            .is_ok();
        if failing {
            anyhow::bail!("disk I/O error");
        }
        self.written.lock().push(record.clone());
        Ok(())
    }
}

// ── Instructions ─────────────────────────────────────────────────

/// In-memory SQLite backend whose writes can be switched to fail.
pub(crate) struct FailingInstructionsBackend {
    inner: SqliteInstructionsBackend,
    failing: AtomicBool,
}

impl FailingInstructionsBackend {
    pub(crate) fn new() -> Self {
        Self {
            inner: SqliteInstructionsBackend::in_memory().unwrap(),
            failing: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        Ok(())
    }
}

impl InstructionsBackend for FailingInstructionsBackend {
    fn active_version(&self) -> anyhow::Result<Option<u64>> {
        self.inner.active_version()
    }

    fn latest_version(&self) -> anyhow::Result<u64> {
        self.inner.latest_version()
    }

    fn get(&self, version: u64) -> anyhow::Result<Option<OperatingInstructions>> {
        self.inner.get(version)
    }

    fn list(&self) -> anyhow::Result<Vec<OperatingInstructions>> {
        self.inner.list()
    }

    fn insert_and_activate(&self, doc: &OperatingInstructions) -> anyhow::Result<()> {
        self.check()?;
        self.inner.insert_and_activate(doc)
    }

    fn set_active(&self, version: u64) -> anyhow::Result<()> {
        self.check()?;
        self.inner.set_active(version)
    }
}

// ── Knowledge ────────────────────────────────────────────────────

/// Store holding a two-line `pricing.pdf`.
pub(crate) async fn pricing_store() -> Arc<dyn KnowledgeStore> {
    let store = LexicalKnowledgeStore::new();
    store
        .ingest(Document {
            id: "pricing.pdf".into(),
            text: "Pro tier is $49 per seat per month.\nEnterprise tier is $25k per year.\n".into(),
        })
        .await
        .unwrap();
    Arc::new(store)
}

// ── Model gateway ────────────────────────────────────────────────

/// One scripted generation.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Reply(String),
    Fail(String),
    Slow(Duration, String),
}

impl Step {
    pub(crate) fn reply(content: &str) -> Self {
        Self::Reply(content.into())
    }

    pub(crate) fn fail(reason: &str) -> Self {
        Self::Fail(reason.into())
    }

    pub(crate) fn slow(delay: Duration, content: &str) -> Self {
        Self::Slow(delay, content.into())
    }

    async fn run(self) -> anyhow::Result<String> {
        match self {
            Self::Reply(content) => Ok(content),
            Self::Fail(reason) => anyhow::bail!("{reason}"),
            Self::Slow(delay, content) => {
                tokio::time::sleep(delay).await;
                Ok(content)
            }
        }
    }
}

/// Gateway that replays scripted verdicts and generations in order.
pub(crate) struct ScriptedGateway {
    verdict: IntentVerdict,
    /// Verdicts for specific directive texts, checked before `verdict`.
    verdicts_by_text: Vec<(String, IntentVerdict)>,
    classify_delay: Option<Duration>,
    fast: Mutex<VecDeque<Step>>,
    deep: Mutex<VecDeque<Step>>,
    fast_calls: AtomicUsize,
    deep_contexts: Mutex<Vec<DeepContext>>,
}

impl ScriptedGateway {
    pub(crate) fn classifying(label: &str, confidence: f64) -> Self {
        Self {
            verdict: IntentVerdict {
                label: label.into(),
                confidence,
            },
            verdicts_by_text: Vec::new(),
            classify_delay: None,
            fast: Mutex::new(VecDeque::new()),
            deep: Mutex::new(VecDeque::new()),
            fast_calls: AtomicUsize::new(0),
            deep_contexts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn classifying_text(mut self, text: &str, label: &str, confidence: f64) -> Self {
        self.verdicts_by_text.push((
            text.into(),
            IntentVerdict {
                label: label.into(),
                confidence,
            },
        ));
        self
    }

    pub(crate) fn classify_delay(mut self, delay: Duration) -> Self {
        self.classify_delay = Some(delay);
        self
    }

    pub(crate) fn fast(self, step: Step) -> Self {
        self.fast.lock().push_back(step);
        self
    }

    pub(crate) fn deep(self, step: Step) -> Self {
        self.deep.lock().push_back(step);
        self
    }

    pub(crate) fn fast_calls(&self) -> usize {
        self.fast_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn deep_calls(&self) -> usize {
        self.deep_contexts.lock().len()
    }

    pub(crate) fn deep_contexts(&self) -> Vec<DeepContext> {
        self.deep_contexts.lock().clone()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn classify(&self, text: &str) -> anyhow::Result<IntentVerdict> {
        if let Some(delay) = self.classify_delay {
            tokio::time::sleep(delay).await;
        }
        let verdict = self
            .verdicts_by_text
            .iter()
            .find(|(t, _)| t == text)
            .map_or(&self.verdict, |(_, v)| v);
        Ok(verdict.clone())
    }

    async fn generate_fast(&self, _text: &str, _system_prompt: &str) -> anyhow::Result<FastGeneration> {
        self.fast_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.fast.lock().pop_front();
        let content = step.unwrap_or_else(|| Step::fail("fast script exhausted")).run().await?;
        Ok(FastGeneration {
            content,
            latency_ms: 5,
        })
    }

    async fn generate_deep(&self, _text: &str, context: &DeepContext) -> anyhow::Result<DeepGeneration> {
        self.deep_contexts.lock().push(context.clone());
        let step = self.deep.lock().pop_front();
        let content = step.unwrap_or_else(|| Step::fail("deep script exhausted")).run().await?;
        Ok(DeepGeneration {
            content,
            trace: "scripted reasoning".into(),
            latency_ms: 50,
        })
    }
}
