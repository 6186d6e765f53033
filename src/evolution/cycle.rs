use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

use crate::config::EvolutionConfig;
use crate::directive::Disposition;
use crate::error::{EngineError, EngineResult};
use crate::instructions::{InstructionsStore, OperatingInstructions};
use crate::outcome::{OutcomeLog, OutcomeRecord};

use super::ledger::{CycleRecord, CycleStatus, EvolutionLedger};
use super::patterns::PatternCatalogue;

/// Phase of the evolution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Collecting,
    Analyzing,
    Proposing,
    Committing,
}

/// Why a cycle produced no new version.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoOpReason {
    InsufficientEvidence { found: usize, required: usize },
    AcceptanceHealthy { rejection_rate: f64 },
    NoPattern,
    AlreadyAmended { pattern: String },
    CycleInProgress,
}

impl std::fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientEvidence { found, required } => write!(
                f,
                "{}",
                EngineError::InsufficientEvidence {
                    found: *found,
                    required: *required
                }
            ),
            Self::AcceptanceHealthy { rejection_rate } => {
                write!(f, "acceptance healthy: rejection rate {:.1}%", rejection_rate * 100.0)
            }
            Self::NoPattern => f.write_str("no recurring correction pattern among rejections"),
            Self::AlreadyAmended { pattern } => {
                write!(f, "amendment for {pattern} is already in effect")
            }
            Self::CycleInProgress => f.write_str("another cycle is in progress"),
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Committed {
        instructions: OperatingInstructions,
        pattern: String,
        occurrences: usize,
    },
    NoOp {
        reason: NoOpReason,
    },
}

/// Resets the phase to `Idle` however the cycle ends.
struct PhaseReset<'a>(&'a RwLock<CyclePhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *self.0.write() = CyclePhase::Idle;
    }
}

/// Counts carried from collection into the ledger row.
#[derive(Default)]
struct Tally {
    qualifying: usize,
    rejected: usize,
    pattern: Option<String>,
}

/// Scheduled self-rewrite of the operating instructions.
///
/// Works on a snapshot of the outcome log, proposes at most one amendment
/// per cycle and publishes it as a new immutable version. Never touches the
/// serving path beyond that publish.
pub struct EvolutionLoop {
    outcomes: Arc<OutcomeLog>,
    instructions: Arc<InstructionsStore>,
    ledger: Arc<EvolutionLedger>,
    catalogue: PatternCatalogue,
    config: EvolutionConfig,
    /// Router threshold used when the active version sets none.
    base_threshold: f64,
    phase: RwLock<CyclePhase>,
    running: tokio::sync::Mutex<()>,
}

impl EvolutionLoop {
    pub fn new(
        outcomes: Arc<OutcomeLog>,
        instructions: Arc<InstructionsStore>,
        ledger: Arc<EvolutionLedger>,
        config: &EvolutionConfig,
        base_threshold: f64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            outcomes,
            instructions,
            ledger,
            catalogue: PatternCatalogue::new(&config.patterns)?,
            config: config.clone(),
            base_threshold,
            phase: RwLock::new(CyclePhase::Idle),
            running: tokio::sync::Mutex::new(()),
        })
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    pub fn history(&self, limit: usize) -> anyhow::Result<Vec<CycleRecord>> {
        self.ledger.recent(limit)
    }

    fn enter(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
        tracing::debug!(?phase, "Evolution phase");
    }

    /// Run one cycle over dispositions finalized after the last committed
    /// cycle and at or before `as_of`.
    ///
    /// Commit failure is returned as `InstructionsCommitFailure` after the
    /// previous version has been left active; the watermark does not move,
    /// so the next cycle sees the same records again.
    pub async fn run_cycle(&self, as_of: DateTime<Utc>) -> EngineResult<CycleOutcome> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::info!("Evolution cycle skipped: another cycle is running");
            return Ok(CycleOutcome::NoOp {
                reason: NoOpReason::CycleInProgress,
            });
        };
        let _reset = PhaseReset(&self.phase);
        let mut tally = Tally::default();

        let result = self.run_phases(as_of, &mut tally).await;

        let (status, version, detail) = match &result {
            Ok(CycleOutcome::Committed { instructions, .. }) => {
                (CycleStatus::Committed, Some(instructions.version), instructions.rationale.clone())
            }
            Ok(CycleOutcome::NoOp { reason }) => (CycleStatus::NoOp, None, reason.to_string()),
            Err(e) => (CycleStatus::Failed, None, e.to_string()),
        };
        let record = CycleRecord {
            id: 0,
            as_of,
            finished_at: Utc::now(),
            status,
            qualifying: tally.qualifying,
            rejected: tally.rejected,
            pattern: tally.pattern,
            version,
            detail,
        };
        if let Err(e) = self.ledger.record(&record) {
            tracing::error!(error = %e, status = status.as_str(), "Failed to record evolution cycle");
        }

        match &result {
            Ok(CycleOutcome::Committed { instructions, pattern, .. }) => tracing::info!(
                version = instructions.version,
                pattern = %pattern,
                qualifying = record.qualifying,
                "Evolution cycle committed"
            ),
            Ok(CycleOutcome::NoOp { reason }) => {
                tracing::info!(reason = %reason, qualifying = record.qualifying, "Evolution cycle no-op");
            }
            Err(e) => tracing::warn!(error = %e, "Evolution cycle failed; previous instructions stay active"),
        }
        result
    }

    async fn run_phases(&self, as_of: DateTime<Utc>, tally: &mut Tally) -> EngineResult<CycleOutcome> {
        // ── Collecting ──
        self.enter(CyclePhase::Collecting);
        let outcomes = Arc::clone(&self.outcomes);
        let ledger = Arc::clone(&self.ledger);
        let snapshot = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<OutcomeRecord>> {
            let watermark = ledger.watermark()?;
            // A disposition lands within the grace window of its record, so
            // nothing written before this can have been finalized later.
            let since = watermark.map_or(DateTime::UNIX_EPOCH, |w| w - outcomes.grace_window());
            let mut qualifying = Vec::new();
            for record in outcomes.read_since(since) {
                let record = record?;
                if record.recorded_at > as_of {
                    break;
                }
                if qualifies(&record, watermark, as_of) {
                    qualifying.push(record);
                }
            }
            Ok(qualifying)
        })
        .await
        .map_err(anyhow::Error::from)??;

        // ── Analyzing ──
        self.enter(CyclePhase::Analyzing);
        let rejected: Vec<&OutcomeRecord> = snapshot
            .iter()
            .filter(|r| r.disposition == Disposition::Rejected)
            .collect();
        tally.qualifying = snapshot.len();
        tally.rejected = rejected.len();

        if snapshot.len() < self.config.min_samples {
            return Ok(noop(NoOpReason::InsufficientEvidence {
                found: snapshot.len(),
                required: self.config.min_samples,
            }));
        }
        let rejection_rate = rejected.len() as f64 / snapshot.len() as f64;
        if rejection_rate < self.config.min_rejection_rate {
            return Ok(noop(NoOpReason::AcceptanceHealthy { rejection_rate }));
        }

        // ── Proposing ──
        self.enter(CyclePhase::Proposing);
        let Some(finding) = self.catalogue.most_frequent(rejected.iter().copied()) else {
            return Ok(noop(NoOpReason::NoPattern));
        };
        let pattern = finding.pattern;
        tally.pattern = Some(pattern.id.clone());

        let active = self.instructions.active();
        let threshold = pattern.threshold_delta.and_then(|delta| {
            let current = active.confidence_threshold().unwrap_or(self.base_threshold);
            let next = round2((current + delta).clamp(0.0, self.config.max_confidence_threshold));
            ((next - current).abs() > f64::EPSILON).then_some(next)
        });
        if threshold.is_none() && active.has_amendment(&pattern.amendment) {
            return Ok(noop(NoOpReason::AlreadyAmended {
                pattern: pattern.id.clone(),
            }));
        }

        let rationale = format!(
            "{}: {} of {} rejected outcomes ({} qualifying, rejection rate {:.0}%)",
            pattern.id,
            finding.occurrences,
            rejected.len(),
            snapshot.len(),
            rejection_rate * 100.0
        );

        // ── Committing ──
        self.enter(CyclePhase::Committing);
        let instructions = Arc::clone(&self.instructions);
        let amendment = pattern.amendment.clone();
        let committed = tokio::task::spawn_blocking(move || {
            instructions.commit_with(rationale, |active, next| match threshold {
                // Amendment already present: only the threshold moves.
                Some(t) if active.has_amendment(&amendment) => active.with_threshold(t),
                _ => active.amended(&amendment, next, threshold),
            })
        })
        .await
        .map_err(anyhow::Error::from)??;

        Ok(CycleOutcome::Committed {
            instructions: committed,
            pattern: pattern.id,
            occurrences: finding.occurrences,
        })
    }
}

fn noop(reason: NoOpReason) -> CycleOutcome {
    CycleOutcome::NoOp { reason }
}

fn qualifies(record: &OutcomeRecord, watermark: Option<DateTime<Utc>>, as_of: DateTime<Utc>) -> bool {
    if !record.disposition.is_terminal() {
        return false;
    }
    let Some(at) = record.disposition_at else {
        return false;
    };
    at <= as_of && watermark.map_or(true, |w| at > w)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::ExecutionPath;
    use crate::instructions::SqliteInstructionsBackend;
    use crate::test_support::{outcome_record, FailingInstructionsBackend};
    use chrono::Duration;

    struct Fixture {
        outcomes: Arc<OutcomeLog>,
        instructions: Arc<InstructionsStore>,
        evolution: EvolutionLoop,
    }

    fn fixture_with(backend: Arc<dyn crate::instructions::InstructionsBackend>) -> Fixture {
        let outcomes = Arc::new(OutcomeLog::in_memory(24).unwrap());
        let instructions = Arc::new(InstructionsStore::open(backend).unwrap());
        let ledger = Arc::new(EvolutionLedger::in_memory().unwrap());
        let evolution = EvolutionLoop::new(
            outcomes.clone(),
            instructions.clone(),
            ledger,
            &EvolutionConfig::default(),
            0.6,
        )
        .unwrap();
        Fixture {
            outcomes,
            instructions,
            evolution,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(SqliteInstructionsBackend::in_memory().unwrap()))
    }

    /// Append a record written an hour ago and finalize it now-ish.
    fn seed(log: &OutcomeLog, disposition: Disposition, note: Option<&str>, path: ExecutionPath) {
        let written = Utc::now() - Duration::hours(1);
        let mut record = outcome_record("draft the launch email", written);
        record.path = path;
        log.append(&record).unwrap();
        if disposition.is_terminal() {
            log.update_disposition_at(record.directive_id, disposition, note, written + Duration::minutes(5))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn three_qualifying_records_are_a_noop() {
        let f = fixture();
        for _ in 0..3 {
            seed(&f.outcomes, Disposition::Rejected, Some("too long"), ExecutionPath::Deep);
        }
        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::NoOp {
                reason: NoOpReason::InsufficientEvidence { found: 3, required: 5 }
            }
        );
        assert_eq!(f.instructions.list().unwrap().len(), 1);
        assert_eq!(f.evolution.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn unknown_dispositions_never_qualify() {
        let f = fixture();
        for _ in 0..10 {
            seed(&f.outcomes, Disposition::Unknown, None, ExecutionPath::Deep);
        }
        for _ in 0..4 {
            seed(&f.outcomes, Disposition::Rejected, Some("too long"), ExecutionPath::Deep);
        }
        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::NoOp {
                reason: NoOpReason::InsufficientEvidence { found: 4, .. }
            }
        ));
    }

    #[tokio::test]
    async fn low_rejection_rate_is_healthy() {
        let f = fixture();
        for _ in 0..9 {
            seed(&f.outcomes, Disposition::Accepted, None, ExecutionPath::Deep);
        }
        seed(&f.outcomes, Disposition::Rejected, Some("too long"), ExecutionPath::Deep);
        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::NoOp {
                reason: NoOpReason::AcceptanceHealthy { .. }
            }
        ));
    }

    #[tokio::test]
    async fn recurring_pattern_commits_one_amendment() {
        let f = fixture();
        for _ in 0..3 {
            seed(&f.outcomes, Disposition::Accepted, None, ExecutionPath::Deep);
        }
        seed(&f.outcomes, Disposition::Rejected, Some("way too long"), ExecutionPath::Deep);
        seed(&f.outcomes, Disposition::Rejected, Some("verbose"), ExecutionPath::Deep);
        seed(&f.outcomes, Disposition::Rejected, Some("the number is wrong"), ExecutionPath::Deep);

        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        let CycleOutcome::Committed {
            instructions,
            pattern,
            occurrences,
        } = outcome
        else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!(pattern, "response_too_verbose");
        assert_eq!(occurrences, 2);
        assert_eq!(instructions.version, 2);
        assert!(instructions.body().contains("- (v2) Keep answers concise"));
        assert_eq!(instructions.body().matches("- (v").count(), 1);
        assert_eq!(f.instructions.active().version, 2);

        // Watermark moved: the same records do not qualify again.
        let again = f.evolution.run_cycle(Utc::now()).await.unwrap();
        assert!(matches!(
            again,
            CycleOutcome::NoOp {
                reason: NoOpReason::InsufficientEvidence { found: 0, .. }
            }
        ));

        let history = f.evolution.history(10).unwrap();
        assert_eq!(history[0].status, CycleStatus::NoOp);
        assert_eq!(history[1].status, CycleStatus::Committed);
        assert_eq!(history[1].version, Some(2));
    }

    #[tokio::test]
    async fn dispositions_after_as_of_are_left_for_later() {
        let f = fixture();
        for _ in 0..6 {
            seed(&f.outcomes, Disposition::Rejected, Some("verbose"), ExecutionPath::Deep);
        }
        let before = Utc::now() - Duration::hours(2);
        let outcome = f.evolution.run_cycle(before).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::NoOp { .. }));
        assert!(matches!(
            f.evolution.run_cycle(Utc::now()).await.unwrap(),
            CycleOutcome::Committed { .. }
        ));
    }

    #[tokio::test]
    async fn shallow_fast_rejections_raise_threshold() {
        let f = fixture();
        for _ in 0..5 {
            seed(&f.outcomes, Disposition::Rejected, Some("no"), ExecutionPath::Fast);
        }
        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        let CycleOutcome::Committed { instructions, pattern, .. } = outcome else {
            panic!("expected commit");
        };
        assert_eq!(pattern, "shallow_reasoning");
        assert_eq!(instructions.confidence_threshold(), Some(0.65));
    }

    #[tokio::test]
    async fn commit_failure_keeps_previous_version_and_retries_next_cycle() {
        let backend = Arc::new(FailingInstructionsBackend::new());
        let f = fixture_with(backend.clone());
        for _ in 0..6 {
            seed(&f.outcomes, Disposition::Rejected, Some("verbose"), ExecutionPath::Deep);
        }

        backend.set_failing(true);
        let err = f.evolution.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(err, EngineError::InstructionsCommitFailure(_)));
        assert_eq!(f.instructions.active().version, 1);
        assert_eq!(f.evolution.phase(), CyclePhase::Idle);

        backend.set_failing(false);
        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Committed { .. }));
        assert_eq!(f.instructions.active().version, 2);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let f = fixture();
        let _held = f.evolution.running.try_lock().unwrap();
        let outcome = f.evolution.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::NoOp {
                reason: NoOpReason::CycleInProgress
            }
        );
    }
}
