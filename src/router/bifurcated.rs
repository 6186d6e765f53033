//! Intent classification and dual-path dispatch.
//!
//! Every directive follows the same pipeline: classify (bounded), apply the
//! confidence tie-break, generate on the chosen path, verify deep output,
//! append the outcome, return. Failures along the way degrade the result
//! instead of dropping the directive.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::directive::{
    Classification, Directive, ExecutionPath, Intent, RoutedResult, VerificationStatus,
};
use crate::error::{EngineError, EngineResult};
use crate::instructions::{InstructionsStore, OperatingInstructions};
use crate::outcome::{OutcomeRecord, OutcomeSink, RetryQueue};
use crate::providers::{DeepContext, DeepGeneration, FastGeneration, IntentVerdict, ModelGateway};
use crate::verifier::{annotate_unverified, GroundingVerifier, UnsupportedClaim, VerificationOutcome};

use super::prompt::{PromptContext, SystemPromptBuilder};

/// Failed appends waiting for a background retry.
const RETRY_QUEUE_CAPACITY: usize = 1024;

/// Content of a deep result when neither attempt produced an answer.
const DEGRADED_CONTENT: &str = "No grounded answer could be produced for this request.";

pub struct BifurcatedRouter {
    gateway: Arc<dyn ModelGateway>,
    verifier: Arc<GroundingVerifier>,
    instructions: Arc<InstructionsStore>,
    sink: Arc<dyn OutcomeSink>,
    retry: Arc<RetryQueue>,
    prompts: SystemPromptBuilder,
    config: RouterConfig,
}

impl BifurcatedRouter {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        verifier: Arc<GroundingVerifier>,
        instructions: Arc<InstructionsStore>,
        sink: Arc<dyn OutcomeSink>,
        config: &RouterConfig,
    ) -> Self {
        let retry = RetryQueue::new(
            RETRY_QUEUE_CAPACITY,
            Duration::from_millis(config.log_retry_delay_ms),
            config.log_retry_attempts,
        );
        Self {
            gateway,
            verifier,
            instructions,
            sink,
            retry: Arc::new(retry),
            prompts: SystemPromptBuilder::with_defaults(),
            config: config.clone(),
        }
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    /// Route one directive to a result and append it to the outcome log.
    ///
    /// Cancellation is honoured up to the append. Once the regeneration
    /// attempt has started it runs to completion first; a cancelled
    /// directive is never logged.
    pub async fn route(
        &self,
        directive: &Directive,
        cancel: &CancellationToken,
    ) -> EngineResult<RoutedResult> {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Hot read: each directive sees whichever version is active now.
        let instructions = self.instructions.active();
        let threshold = instructions
            .confidence_threshold()
            .unwrap_or(self.config.confidence_threshold);

        let classification = self.classify(directive, cancel).await?;
        let intent = if classification.intent == Intent::Quick && classification.confidence < threshold {
            tracing::info!(
                directive_id = %directive.id(),
                confidence = classification.confidence,
                threshold,
                "Low-confidence quick intent routed to deep path"
            );
            Intent::Strategy
        } else {
            classification.intent
        };

        let mut result = match intent {
            Intent::Quick => match self.generate_fast(directive, &instructions, started, cancel).await {
                Ok(generation) => fast_result(directive, &classification, &instructions, generation),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        directive_id = %directive.id(),
                        error = %e,
                        "Fast path failed; falling back to deep path"
                    );
                    self.run_deep(directive, &classification, &instructions, cancel).await?
                }
            },
            Intent::Strategy => {
                self.run_deep(directive, &classification, &instructions, cancel).await?
            }
        };
        result.intent = intent;
        result.latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if cancel.is_cancelled() {
            tracing::info!(directive_id = %directive.id(), "Directive cancelled before logging");
            return Err(EngineError::Cancelled);
        }
        self.record(directive, &result).await;

        tracing::info!(
            directive_id = %directive.id(),
            path = %result.path,
            status = result.verification_status.as_str(),
            latency_ms = result.latency_ms,
            deep_attempts = result.deep_attempts,
            caveated = result.caveat.is_some(),
            "Directive routed"
        );
        Ok(result)
    }

    // ── Classification ───────────────────────────────────────────

    /// Classify with a bounded timeout. Timeouts and malformed verdicts
    /// default to `strategy` with confidence 0.
    async fn classify(
        &self,
        directive: &Directive,
        cancel: &CancellationToken,
    ) -> EngineResult<Classification> {
        let limit = Duration::from_millis(self.config.classify_timeout_ms);
        let verdict = cancellable(
            cancel,
            tokio::time::timeout(limit, self.gateway.classify(directive.text())),
        )
        .await?;

        let parsed = match verdict {
            Err(_) => Err(EngineError::ClassificationTimeout(self.config.classify_timeout_ms)),
            Ok(Err(e)) => Err(EngineError::ClassificationMalformed(format!("{e:#}"))),
            Ok(Ok(verdict)) => parse_verdict(&verdict),
        };

        let (intent, confidence) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    directive_id = %directive.id(),
                    code = e.code(),
                    error = %e,
                    "Classification failed; defaulting to strategy"
                );
                (Intent::Strategy, 0.0)
            }
        };
        tracing::debug!(
            directive_id = %directive.id(),
            intent = intent.as_str(),
            confidence,
            "Directive classified"
        );
        Ok(Classification {
            directive_id: directive.id(),
            intent,
            confidence,
        })
    }

    // ── Fast path ────────────────────────────────────────────────

    /// Generate within what is left of the fast budget. The budget runs
    /// from `started`, so classification time counts against it.
    async fn generate_fast(
        &self,
        directive: &Directive,
        instructions: &OperatingInstructions,
        started: Instant,
        cancel: &CancellationToken,
    ) -> EngineResult<FastGeneration> {
        let failure = |reason: String| EngineError::GenerationFailure {
            path: ExecutionPath::Fast,
            reason,
        };
        let budget = Duration::from_millis(self.config.fast_timeout_ms);
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(failure(format!(
                "{} ms budget spent before generation",
                self.config.fast_timeout_ms
            )));
        }

        let system_prompt = self.system_prompt(instructions, ExecutionPath::Fast)?;
        let outcome = cancellable(
            cancel,
            tokio::time::timeout(remaining, self.gateway.generate_fast(directive.text(), &system_prompt)),
        )
        .await?;

        match outcome {
            Err(_) => Err(failure(format!("timed out after {} ms", self.config.fast_timeout_ms))),
            Ok(Err(e)) => Err(failure(format!("{e:#}"))),
            Ok(Ok(generation)) if generation.content.trim().is_empty() => {
                Err(failure("empty response".into()))
            }
            Ok(Ok(generation)) => Ok(generation),
        }
    }

    // ── Deep path ────────────────────────────────────────────────

    /// Generate, verify and regenerate at most once.
    async fn run_deep(
        &self,
        directive: &Directive,
        classification: &Classification,
        instructions: &OperatingInstructions,
        cancel: &CancellationToken,
    ) -> EngineResult<RoutedResult> {
        let mut context = DeepContext {
            system_prompt: self.system_prompt(instructions, ExecutionPath::Deep)?,
            rejection_reasons: Vec::new(),
            attempt: 1,
        };
        let base = DeepDraft {
            directive,
            classification,
            instructions_version: instructions.version,
        };

        let first = match cancellable(cancel, self.generate_deep(directive, &context)).await? {
            Ok(generation) => {
                let verdict = cancellable(
                    cancel,
                    self.verifier.verify(&generation.content, Some(&generation.trace)),
                )
                .await?;
                if verdict.is_approved() {
                    return Ok(base.finish(generation, verdict, VerificationStatus::Approved, None, 1));
                }
                context.rejection_reasons = verdict.rejection_reasons();
                tracing::info!(
                    directive_id = %directive.id(),
                    unsupported = verdict.unsupported.len(),
                    "Deep result rejected; regenerating once"
                );
                Some((generation, verdict))
            }
            Err(e) => {
                tracing::warn!(directive_id = %directive.id(), attempt = 1, error = %e, "Deep generation failed");
                context.rejection_reasons = vec![format!("The previous attempt failed: {e}")];
                None
            }
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // The regeneration is not cancellable once started.
        context.attempt = 2;
        match self.generate_deep(directive, &context).await {
            Ok(generation) => {
                let verdict = self
                    .verifier
                    .verify(&generation.content, Some(&generation.trace))
                    .await;
                if verdict.is_approved() {
                    return Ok(base.finish(generation, verdict, VerificationStatus::Regenerated, None, 2));
                }
                if let Some(e) = verdict.to_error() {
                    tracing::warn!(
                        directive_id = %directive.id(),
                        code = e.code(),
                        error = %e,
                        "Regenerated result still unsupported; releasing with caveat"
                    );
                }
                let caveat = unresolved_caveat(&verdict.unsupported, None);
                Ok(base.finish(generation, verdict, VerificationStatus::Approved, Some(caveat), 2))
            }
            Err(e) => {
                tracing::warn!(directive_id = %directive.id(), attempt = 2, error = %e, "Deep generation failed");
                Ok(match first {
                    Some((generation, verdict)) => {
                        let caveat = unresolved_caveat(&verdict.unsupported, Some(&e));
                        base.finish(generation, verdict, VerificationStatus::Approved, Some(caveat), 2)
                    }
                    None => base.degraded(&e),
                })
            }
        }
    }

    /// One bounded deep generation call.
    async fn generate_deep(
        &self,
        directive: &Directive,
        context: &DeepContext,
    ) -> EngineResult<DeepGeneration> {
        tracing::debug!(directive_id = %directive.id(), attempt = context.attempt, "Deep generation");
        let limit = Duration::from_secs(self.config.deep_timeout_secs);
        let failure = |reason: String| EngineError::GenerationFailure {
            path: ExecutionPath::Deep,
            reason,
        };
        match tokio::time::timeout(limit, self.gateway.generate_deep(directive.text(), context)).await {
            Err(_) => Err(failure(format!("timed out after {} s", self.config.deep_timeout_secs))),
            Ok(Err(e)) => Err(failure(format!("{e:#}"))),
            Ok(Ok(generation)) if generation.content.trim().is_empty() => {
                Err(failure("empty response".into()))
            }
            Ok(Ok(generation)) => Ok(generation),
        }
    }

    fn system_prompt(
        &self,
        instructions: &OperatingInstructions,
        path: ExecutionPath,
    ) -> anyhow::Result<String> {
        let domains = self.verifier.domain_names();
        self.prompts.build(&PromptContext {
            instructions,
            path,
            domains: &domains,
            now: Utc::now(),
        })
    }

    // ── Outcome log ──────────────────────────────────────────────

    /// Append the outcome. A failed append is queued for background retry
    /// and never fails the directive.
    async fn record(&self, directive: &Directive, result: &RoutedResult) {
        let record = OutcomeRecord::from_result(directive, result);
        let sink = Arc::clone(&self.sink);
        let pending = record.clone();
        let written = tokio::task::spawn_blocking(move || sink.append(&pending))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        let Err(e) = written else {
            return;
        };
        let err = EngineError::LogWriteFailure(format!("{e:#}"));
        tracing::warn!(directive_id = %directive.id(), error = %err, "Outcome append failed; retrying in background");
        match self.retry.enqueue(record).await {
            Ok(()) => {
                let _ = self.retry.schedule(Arc::clone(&self.sink));
            }
            Err(e) => tracing::error!(directive_id = %directive.id(), error = %e, "Outcome record lost"),
        }
    }
}

// ── Result assembly ──────────────────────────────────────────────

/// Fields shared by every deep result of one directive.
struct DeepDraft<'a> {
    directive: &'a Directive,
    classification: &'a Classification,
    instructions_version: u64,
}

impl DeepDraft<'_> {
    fn finish(
        &self,
        generation: DeepGeneration,
        verdict: VerificationOutcome,
        status: VerificationStatus,
        caveat: Option<String>,
        attempts: u8,
    ) -> RoutedResult {
        let mut content = annotate_unverified(&generation.content, &verdict.unverified);
        if let Some(ref caveat) = caveat {
            content = format!("{}\n\n{caveat}", content.trim_end());
        }
        RoutedResult {
            directive_id: self.directive.id(),
            path: ExecutionPath::Deep,
            intent: self.classification.intent,
            confidence: self.classification.confidence,
            content,
            latency_ms: generation.latency_ms,
            reasoning_trace: Some(generation.trace),
            verification_status: status,
            citations: verdict.citations,
            unverified_claims: verdict.unverified,
            caveat,
            deep_attempts: attempts,
            instructions_version: self.instructions_version,
        }
    }

    /// Both deep attempts failed to produce content.
    fn degraded(&self, error: &EngineError) -> RoutedResult {
        let caveat = format!(
            "Caveat: deep reasoning failed ({error}). This answer is degraded and not grounded in the reference documents."
        );
        RoutedResult {
            directive_id: self.directive.id(),
            path: ExecutionPath::Deep,
            intent: self.classification.intent,
            confidence: self.classification.confidence,
            content: format!("{DEGRADED_CONTENT}\n\n{caveat}"),
            latency_ms: 0,
            reasoning_trace: None,
            verification_status: VerificationStatus::Approved,
            citations: Vec::new(),
            unverified_claims: Vec::new(),
            caveat: Some(caveat),
            deep_attempts: 2,
            instructions_version: self.instructions_version,
        }
    }
}

fn fast_result(
    directive: &Directive,
    classification: &Classification,
    instructions: &OperatingInstructions,
    generation: FastGeneration,
) -> RoutedResult {
    RoutedResult {
        directive_id: directive.id(),
        path: ExecutionPath::Fast,
        intent: classification.intent,
        confidence: classification.confidence,
        content: generation.content,
        latency_ms: generation.latency_ms,
        reasoning_trace: None,
        verification_status: VerificationStatus::NotApplicable,
        citations: Vec::new(),
        unverified_claims: Vec::new(),
        caveat: None,
        deep_attempts: 0,
        instructions_version: instructions.version,
    }
}

fn unresolved_caveat(unsupported: &[UnsupportedClaim], failure: Option<&EngineError>) -> String {
    let mut caveat = String::from(
        "Caveat: these statements could not be matched to the reference documents and are unverified:",
    );
    for claim in unsupported {
        caveat.push_str("\n- ");
        caveat.push_str(&claim.claim);
    }
    if let Some(e) = failure {
        caveat.push_str(&format!("\nA corrected answer could not be generated ({e})."));
    }
    caveat
}

fn parse_verdict(verdict: &IntentVerdict) -> EngineResult<(Intent, f64)> {
    let intent = Intent::parse_label(&verdict.label).ok_or_else(|| {
        EngineError::ClassificationMalformed(format!("unknown intent label '{}'", verdict.label))
    })?;
    if !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(EngineError::ClassificationMalformed(format!(
            "confidence {} outside [0, 1]",
            verdict.confidence
        )));
    }
    Ok((intent, verdict.confidence))
}

/// Run `fut` unless `cancel` fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> EngineResult<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(EngineError::Cancelled),
        out = fut => Ok(out),
    }
}
