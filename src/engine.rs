//! Public service surface: one [`Engine`] wires the router, verifier,
//! outcome log, instructions store and evolution loop together.

use anyhow::Context;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::directive::{Directive, Disposition, RoutedResult};
use crate::error::{EngineError, EngineResult};
use crate::evolution::{spawn_scheduler, CycleOutcome, CycleRecord, EvolutionLedger, EvolutionLoop};
use crate::instructions::{
    InstructionsBackend, InstructionsMeta, InstructionsStore, OperatingInstructions,
    SqliteInstructionsBackend,
};
use crate::knowledge::{load_dir, Document, KnowledgeStore, LexicalKnowledgeStore};
use crate::outcome::OutcomeLog;
use crate::providers::{HybridGateway, ModelGateway};
use crate::router::BifurcatedRouter;
use crate::verifier::GroundingVerifier;

/// How often a serving process checks for versions activated elsewhere
/// (CLI rollback, another instance's evolution cycle).
const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Durable stores behind an engine.
pub struct Stores {
    pub outcomes: Arc<OutcomeLog>,
    pub instructions: Arc<dyn InstructionsBackend>,
    pub ledger: Arc<EvolutionLedger>,
}

impl Stores {
    pub fn open(data_dir: &Path, grace_window_hours: u32) -> anyhow::Result<Self> {
        Ok(Self {
            outcomes: Arc::new(OutcomeLog::open(data_dir, grace_window_hours)?),
            instructions: Arc::new(SqliteInstructionsBackend::open(data_dir)?),
            ledger: Arc::new(EvolutionLedger::open(data_dir)?),
        })
    }

    pub fn in_memory(grace_window_hours: u32) -> anyhow::Result<Self> {
        Ok(Self {
            outcomes: Arc::new(OutcomeLog::in_memory(grace_window_hours)?),
            instructions: Arc::new(SqliteInstructionsBackend::in_memory()?),
            ledger: Arc::new(EvolutionLedger::in_memory()?),
        })
    }
}

pub struct Engine {
    config: Config,
    gateway: Arc<dyn ModelGateway>,
    knowledge: Arc<dyn KnowledgeStore>,
    router: BifurcatedRouter,
    outcomes: Arc<OutcomeLog>,
    instructions: Arc<InstructionsStore>,
    evolution: Arc<EvolutionLoop>,
}

impl Engine {
    /// Open the SQLite stores under the data dir, load the knowledge
    /// directory and connect the configured model backends.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        let stores = Stores::open(&data_dir, config.outcome.grace_window_hours)?;

        let knowledge = Arc::new(LexicalKnowledgeStore::new());
        if let Some(dir) = config.knowledge_dir() {
            let loaded = load_dir(knowledge.as_ref(), &dir, config.knowledge.max_document_chars)
                .await
                .with_context(|| format!("Failed to load knowledge dir: {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), documents = loaded, "Knowledge documents loaded");
        }

        let gateway = Arc::new(HybridGateway::from_config(&config.providers));
        tracing::info!(gateway = gateway.name(), data_dir = %data_dir.display(), "Engine starting");
        Self::assemble(config, gateway, knowledge, stores)
    }

    /// Wire an engine from already-built parts.
    pub fn assemble(
        config: Config,
        gateway: Arc<dyn ModelGateway>,
        knowledge: Arc<dyn KnowledgeStore>,
        stores: Stores,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let instructions = Arc::new(InstructionsStore::open(stores.instructions)?);
        let verifier = Arc::new(GroundingVerifier::new(&config.verifier, Arc::clone(&knowledge))?);
        let router = BifurcatedRouter::new(
            Arc::clone(&gateway),
            verifier,
            Arc::clone(&instructions),
            stores.outcomes.clone(),
            &config.router,
        );
        let evolution = Arc::new(EvolutionLoop::new(
            Arc::clone(&stores.outcomes),
            Arc::clone(&instructions),
            stores.ledger,
            &config.evolution,
            config.router.confidence_threshold,
        )?);

        Ok(Self {
            config,
            gateway,
            knowledge,
            router,
            outcomes: stores.outcomes,
            instructions,
            evolution,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    pub async fn gateway_available(&self) -> bool {
        self.gateway.available().await
    }

    // ── Directives ───────────────────────────────────────────────

    /// Route a directive and return its result once it is logged.
    pub async fn submit_directive(&self, text: &str) -> EngineResult<RoutedResult> {
        self.submit_directive_with_cancel(text, &CancellationToken::new()).await
    }

    pub async fn submit_directive_with_cancel(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<RoutedResult> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::EmptyDirective);
        }
        let directive = Directive::new(text);
        tracing::debug!(directive_id = %directive.id(), "Directive submitted");
        self.router.route(&directive, cancel).await
    }

    /// Record the user's reaction to a delivered result.
    pub async fn update_disposition(
        &self,
        directive_id: Uuid,
        disposition: Disposition,
        edit_note: Option<String>,
    ) -> EngineResult<()> {
        let outcomes = Arc::clone(&self.outcomes);
        blocking(move || outcomes.update_disposition(directive_id, disposition, edit_note.as_deref()))
            .await?;
        tracing::info!(directive_id = %directive_id, disposition = disposition.as_str(), "Disposition recorded");
        Ok(())
    }

    // ── Operating instructions ───────────────────────────────────

    pub fn active_instructions_version(&self) -> InstructionsMeta {
        self.instructions.active_meta()
    }

    pub fn active_instructions(&self) -> Arc<OperatingInstructions> {
        self.instructions.active()
    }

    pub async fn list_instructions(&self) -> EngineResult<Vec<InstructionsMeta>> {
        let store = Arc::clone(&self.instructions);
        blocking(move || Ok(store.list()?)).await
    }

    pub async fn get_instructions(&self, version: u64) -> EngineResult<OperatingInstructions> {
        let store = Arc::clone(&self.instructions);
        blocking(move || store.get(version)?.ok_or(EngineError::UnknownVersion(version))).await
    }

    /// Make a retained version active again.
    pub async fn activate_instructions(&self, version: u64) -> EngineResult<OperatingInstructions> {
        let store = Arc::clone(&self.instructions);
        blocking(move || store.activate(version)).await
    }

    // ── Evolution ────────────────────────────────────────────────

    /// Run one evolution cycle now, outside the schedule.
    pub async fn trigger_evolution_cycle(&self) -> EngineResult<CycleOutcome> {
        self.evolution.run_cycle(Utc::now()).await
    }

    pub async fn evolution_history(&self, limit: usize) -> EngineResult<Vec<CycleRecord>> {
        let evolution = Arc::clone(&self.evolution);
        blocking(move || Ok(evolution.history(limit)?)).await
    }

    // ── Knowledge ────────────────────────────────────────────────

    /// Add or replace a reference document. Returns its new revision.
    pub async fn ingest(&self, document: Document) -> EngineResult<u32> {
        let id = document.id.clone();
        let revision = self.knowledge.ingest(document).await?;
        tracing::info!(document = %id, revision, "Knowledge document ingested");
        Ok(revision)
    }

    // ── Background tasks ─────────────────────────────────────────

    /// Start the evolution scheduler (when enabled) and the instructions
    /// reload watcher. Both stop when `token` is cancelled.
    pub fn spawn_background(&self, token: &CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        if self.config.evolution.enabled {
            handles.push(spawn_scheduler(
                Arc::clone(&self.evolution),
                &self.config.evolution,
                token.clone(),
            )?);
            tracing::info!(schedule = %self.config.evolution.schedule, "Evolution scheduler started");
        } else {
            tracing::info!("Evolution scheduler disabled");
        }
        handles.push(spawn_reload_watcher(Arc::clone(&self.instructions), token.clone()));
        Ok(handles)
    }
}

/// Run SQLite-backed work off the async workers.
async fn blocking<T, F>(work: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(anyhow::Error::from)?
}

fn spawn_reload_watcher(instructions: Arc<InstructionsStore>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RELOAD_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = interval.tick() => {}
            }
            let store = Arc::clone(&instructions);
            match tokio::task::spawn_blocking(move || store.reload()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Instructions reload failed"),
                Err(e) => tracing::warn!(error = %e, "Instructions reload task failed"),
            }
        }
    })
}
