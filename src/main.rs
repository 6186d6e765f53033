use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use twinmind::config::Config;
use twinmind::directive::{Disposition, RoutedResult};
use twinmind::engine::Engine;
use twinmind::knowledge::Document;

/// Bifurcated directive router with grounding verification and
/// self-evolving operating instructions.
#[derive(Parser)]
#[command(name = "twinmind", version, about, long_about = None)]
struct Cli {
    /// Config file (overrides $TWINMIND_CONFIG and the platform default)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service with the evolution scheduler
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },

    /// Route one directive and print the result
    Ask {
        /// Directive text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record the user's reaction to a result
    Disposition {
        directive_id: Uuid,
        /// accepted | rejected
        disposition: Disposition,
        /// What the user changed, when they edited the result
        #[arg(long)]
        note: Option<String>,
    },

    /// Run one evolution cycle now
    Evolve,

    /// Show recent evolution cycles
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Inspect or roll back operating instructions
    Instructions {
        #[command(subcommand)]
        action: InstructionsCommands,
    },

    /// Send a reference document to a running server
    Ingest {
        file: PathBuf,
        /// Document id (defaults to the file name)
        #[arg(long)]
        id: Option<String>,
        /// Server base URL (defaults to the configured host and port)
        #[arg(long)]
        server: Option<String>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum InstructionsCommands {
    /// List every retained version
    List,
    /// Print one version (the active one when omitted)
    Show { version: Option<u64> },
    /// Make a retained version active
    Rollback { version: u64 },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the JSON schema of the config file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config {
        action: ConfigCommands::Schema,
    } = cli.command
    {
        println!("{}", Config::json_schema()?);
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log.level);

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Ask { text, json } => {
            let engine = Engine::from_config(config).await?;
            let result = engine.submit_directive(&text.join(" ")).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            Ok(())
        }
        Commands::Disposition {
            directive_id,
            disposition,
            note,
        } => {
            let engine = Engine::from_config(config).await?;
            engine
                .update_disposition(directive_id, disposition, note)
                .await?;
            println!("{directive_id}: {}", disposition.as_str());
            Ok(())
        }
        Commands::Evolve => {
            let engine = Engine::from_config(config).await?;
            let outcome = engine.trigger_evolution_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Commands::History { limit } => {
            let engine = Engine::from_config(config).await?;
            for cycle in engine.evolution_history(limit).await? {
                println!(
                    "{}  {:<9}  qualifying={:<4} rejected={:<4} pattern={:<24} version={}",
                    cycle.as_of.format("%Y-%m-%d %H:%M"),
                    cycle.status.as_str(),
                    cycle.qualifying,
                    cycle.rejected,
                    cycle.pattern.as_deref().unwrap_or("-"),
                    cycle.version.map_or_else(|| "-".to_string(), |v| v.to_string()),
                );
            }
            Ok(())
        }
        Commands::Instructions { action } => {
            let engine = Engine::from_config(config).await?;
            match action {
                InstructionsCommands::List => {
                    for meta in engine.list_instructions().await? {
                        println!(
                            "{} v{:<4} {}  {}",
                            if meta.active { "*" } else { " " },
                            meta.version,
                            meta.created_at.format("%Y-%m-%d %H:%M"),
                            meta.rationale
                        );
                    }
                }
                InstructionsCommands::Show { version } => {
                    let doc = match version {
                        Some(v) => engine.get_instructions(v).await?,
                        None => engine.active_instructions().as_ref().clone(),
                    };
                    println!("{}", doc.content);
                }
                InstructionsCommands::Rollback { version } => {
                    let doc = engine.activate_instructions(version).await?;
                    println!("Active operating instructions: v{}", doc.version);
                }
            }
            Ok(())
        }
        Commands::Ingest { file, id, server } => ingest(&config, &file, id, server).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let engine = Arc::new(Engine::from_config(config).await?);
    let token = CancellationToken::new();
    let background = engine.spawn_background(&token)?;

    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    let served = twinmind::api::run_server(engine, token.clone()).await;
    token.cancel();
    for handle in background {
        let _ = handle.await;
    }
    served
}

async fn ingest(config: &Config, file: &Path, id: Option<String>, server: Option<String>) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let id = match id {
        Some(id) => id,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("File has no name; pass --id")?,
    };
    let base = server.unwrap_or_else(|| format!("http://{}:{}", config.server.host, config.server.port));
    let url = format!("{}/api/knowledge/documents", base.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .post(&url)
        .json(&Document {
            id: id.clone(),
            text: twinmind::directive::truncate_chars(&text, config.knowledge.max_document_chars),
        })
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("Ingest failed ({status}): {}", body["error"].as_str().unwrap_or("unknown error"));
    }
    println!("{id}: revision {}", body["revision"]);
    Ok(())
}

fn print_result(result: &RoutedResult) {
    println!("{}", result.content);
    println!();
    println!(
        "[{} | {} | {} ms | confidence {:.2} | instructions v{} | id {}]",
        result.path,
        result.verification_status.as_str(),
        result.latency_ms,
        result.confidence,
        result.instructions_version,
        result.directive_id
    );
    for citation in &result.citations {
        println!(
            "  cite: {} ({} {}, {:.2})",
            citation.claim, citation.source_id, citation.locator, citation.confidence
        );
    }
}
