use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lattice_core::config::AppConfig;
use lattice_core::error::LatticeError;
use lattice_core::types::JobId;
use lattice_engine::{run_research, EngineContext, RunLogger};

#[derive(Parser)]
#[command(name = "lattice", version, about = "Pipeline engine for multi-step research workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "lattice.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the research pipeline for a task
    Run {
        /// The research task or question
        #[arg(long)]
        task: String,
        /// Optional source paper URL (routes the run to paper analysis)
        #[arg(long)]
        source_url: Option<String>,
        /// Job identifier (auto-generated if not provided)
        #[arg(long)]
        job: Option<String>,
        /// Pre-lock the topic, skipping the discovery gate
        #[arg(long)]
        topic: Option<String>,
    },
    /// Resolve a waiting topic gate out of band
    Unlock {
        /// Job identifier of the waiting run
        #[arg(long)]
        job: String,
        /// The selected topic
        #[arg(long)]
        topic: String,
    },
    /// Show provider pool status
    Status,
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lattice=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(LatticeError::ConfigNotFound(_)) if cli.config == PathBuf::from("lattice.toml") => {
            info!("No lattice.toml found, using defaults");
            AppConfig::default()
        }
        Err(e) => anyhow::bail!("Failed to load config: {}", e),
    };

    match cli.command {
        Commands::Run {
            task,
            source_url,
            job,
            topic,
        } => {
            let ctx = EngineContext::from_config(config)?;
            let job_id = job.unwrap_or_else(|| JobId::new().to_string());

            if let Some(topic) = topic {
                ctx.sessions.merge_update(
                    &job_id,
                    &serde_json::json!({ "topic_locked": true, "selected_topic": topic }),
                )?;
            } else if ctx.config.store.path.is_none() {
                warn!(
                    "No durable session store configured; an unlock from another process \
                     will not be visible. Pass --topic to pre-lock the gate."
                );
            }

            let logger = spawn_run_logger(&ctx, &job_id);

            info!(job = %job_id, "Starting pipeline run");
            let state = run_research(&ctx, &task, source_url, Some(job_id.clone())).await?;

            if let Some((cancel, handle)) = logger {
                cancel.cancel();
                let _ = handle.await;
            }

            println!("Job #{} finished", job_id);
            println!("\nHistory:");
            for entry in &state.history {
                println!("  {}", entry);
            }
            println!("\nFindings:");
            let mut steps: Vec<&String> = state.findings.keys().collect();
            steps.sort();
            for step in steps {
                let payload = serde_json::to_string(&state.findings[step])?;
                let preview: String = payload.chars().take(120).collect();
                println!("  {}: {}", step, preview);
            }
        }
        Commands::Unlock { job, topic } => {
            let ctx = EngineContext::from_config(config)?;
            ctx.sessions.merge_update(
                &job,
                &serde_json::json!({ "topic_locked": true, "selected_topic": topic }),
            )?;
            println!("Job #{} unlocked: topic set", job);
        }
        Commands::Status => {
            let ctx = EngineContext::from_config(config)?;
            let status = ctx.pool.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Start the JSONL run logger if enabled; returns the cancel handle.
fn spawn_run_logger(
    ctx: &Arc<EngineContext>,
    job_id: &str,
) -> Option<(
    tokio_util::sync::CancellationToken,
    tokio::task::JoinHandle<()>,
)> {
    let log = ctx.config.log.clone()?;
    if !log.enabled {
        return None;
    }

    let log_dir = PathBuf::from(log.log_dir.unwrap_or_else(|| "logs".to_string()));
    let cancel = tokio_util::sync::CancellationToken::new();
    let logger = RunLogger::new(log_dir);
    let handle = tokio::spawn(logger.run(
        ctx.events.clone(),
        JobId::from_str(job_id),
        cancel.clone(),
    ));
    Some((cancel, handle))
}
