// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Archivist: Local AI Drop-Folder Organizer
//!
//! Files whatever lands in the drop folder into the archive and keeps the
//! archive searchable.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use archivist::config::AppConfig;
use archivist::ollama::OllamaClient;
use archivist::reconcile::ReconcileOutcome;
use archivist::{web, ArchiveService, Result};

/// Archivist CLI - Local AI drop-folder organizer
#[derive(Parser, Debug)]
#[command(name = "archivist")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Files dropped items into a curated archive using a local model", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Output format for results
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the drop folder and archive, and serve the HTTP API
    Serve {
        /// Do not start the HTTP API even if enabled in config
        #[arg(long)]
        no_web: bool,

        /// Skip Ollama health check on startup
        #[arg(long)]
        skip_health_check: bool,
    },

    /// Search the archive
    Query {
        /// Free-text query
        text: String,

        /// Maximum results
        #[arg(short = 'n', long, default_value = "5")]
        limit: usize,
    },

    /// Bring the index in line with the archive on disk
    Reconcile,

    /// File a local file or folder into the archive (the source is kept)
    Place {
        /// File or folder to place
        path: PathBuf,

        /// Only show where it would go
        #[arg(long)]
        dry_run: bool,
    },

    /// Show AI engine and archive status
    Status,

    /// Show recent moves
    Moves {
        /// Look back this many hours
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Maximum entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AppConfig::load(&cli.config)?;
    let json = cli.format == "json";

    match cli.command {
        Some(Commands::Serve { no_web, skip_health_check }) => {
            run_serve(config, no_web, skip_health_check).await
        }
        Some(Commands::Query { text, limit }) => run_query(config, &text, limit, json).await,
        Some(Commands::Reconcile) => run_reconcile(config, json).await,
        Some(Commands::Place { path, dry_run }) => run_place(config, &path, dry_run, json).await,
        Some(Commands::Status) => run_status(config, json).await,
        Some(Commands::Moves { hours, limit }) => run_moves(config, hours, limit, json),
        Some(Commands::Config { action }) => run_config_command(config, action, &cli.config),
        None => run_serve(config, false, false).await,
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Run the watchers (and the HTTP API) until shutdown
async fn run_serve(config: AppConfig, no_web: bool, skip_health_check: bool) -> Result<()> {
    let service = Arc::new(ArchiveService::open(config)?);
    let config = service.config().clone();

    if skip_health_check {
        warn!("Skipping Ollama health check");
    } else {
        match service.client().health_check().await {
            Ok(()) => {
                info!("Ollama is running at {}", config.ai_engine.url);
                let text_model = &config.ai_engine.models.text;
                match service.client().model_available(text_model).await {
                    Ok(true) => info!("Text model '{}' available", text_model),
                    Ok(false) => warn!("Text model '{}' not found; summaries will use fallbacks", text_model),
                    Err(e) => warn!("Could not list models: {}", e),
                }
            }
            Err(e) => warn!("{}; continuing with fallback summaries", e),
        }
    }

    service.start()?;
    info!("Watching {:?} -> {:?}", config.input_dir, config.archive_dir);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    if config.web.enabled && !no_web {
        let mut rx = shutdown_rx.clone();
        let stop = async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        };
        if let Err(e) = web::start_server(Arc::clone(&service), stop).await {
            error!("HTTP API failed: {}", e);
        }
    } else {
        let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
    }

    service.stop();
    info!("Archivist stopped");
    Ok(())
}

async fn run_query(config: AppConfig, text: &str, limit: usize, json: bool) -> Result<()> {
    let service = ArchiveService::open(config)?;
    let hits = service.search(text, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results for {:?}", text);
    }
    for (rank, hit) in hits.iter().enumerate() {
        println!("{:>2}. {}  ({:.3})", rank + 1, hit.absolute_path.display(), hit.score);
    }
    Ok(())
}

async fn run_reconcile(config: AppConfig, json: bool) -> Result<()> {
    let service = ArchiveService::open(config)?;
    let outcome = service.reconcile().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome {
        ReconcileOutcome::Completed(report) => {
            println!("Added:   {}", report.added);
            println!("Removed: {}", report.removed);
            if report.add_failures + report.remove_failures > 0 {
                println!(
                    "Failed:  {} adds, {} removes (see log)",
                    report.add_failures, report.remove_failures
                );
            }
        }
        ReconcileOutcome::Coalesced => println!("A pass is already running; a follow-up was queued"),
    }
    Ok(())
}

async fn run_place(config: AppConfig, path: &Path, dry_run: bool, json: bool) -> Result<()> {
    let service = ArchiveService::open(config)?;
    let outcome = service.place(path, dry_run).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    let verb = if dry_run { "Would file" } else { "Filed" };
    println!("{} {:?} as {}", verb, path, outcome.relative_path);
    println!("  Reason:  {:?}", outcome.reason);
    println!("  Summary: {}", outcome.summary);
    Ok(())
}

async fn run_status(config: AppConfig, json: bool) -> Result<()> {
    let client = OllamaClient::new(
        &config.ai_engine.url,
        std::time::Duration::from_secs(config.ai_engine.timeout_secs),
    )?;
    let ollama = client.health_check().await;
    let models = client.list_models().await.unwrap_or_default();
    let stats = ArchiveService::open(config.clone())?.stats().await?;

    if json {
        let status = serde_json::json!({
            "ollama": ollama.is_ok(),
            "models": models,
            "stats": stats,
            "archive_dir": config.archive_dir,
            "input_dir": config.input_dir,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Archivist v{} Status", env!("CARGO_PKG_VERSION"));
    println!("========================");
    match ollama {
        Ok(()) => println!("Ollama: Running ({})", config.ai_engine.url),
        Err(e) => println!("Ollama: Error - {}", e),
    }
    if !models.is_empty() {
        println!("\nAvailable models:");
        for m in &models {
            let marker = if m.starts_with(config.ai_engine.models.text.as_str())
                || m.starts_with(config.ai_engine.models.embedding.as_str())
            {
                "→"
            } else {
                " "
            };
            println!("  {} {}", marker, m);
        }
    }

    println!("\nArchive ({:?}):", config.archive_dir);
    println!("  Files:   {}", stats.archive.files);
    println!("  Folders: {}", stats.archive.directories);
    println!("  Indexed: {}", stats.indexed);
    println!("\nConfiguration:");
    println!("  Input:      {:?}", config.input_dir);
    println!("  Text model: {}", config.ai_engine.models.text);
    println!("  Embedder:   {:?}", config.ai_engine.embedder);

    Ok(())
}

fn run_moves(config: AppConfig, hours: i64, limit: usize, json: bool) -> Result<()> {
    let log = archivist::history::MoveLog::open(config.move_log_path())?;
    let entries = log.list_recent(hours, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No moves in the last {} hours", hours);
    }
    for entry in &entries {
        println!(
            "{} [{}] {} -> {}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status.as_str(),
            entry.source_path,
            entry.destination_path.as_deref().unwrap_or("-"),
            entry
                .note
                .as_deref()
                .map(|n| format!("  ({})", n))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

/// Run config commands
fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output } => {
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Input:   {:?}", config.input_dir);
            println!("  Archive: {:?}", config.archive_dir);
            println!("  Index:   {:?}", config.index_path());
        }
    }

    Ok(())
}
