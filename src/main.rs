//! # omi-sync CLI
//!
//! The `omi-sync` binary runs the conversation mirror as a daemon or as a
//! single cycle, and offers a couple of inspection commands.
//!
//! ## Usage
//!
//! ```bash
//! omi-sync --config ./config/omi-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `omi-sync run` | Sync every interval until SIGINT/SIGTERM |
//! | `omi-sync sync` | Run one cycle and print the summary |
//! | `omi-sync sync --dry-run` | Plan a cycle against an in-memory destination |
//! | `omi-sync state` | Show the persisted sync state |
//! | `omi-sync check` | Validate configuration and contact both endpoints |
//!
//! Secrets usually come from the environment (`OMI_API_KEY`, `WEBDAV_URL`,
//! `WEBDAV_USER`, `WEBDAV_PASS`); the config file is optional.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use omi_sync::config::{self, Config};
use omi_sync::connector_omi::OmiSource;
use omi_sync::engine::{CycleOutcome, CycleSummary, Engine, EngineOptions};
use omi_sync::scheduler::Scheduler;
use omi_sync::state::StateStore;
use omi_sync::store_memory::MemoryStore;
use omi_sync::store_webdav::WebDavStore;
use omi_sync::traits::{DestinationStore, RecordSource};

/// Mirror Omi conversations into a WebDAV folder as Markdown files.
#[derive(Parser)]
#[command(name = "omi-sync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Optional. Environment variables override anything set here.
    #[arg(long, global = true, default_value = "./config/omi-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync continuously, once per interval, until interrupted.
    Run,

    /// Run a single sync cycle.
    Sync {
        /// Plan against an empty in-memory destination; nothing is written
        /// remotely and the state file is left alone.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the persisted sync state.
    State,

    /// Validate configuration and check that both endpoints answer.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Reading the local state file needs no credentials.
    if let Commands::State = cli.command {
        print_state(&config::read_config(&cli.config)?);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    match cli.command {
        Commands::Run => run_daemon(&cfg).await?,
        Commands::Sync { dry_run } => run_once(&cfg, dry_run).await?,
        Commands::State => {}
        Commands::Check => check(&cfg).await?,
    }

    Ok(())
}

fn build_engine(cfg: &Config, destination: Arc<dyn DestinationStore>) -> Result<Engine> {
    let source: Arc<dyn RecordSource> = Arc::new(OmiSource::new(&cfg.source)?);
    Ok(Engine::new(source, destination, EngineOptions::from_config(cfg)))
}

async fn run_daemon(cfg: &Config) -> Result<()> {
    let destination: Arc<dyn DestinationStore> = Arc::new(WebDavStore::new(&cfg.destination)?);
    let engine = build_engine(cfg, destination)?.with_state_store(StateStore::new(&cfg.sync.state_path));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    Scheduler::new(&engine, cfg.sync.interval())
        .run(cancel)
        .await;
    info!("stopped");
    Ok(())
}

async fn run_once(cfg: &Config, dry_run: bool) -> Result<()> {
    let store = StateStore::new(&cfg.sync.state_path);
    let engine = if dry_run {
        build_engine(cfg, Arc::new(MemoryStore::new()))?
    } else {
        let destination: Arc<dyn DestinationStore> = Arc::new(WebDavStore::new(&cfg.destination)?);
        build_engine(cfg, destination)?.with_state_store(store.clone())
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let mut state = store.load();
    match engine.run_cycle(&mut state, &cancel).await {
        CycleOutcome::Completed(summary) => {
            if dry_run {
                println!("Dry run (in-memory destination, state not saved):");
            }
            print_summary(&summary);
            Ok(())
        }
        CycleOutcome::Aborted { phase, reason } => {
            anyhow::bail!("sync aborted during {:?}: {}", phase, reason)
        }
    }
}

fn print_summary(summary: &CycleSummary) {
    println!("  created:   {}", summary.created);
    println!("  updated:   {}", summary.updated);
    println!("  deleted:   {}", summary.deleted);
    println!("  unchanged: {}", summary.unchanged);
    println!("  failed:    {}", summary.failed);
    if summary.skipped > 0 {
        println!("  skipped:   {}", summary.skipped);
    }
}

fn print_state(cfg: &Config) {
    let store = StateStore::new(&cfg.sync.state_path);
    let state = store.load();

    println!("State file:   {}", store.path().display());
    match state.last_sync {
        Some(ts) => println!("Last sync:    {}", ts.to_rfc3339()),
        None => println!("Last sync:    never"),
    }
    println!("Conversations: {}", state.len());
    if state.is_empty() {
        return;
    }

    println!();
    println!("{:<32} {:<18} FILENAME", "ID", "HASH");
    for (id, entry) in &state.conversations {
        println!("{:<32} {:<18} {}", id, entry.content_hash.as_str(), entry.filename);
    }
}

async fn check(cfg: &Config) -> Result<()> {
    let source = OmiSource::new(&cfg.source)?;
    let destination = WebDavStore::new(&cfg.destination)?;

    println!("{:<14} {:<8} DETAIL", "ENDPOINT", "STATUS");

    let source_ok = match source.fetch_page(0, 1).await {
        Ok(page) => {
            println!("{:<14} {:<8} {} conversation(s) on first page", "source", "OK", page.len());
            true
        }
        Err(e) => {
            println!("{:<14} {:<8} {}", "source", "FAIL", e);
            false
        }
    };

    let destination_ok = match destination.exists(&cfg.destination.output_dir).await {
        Ok(true) => {
            println!("{:<14} {:<8} {} exists", "destination", "OK", cfg.destination.output_dir);
            true
        }
        Ok(false) => {
            println!(
                "{:<14} {:<8} {} will be created on first sync",
                "destination", "OK", cfg.destination.output_dir
            );
            true
        }
        Err(e) => {
            println!("{:<14} {:<8} {}", "destination", "FAIL", e);
            false
        }
    };

    if source_ok && destination_ok {
        Ok(())
    } else {
        anyhow::bail!("one or more endpoints failed the check")
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will stop the sync");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown requested, finishing in-flight work");
    token.cancel();
}

