//! Evidence Ledger server — entry point.

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio::sync::Notify;

use evidence_ledger::{ClockType, EvidenceLedger};
use evidence_ledger_server::config::ledger_config;
use evidence_ledger_server::export::{parse_export, verify_export};

#[derive(Parser)]
#[command(
    name = "evidence-ledger-server",
    about = "Tamper-evident compliance evidence ledger with regulatory clocks",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API and the deadline sweeper (default).
    Serve {
        /// Listen address (host:port).
        #[arg(long, default_value = "127.0.0.1:3200")]
        addr: String,

        /// Degraded-mode alert cache file, or `off`.
        /// Also reads from EVIDENCE_ALERT_CACHE.
        #[arg(long)]
        alert_cache: Option<String>,

        /// Seconds between deadline sweeps.
        #[arg(long)]
        sweep_secs: Option<u64>,
    },

    /// Verify the hash chains in an exported event file (JSON array or JSONL).
    Verify {
        /// Path to the export.
        file: String,
    },

    /// Print clock types, SLAs, and warning thresholds as JSON.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   evidence-ledger-server completions bash > ~/.local/share/bash-completion/completions/evidence-ledger-server
    ///   evidence-ledger-server completions zsh > ~/.zfunc/_evidence-ledger-server
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Serve {
        addr: "127.0.0.1:3200".to_string(),
        alert_cache: None,
        sweep_secs: None,
    }) {
        Commands::Serve {
            addr,
            alert_cache,
            sweep_secs,
        } => {
            let config = ledger_config(alert_cache.as_deref(), sweep_secs);
            tracing::info!("Evidence ledger");
            match &config.alert_cache_path {
                Some(path) => tracing::info!("Alert cache: {}", path.display()),
                None => tracing::info!("Alert cache: disabled"),
            }
            tracing::info!("Sweep interval: {}s", config.sweep_interval.as_secs());

            let ledger = Arc::new(EvidenceLedger::in_memory(config)?);
            let shutdown = Arc::new(Notify::new());
            let sweeper = ledger.spawn_sweeper(shutdown.clone());

            let signal = shutdown.clone();
            evidence_ledger_server::start(&addr, ledger, async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("failed to listen for shutdown signal: {e}");
                }
                tracing::info!("Shutting down");
                signal.notify_one();
            })
            .await?;

            if let Err(e) = sweeper.await {
                tracing::warn!("sweeper task ended abnormally: {e}");
            }
        }

        Commands::Verify { file } => {
            let content = std::fs::read_to_string(&file)?;
            let reports = verify_export(parse_export(&content)?);
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if reports.iter().any(|r| !r.intact) {
                eprintln!("Chain verification failed: {file}");
                std::process::exit(1);
            }
        }

        Commands::Info => {
            let clocks: Vec<_> = ClockType::ALL
                .iter()
                .map(|ct| {
                    let sla = ct.sla();
                    serde_json::json!({
                        "clockType": ct,
                        "regulation": sla.regulation,
                        "article": sla.article,
                        "durationHours": sla.duration_hours,
                    })
                })
                .collect();
            let config = ledger_config(None, None);
            let info = serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "clockTypes": clocks,
                "warningThresholds": config.warning_thresholds,
                "sweepIntervalSecs": config.sweep_interval.as_secs(),
                "fallbackRegulation": config.fallback_regulation,
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(
                shell,
                &mut cmd,
                "evidence-ledger-server",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}
