use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use risk_guard::config::{self, ConfigHandle, GuardConfig};
use risk_guard::core::monitor::reload_on_sighup;
use risk_guard::core::{
    BreakerState, CircuitBreaker, EvidenceLogger, KillSwitch, MarkerStore, ResetOutcome,
    RiskMonitor, TripOutcome,
};
use risk_guard::errors::GuardError;
use risk_guard::execution::{HttpExecutionSink, HttpTelemetrySource, WebhookAlertSink};
use risk_guard::loader::{ModuleLoader, ModuleManifest, PolicyModule};
use risk_guard::logging;

/// Exit code for a rejected reset.
const EXIT_UNAUTHORIZED: u8 = 2;

#[derive(Parser)]
#[command(name = "risk-guard")]
#[command(version, about = "Risk monitor and persistent trading kill switch", long_about = None)]
struct Cli {
    /// Directory holding app.json and limits.json [env: RISK_CONFIG_DIR, default: ./config]
    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the risk monitor (default)
    Run,
    /// Verify every module in the manifest and exit
    Verify,
    /// Print the breaker state from the marker
    Status,
    /// Trip the breaker manually
    Trip {
        /// Free-text note stored with the trip
        #[arg(long)]
        reason: String,
    },
    /// Reset an OPEN breaker (authorized operators only)
    Reset {
        #[arg(long)]
        operator: String,
        #[arg(long)]
        justification: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_dir = cli.config_dir.unwrap_or_else(|| {
        std::env::var("RISK_CONFIG_DIR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config"))
    });
    let command = cli.command.unwrap_or(Commands::Run);

    if !matches!(command, Commands::Run) {
        logging::init_cli_tracing();
    }

    match dispatch(command, &config_dir).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "risk-guard failed");
            eprintln!("risk-guard: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Commands, config_dir: &Path) -> Result<ExitCode> {
    let config = config::load_config(config_dir)?;

    match command {
        Commands::Run => run(config, config_dir).await.map(|()| ExitCode::SUCCESS),
        Commands::Verify => verify(&config).map(|()| ExitCode::SUCCESS),
        Commands::Status => status(&config).await.map(|()| ExitCode::SUCCESS),
        Commands::Trip { reason } => {
            let kill_switch = build_kill_switch(&config)?;
            match kill_switch.manual_trip(&reason, &config.limits).await? {
                TripOutcome::Tripped(info) => {
                    println!("breaker OPEN: {} at {}", info.reason, info.timestamp)
                }
                TripOutcome::AlreadyOpen(info) => {
                    println!("breaker already OPEN since {} ({})", info.timestamp, info.reason)
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Reset {
            operator,
            justification,
        } => {
            let kill_switch = build_kill_switch(&config)?;
            match kill_switch
                .reset(&operator, &justification, &config.limits)
                .await
            {
                Ok(ResetOutcome::Reset(_)) => {
                    println!("breaker CLOSED by {operator}");
                    Ok(ExitCode::SUCCESS)
                }
                Ok(ResetOutcome::AlreadyClosed) => {
                    println!("breaker already CLOSED; nothing to reset");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e @ GuardError::Unauthorized { .. }) => {
                    eprintln!("risk-guard: {e}");
                    Ok(ExitCode::from(EXIT_UNAUTHORIZED))
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run(config: GuardConfig, config_dir: &Path) -> Result<()> {
    // Initialize tracing; hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&config.app.logging)?;

    info!(
        marker = %config.app.marker_path.display(),
        evidence = %config.app.evidence_path.display(),
        drawdown_max_pct = %config.limits.drawdown_max_pct,
        leverage_max = %config.limits.leverage_max,
        auto_liquidation = config.limits.auto_liquidation_enabled,
        "risk guard starting"
    );

    // Module verification is fatal: never run with unverified policy.
    let policies = load_policies(&config)?;

    let telemetry_url = config
        .app
        .telemetry_url
        .clone()
        .context("telemetry_url (or RISK_TELEMETRY_URL) is required to run the monitor")?;
    let telemetry = Arc::new(HttpTelemetrySource::new(
        telemetry_url,
        Duration::from_secs(config.limits.telemetry_timeout_seconds),
    )?);

    let kill_switch = Arc::new(build_kill_switch(&config)?);
    match kill_switch.state().await {
        Ok(BreakerState::Open(info)) => warn!(
            reason = %info.reason,
            since = %info.timestamp,
            "breaker is OPEN at startup — trading stays halted until an authorized reset"
        ),
        Ok(BreakerState::Closed) => info!("breaker CLOSED at startup"),
        Err(e) => error!(error = %e, "breaker marker unreadable at startup — treating as OPEN"),
    }

    let handle = ConfigHandle::new(config.limits.clone());
    let shutdown = CancellationToken::new();

    let monitor = RiskMonitor::new(
        kill_switch,
        telemetry,
        handle.clone(),
        policies,
        shutdown.clone(),
    );

    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor.run().await {
            error!(error = %e, "risk monitor exited with error");
        }
    });

    let reload_handle = tokio::spawn(reload_on_sighup(
        handle,
        config_dir.join("limits.json"),
        shutdown.clone(),
    ));

    info!("risk monitor running — press Ctrl+C to shutdown");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutdown signal received, stopping gracefully...");
    shutdown.cancel();

    let (monitor_res, reload_res) = tokio::join!(monitor_handle, reload_handle);
    if let Err(e) = monitor_res {
        error!(error = %e, "risk monitor task panicked");
    }
    match reload_res {
        Ok(Err(e)) => warn!(error = %e, "limits reload watcher failed"),
        Err(e) => error!(error = %e, "limits reload task panicked"),
        Ok(Ok(())) => {}
    }

    info!("shutdown complete");
    Ok(())
}

fn verify(config: &GuardConfig) -> Result<()> {
    let (loader, policies) = verified_policies(config)?;
    for policy in &policies {
        println!(
            "ok  {:<24} {}  ({} rule(s))",
            policy.name(),
            policy.digest(),
            policy.rules().len()
        );
    }
    println!(
        "{} module(s) verified under {} ({} digest(s) computed)",
        policies.len(),
        loader.root().display(),
        loader.digests_computed()
    );
    Ok(())
}

async fn status(config: &GuardConfig) -> Result<()> {
    let kill_switch = build_kill_switch(config)?;
    match kill_switch.state().await {
        Ok(BreakerState::Closed) => println!("breaker: CLOSED"),
        Ok(BreakerState::Open(info)) => {
            println!("breaker: OPEN");
            println!("  reason:    {}", info.reason);
            println!("  since:     {}", info.timestamp);
            if let Some(metrics) = info.metrics {
                println!("  metrics:   {}", serde_json::to_string(&metrics)?);
            }
        }
        Err(e) => println!("breaker: OPEN (marker unreadable: {e})"),
    }
    println!("marker:   {}", config.app.marker_path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

fn build_kill_switch(config: &GuardConfig) -> Result<KillSwitch> {
    let breaker = Arc::new(CircuitBreaker::new(
        MarkerStore::new(&config.app.marker_path),
        Duration::from_millis(config.app.marker_cache_ttl_ms),
        config.app.authorized_operators.clone(),
    ));
    let execution = Arc::new(HttpExecutionSink::new(config.app.execution_url.clone())?);
    let alerts = Arc::new(WebhookAlertSink::new(config.app.alert_webhook_url.clone())?);

    Ok(KillSwitch::new(
        breaker,
        EvidenceLogger::new(&config.app.evidence_path),
        execution,
        alerts,
        Duration::from_millis(config.app.marker_io_timeout_ms),
    ))
}

fn verified_policies(config: &GuardConfig) -> Result<(ModuleLoader, Vec<PolicyModule>)> {
    let manifest = ModuleManifest::from_file(&config.app.manifest_path)
        .context("failed to load module manifest")?;
    let loader = ModuleLoader::from_manifest(&manifest)?;
    let policies = loader
        .load_policies()
        .context("policy module verification failed")?;
    Ok((loader, policies))
}

fn load_policies(config: &GuardConfig) -> Result<Vec<PolicyModule>> {
    let (loader, policies) = verified_policies(config)?;
    info!(
        modules = policies.len(),
        digests_computed = loader.digests_computed(),
        "policy modules verified"
    );
    Ok(policies)
}
