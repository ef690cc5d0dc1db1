use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use novl_core::migration_contracts::BackendMode;
use novl_migration::{MigrationController, MigrationStateStore};
use novl_store::SessionStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "novl")]
#[command(about = "Chapter translation store administration", long_about = None)]
struct Cli {
    /// Path to the session store database
    #[arg(long, default_value = "novl-session.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the backend mode and per-service migration state
    Status,
    /// Set the global backend mode (legacy | migrating)
    SetBackend { mode: BackendMode },
    /// Begin shadow reads for a service
    Shadow { service: String },
    /// Advance a service from shadow to live reads
    EnableReads { service: String },
    /// Advance a service from reads to dual writes
    EnableDualWrites { service: String },
    /// Advance a service from dual writes to candidate-only writes
    EnableWrites { service: String },
    /// Mark a validated service's migration complete
    Complete { service: String },
    /// Flip the explicit routing switch for a service
    EnableService { service: String },
    /// Roll one service back to shadow, clearing all gates
    Rollback { service: String },
    /// Roll every service back and force the legacy backend
    EmergencyRollback,
    /// Recreate missing URL mappings from chapter records
    Backfill,
    /// Remove duplicate translation versions and repair active flags
    Cleanup,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = Arc::new(
        SessionStore::open(&cli.db)
            .with_context(|| format!("open session store at {}", cli.db.display()))?,
    );

    match cli.command {
        Commands::Backfill => {
            let report = store.backfill_url_mappings()?;
            println!(
                "scanned {} chapters, created {} mappings",
                report.chapters_scanned, report.mappings_created
            );
            return Ok(());
        }
        Commands::Cleanup => {
            let report = store.cleanup_duplicate_versions()?;
            println!(
                "removed {} duplicate versions, repaired {} chapters",
                report.duplicates_removed, report.chapters_repaired
            );
            return Ok(());
        }
        _ => {}
    }

    let controller =
        MigrationController::new(Arc::clone(&store) as Arc<dyn MigrationStateStore>)?;

    match cli.command {
        Commands::Status => {
            println!("backend mode: {}", controller.backend_mode());
            let status = controller.migration_status()?;
            if status.is_empty() {
                println!("no services under migration");
            }
            for (service, state) in status {
                println!(
                    "{service}: phase={} validated[shadow={} reads={} writes={}] enabled={} errors={}",
                    state.phase,
                    state.shadow_validated,
                    state.reads_validated,
                    state.writes_validated,
                    state.enabled,
                    state.error_count,
                );
                if let Some(last_error) = state.last_error {
                    println!("  last error: {last_error}");
                }
            }
        }
        Commands::SetBackend { mode } => {
            controller.set_backend(mode)?;
            println!("backend mode set to {mode}");
        }
        Commands::Shadow { service } => {
            let state = controller.start_shadow_reads(&service)?;
            println!("{service}: phase={}", state.phase);
        }
        Commands::EnableReads { service } => {
            let state = controller.enable_reads(&service)?;
            println!("{service}: phase={}", state.phase);
        }
        Commands::EnableDualWrites { service } => {
            let state = controller.enable_dual_writes(&service)?;
            println!("{service}: phase={}", state.phase);
        }
        Commands::EnableWrites { service } => {
            let state = controller.enable_writes(&service)?;
            println!("{service}: phase={}", state.phase);
        }
        Commands::Complete { service } => {
            let state = controller.complete_migration(&service)?;
            println!("{service}: phase={}", state.phase);
        }
        Commands::EnableService { service } => {
            let state = controller.enable_service(&service)?;
            println!("{service}: routing enabled (phase={})", state.phase);
        }
        Commands::Rollback { service } => {
            let state = controller.rollback_service(&service)?;
            println!("{service}: rolled back to phase={}", state.phase);
        }
        Commands::EmergencyRollback => {
            controller.emergency_rollback()?;
            println!("all services rolled back, backend mode forced to legacy");
        }
        Commands::Backfill | Commands::Cleanup => {}
    }

    Ok(())
}
