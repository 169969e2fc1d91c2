use std::sync::Arc;

use ingest_orchestrator::config::{OrchestratorConfig, StorageConfig};
use ingest_orchestrator::dispatch::{Orchestrator, WorkerRegistry};
use ingest_orchestrator::events::EventBus;
use ingest_orchestrator::jobs::JobDefinition;
use ingest_orchestrator::monitor::{JobMonitor, StepMonitor, WatchRegistry};
use ingest_orchestrator::scheduler::SchedulerService;
use ingest_orchestrator::state::StateManager;
use ingest_orchestrator::store::{Database, LibSqlStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    // Initialize tracing; the guard flushes the file writer on exit
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "ingest.log"));
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("📥 Ingest Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let store = match &config.storage {
        StorageConfig::Local(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            eprintln!("   Database: {}", path.display());
            LibSqlStore::new_local(path).await
        }
        StorageConfig::Memory => {
            eprintln!("   Database: in-memory");
            LibSqlStore::new_memory().await
        }
    };
    let db: Arc<dyn Database> = Arc::new(store.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database: {e}");
        std::process::exit(1);
    }));

    // ── State & Events ───────────────────────────────────────────────────
    let bus = EventBus::new();
    let state = Arc::new(StateManager::new(db, Arc::clone(&bus)));

    // ── Monitors ─────────────────────────────────────────────────────────
    let watches = WatchRegistry::new();
    let job_monitor = Arc::new(JobMonitor::new(
        Arc::clone(&state),
        config.monitor.clone(),
        Arc::clone(&watches),
    ));
    let step_monitor = Arc::new(StepMonitor::new(
        Arc::clone(&state),
        config.monitor.clone(),
        Arc::clone(&watches),
    ));
    let subscriptions = job_monitor.subscribe_to_job_events();
    eprintln!(
        "   Monitors: poll {:?}, max wait {:?} ({} event subscriptions)",
        config.monitor.poll_interval, config.monitor.max_wait, subscriptions
    );

    // ── Dispatch ─────────────────────────────────────────────────────────
    let workers = Arc::new(WorkerRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&state),
        Arc::clone(&workers),
        Arc::clone(&job_monitor),
        step_monitor,
        config.dispatch.clone(),
    ));
    eprintln!("   Workers: {} registered", workers.count());

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Arc::new(
        SchedulerService::new(Arc::clone(&state), config.scheduler.clone())
            .with_crash_dir(config.monitor.crash_dir.clone()),
    );
    let orphans = scheduler.cleanup_orphaned_jobs().await?;
    if orphans > 0 {
        eprintln!("   Cleaned up {orphans} orphaned jobs ({})", config.scheduler.orphan_policy);
    }
    if let Some(path) = &config.definitions_path {
        let raw = std::fs::read_to_string(path)?;
        let definitions: Vec<JobDefinition> = serde_json::from_str(&raw)?;
        let scheduled = scheduler
            .load_job_definitions(definitions, Arc::clone(&orchestrator))
            .await?;
        eprintln!("   Definitions: {scheduled} scheduled from {}", path.display());
    }
    scheduler.start().await?;
    eprintln!("   Scheduler: started (tick {:?})", config.scheduler.tick_interval);
    eprintln!("   Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c().await?;

    eprintln!("\nShutting down...");
    scheduler.stop().await;
    job_monitor.unsubscribe_from_job_events();
    bus.close();
    Ok(())
}
