//! Standalone PrismQ worker.
//!
//! Wires configuration, store, handler registry, heartbeat and monitor sweep
//! around one `WorkerEngine`, then runs until signaled.
//!
//! Exit codes: 0 clean shutdown, 1 initialization failure, 2 unrecoverable
//! database error, 3 too-many-consecutive-errors safety stop.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use prismq_core::{
    spawn_heartbeat, EngineError, HandlerRegistry, QueueConfig, StopHandle, WorkerEngine,
    WorkerOptions,
};
use prismq_queue_sqlite::{QueueOptions, SqliteQueue};

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_DATABASE_ERROR: i32 = 2;
const EXIT_TOO_MANY_ERRORS: i32 = 3;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    std::process::exit(run());
}

fn run() -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return EXIT_INIT_FAILURE;
        }
    };

    let db_path = config.resolved_db_path();
    let queue = match SqliteQueue::open_with_options(
        &db_path,
        QueueOptions {
            retry: config.retry.clone(),
        },
    ) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "failed to open queue database");
            return EXIT_DATABASE_ERROR;
        }
    };

    let registry = Arc::new(HandlerRegistry::new());
    if let Err(e) = handlers::register_builtin(&registry) {
        tracing::error!(error = %e, "failed to register built-in handlers");
        return EXIT_INIT_FAILURE;
    }
    if let Ok(manifest_path) = std::env::var("PRISMQ_HANDLER_MANIFEST") {
        match registry.apply_manifest_file(&manifest_path, true) {
            Ok(count) => tracing::info!(manifest = %manifest_path, count, "handler manifest applied"),
            Err(e) => {
                tracing::error!(manifest = %manifest_path, error = %e, "failed to apply handler manifest");
                return EXIT_INIT_FAILURE;
            }
        }
    }

    let options = WorkerOptions::from_config(&config);
    let worker_id = options.worker_id.clone();
    let engine = WorkerEngine::new(Arc::clone(&queue), registry, options);
    let stop = engine.stop_handle();

    let ctrlc_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        ctrlc_stop.stop();
    }) {
        tracing::error!(error = %e, "failed to install signal handler");
        return EXIT_INIT_FAILURE;
    }

    // Heartbeat must outpace both the lease duration and the stale
    // threshold.
    let heartbeat_interval =
        Duration::from_secs((config.lease_duration_seconds.max(3) as u64) / 3);
    let heartbeat = spawn_heartbeat(
        Arc::clone(&queue),
        worker_id.clone(),
        config.capabilities.clone(),
        heartbeat_interval,
    );

    let monitor = spawn_monitor(Arc::clone(&queue), &config, stop.clone());

    tracing::info!(
        worker_id = %worker_id,
        db_path = %db_path.display(),
        strategy = %config.scheduling_strategy,
        "worker starting"
    );

    let exit_code = match engine.run_loop(None) {
        Ok(summary) => {
            tracing::info!(
                iterations = summary.iterations,
                processed = summary.processed,
                "worker finished"
            );
            EXIT_OK
        }
        Err(EngineError::TooManyConsecutiveErrors { count, last }) => {
            tracing::error!(count, error = %last, "safety stop");
            EXIT_TOO_MANY_ERRORS
        }
        Err(EngineError::Store(e)) => {
            tracing::error!(error = %e, "unrecoverable store error");
            EXIT_DATABASE_ERROR
        }
    };

    stop.stop();
    heartbeat.stop();
    let _ = monitor.join();
    let _ = queue.remove_worker(&worker_id);

    exit_code
}

fn load_config() -> Result<QueueConfig, prismq_core::ConfigError> {
    let explicit_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PRISMQ_CONFIG").ok());

    match explicit_path {
        Some(path) => QueueConfig::load(path),
        None => {
            let mut config = QueueConfig::default();
            config.apply_env_overrides(prismq_core::ENV_PREFIX);
            Ok(config)
        }
    }
}

/// Periodic sweep: reclaim expired leases and drop stale workers.
fn spawn_monitor(
    queue: Arc<SqliteQueue>,
    config: &QueueConfig,
    stop: StopHandle,
) -> std::thread::JoinHandle<()> {
    let stale_threshold = config.stale_threshold_seconds;
    let sweep_interval = Duration::from_secs((config.lease_duration_seconds.max(2) as u64) / 2);

    std::thread::Builder::new()
        .name("queue-monitor".to_string())
        .spawn(move || {
            while !stop.is_stopped() {
                match queue.reclaim_expired_leases() {
                    Ok(outcome) if outcome.total() > 0 => {
                        tracing::info!(
                            requeued = outcome.requeued,
                            dead_lettered = outcome.dead_lettered,
                            "monitor sweep reclaimed leases"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "lease reclamation failed"),
                }

                if let Err(e) = queue.cleanup_stale_workers(stale_threshold, false) {
                    tracing::warn!(error = %e, "stale worker cleanup failed");
                }

                let mut remaining = sweep_interval;
                let slice = Duration::from_millis(100);
                while !stop.is_stopped() && remaining > Duration::ZERO {
                    let step = remaining.min(slice);
                    std::thread::sleep(step);
                    remaining = remaining.saturating_sub(step);
                }
            }
        })
        .expect("failed to spawn monitor thread")
}
