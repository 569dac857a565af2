//! synd-send - Background daemon for scheduled publishing
//!
//! Runs the dispatcher and publish workers against the shared store,
//! moving due posts through the queue and out to their platforms.

use clap::Parser;
use libsyndicate::config::Config;
use libsyndicate::credentials::{CredentialManager, CredentialVault, FileVault, RefreshPolicy};
use libsyndicate::dispatcher::Dispatcher;
use libsyndicate::events::EventBus;
use libsyndicate::lock::LockService;
use libsyndicate::platforms::mock::MockAdapter;
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::queue::JobQueue;
use libsyndicate::rate_limiter::RateLimiter;
use libsyndicate::repository::{PostRepository, SqlitePostRepository};
use libsyndicate::store::{SharedStore, SqliteStore};
use libsyndicate::worker::PublishWorker;
use libsyndicate::Result;
use secrecy::SecretString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "synd-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled publishing")]
#[command(long_about = "\
synd-send - Background daemon for scheduled publishing

DESCRIPTION:
    synd-send is a long-running daemon that watches for due posts and
    publishes them. Each pass it dispatches due posts onto the durable
    job queue under per-post locks, then workers claim jobs, pass the
    rate limiter, refresh credentials when needed, and call the
    platform adapter. Failed attempts retry with exponential backoff
    until the post or the job runs out of attempts.

    Multiple daemons may share one database: per-post locks and the
    atomic queue claim keep every post delivered to exactly one worker.

USAGE:
    # Run in foreground (logs to stderr)
    synd-send

    # Run with custom poll interval
    synd-send --poll-interval 30

    # Enable verbose logging
    synd-send --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes current attempt)

CONFIGURATION:
    Configuration file: ~/.config/syndicate/config.toml
    Database location: ~/.local/share/syndicate/syndicate.db

    Override with environment variables:
        SYNDICATE_CONFIG      - Path to config file
        SYNDICATE_PASSPHRASE  - Credential vault passphrase

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    #[arg(help = "How often to look for due posts (default: from config)")]
    poll_interval: Option<u64>,

    /// Number of publish workers
    #[arg(long, default_value_t = 2)]
    #[arg(help = "Concurrent publish workers to run")]
    workers: usize,

    /// Credential vault passphrase
    #[arg(long, env = "SYNDICATE_PASSPHRASE", hide_env_values = true)]
    passphrase: String,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    #[arg(help = "Enable verbose logging (useful for debugging)")]
    verbose: bool,

    /// Run one dispatch pass and drain the queue, then exit
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("synd-send failed: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libsyndicate::SyndicateError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let store_path = config.store_path().to_string_lossy().to_string();

    let store: Arc<dyn SharedStore> = Arc::new(SqliteStore::new(&store_path).await?);
    let repo: Arc<dyn PostRepository> = Arc::new(SqlitePostRepository::new(&store_path).await?);

    let events = EventBus::default();
    let queue = JobQueue::new(store.clone(), config.queue.policy(), events.clone());
    let locks = LockService::new(
        store.clone(),
        Duration::from_secs(config.scheduler.lock_ttl_secs),
    );
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone(), events.clone()));

    let vault: Arc<dyn CredentialVault> = Arc::new(FileVault::new(config.vault_path()));
    let credentials = Arc::new(CredentialManager::new(
        vault,
        SecretString::from(cli.passphrase),
        RefreshPolicy::default(),
        events.clone(),
    ));

    // Platform adapters register here; the mock adapter covers local
    // smoke testing against accounts on the "mock" platform.
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(MockAdapter::new("mock")));
    let registry = Arc::new(registry);

    info!("synd-send daemon starting");
    info!(platforms = ?registry.platforms(), "Registered platform adapters");

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let poll_interval =
        Duration::from_secs(cli.poll_interval.unwrap_or(config.scheduler.poll_interval_secs));
    info!("Poll interval: {}s", poll_interval.as_secs());

    let dispatcher = Dispatcher::new(
        repo.clone(),
        queue.clone(),
        locks,
        events.clone(),
        &config.scheduler,
    );

    if cli.once {
        dispatcher.tick().await?;
        let worker = PublishWorker::new(
            repo,
            queue.clone(),
            registry,
            credentials,
            limiter,
            events,
        );
        while worker.process_one(Duration::from_millis(100)).await? {}
        info!("synd-send: processed due posts once, exiting");
        return Ok(());
    }

    let mut tasks = Vec::new();
    for n in 0..cli.workers.max(1) {
        let worker = PublishWorker::new(
            repo.clone(),
            queue.clone(),
            registry.clone(),
            credentials.clone(),
            limiter.clone(),
            events.clone(),
        );
        let flag = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = worker.run(flag).await {
                error!(worker = n, error = %e, "Worker exited with error");
            }
        }));
    }

    dispatcher.run(poll_interval, shutdown).await?;

    for task in tasks {
        let _ = task.await;
    }

    info!("synd-send daemon stopped");
    Ok(())
}
