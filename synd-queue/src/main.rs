//! synd-queue - Inspect and manage the publish pipeline
//!
//! Operator tool for the queue and the posts flowing through it: list
//! posts by state, cancel or reschedule them, and work the dead-letter
//! queue.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libsyndicate::config::Config;
use libsyndicate::dispatcher::PUBLISH_JOB;
use libsyndicate::queue::JobQueue;
use libsyndicate::repository::{PostRepository, SqlitePostRepository};
use libsyndicate::store::{SharedStore, SqliteStore};
use libsyndicate::types::PostStatus;
use libsyndicate::{Result, SyndicateError};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "synd-queue")]
#[command(version)]
#[command(about = "Inspect and manage the publish pipeline")]
#[command(long_about = "\
synd-queue - Inspect and manage the publish pipeline

DESCRIPTION:
    synd-queue is an operator tool for the Syndicate pipeline. Use it
    to view queue statistics, list posts by lifecycle state, cancel or
    reschedule posts, and inspect or requeue dead-lettered jobs.

COMMANDS:
    stats       Show ready/in-flight/dead job counts
    list        List posts in a lifecycle state
    cancel      Cancel a post
    reschedule  Move a post to a new time
    dlq         Inspect or requeue dead-lettered jobs

USAGE EXAMPLES:
    # Queue statistics
    synd-queue stats

    # Posts that failed terminally
    synd-queue list --status failed

    # Cancel a post
    synd-queue cancel 0c23…

    # Try again tomorrow morning
    synd-queue reschedule 0c23… 2026-08-25T09:00:00Z

    # Inspect the dead-letter queue, then give a job another run
    synd-queue dlq list
    synd-queue dlq requeue 7f1a…

CONFIGURATION:
    Configuration file: ~/.config/syndicate/config.toml
    Database location: ~/.local/share/syndicate/syndicate.db

    Override with environment variables:
        SYNDICATE_CONFIG - Path to config file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Configuration error
    3 - Invalid input (bad post ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show queue statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List posts in a lifecycle state
    List {
        /// Lifecycle state: draft, scheduled, queued, publishing,
        /// published, failed, canceled
        #[arg(short, long, default_value = "scheduled")]
        status: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a post
    Cancel {
        /// Post ID to cancel
        post_id: String,
    },

    /// Reschedule a post
    Reschedule {
        /// Post ID to reschedule
        post_id: String,

        /// New schedule time, RFC 3339 (e.g. 2026-08-25T09:00:00Z)
        time: String,
    },

    /// Inspect or requeue dead-lettered jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCommands {
    /// List dead-lettered jobs
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Return a dead-lettered job to the ready queue
    Requeue {
        /// Job ID to requeue
        job_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "error" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let store_path = config.store_path().to_string_lossy().to_string();

    let store: Arc<dyn SharedStore> = Arc::new(SqliteStore::new(&store_path).await?);
    let queue = JobQueue::new(
        store,
        config.queue.policy(),
        libsyndicate::EventBus::default(),
    );
    let repo = SqlitePostRepository::new(&store_path).await?;

    match cli.command {
        Commands::Stats { format } => stats(&queue, &format).await,
        Commands::List { status, format } => list(&repo, &status, &format).await,
        Commands::Cancel { post_id } => cancel(&repo, &post_id).await,
        Commands::Reschedule { post_id, time } => reschedule(&repo, &post_id, &time).await,
        Commands::Dlq { command } => match command {
            DlqCommands::List { format } => dlq_list(&queue, &format).await,
            DlqCommands::Requeue { job_id } => dlq_requeue(&queue, &job_id).await,
        },
    }
}

async fn stats(queue: &JobQueue, format: &str) -> Result<()> {
    let stats = queue.stats(PUBLISH_JOB).await?;

    if format == "json" {
        println!(
            "{}",
            serde_json::json!({
                "ready": stats.ready,
                "processing": stats.processing,
                "dead": stats.dead,
            })
        );
    } else {
        println!("Publish queue:");
        println!("  ready:      {}", stats.ready);
        println!("  in flight:  {}", stats.processing);
        println!("  dead:       {}", stats.dead);
    }
    Ok(())
}

fn parse_status(status: &str) -> Result<PostStatus> {
    match status {
        "draft" => Ok(PostStatus::Draft),
        "scheduled" => Ok(PostStatus::Scheduled),
        "queued" => Ok(PostStatus::Queued),
        "publishing" => Ok(PostStatus::Publishing),
        "published" => Ok(PostStatus::Published),
        "failed" => Ok(PostStatus::Failed),
        "canceled" => Ok(PostStatus::Canceled),
        other => Err(SyndicateError::InvalidInput(format!(
            "Unknown status: {}",
            other
        ))),
    }
}

async fn list(repo: &SqlitePostRepository, status: &str, format: &str) -> Result<()> {
    let posts = repo.find_by_status(parse_status(status)?).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&posts).unwrap_or_default());
        return Ok(());
    }

    if posts.is_empty() {
        println!("No {} posts.", status);
        return Ok(());
    }

    for post in posts {
        let when = post
            .scheduled_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let text: String = post.content.text.chars().take(50).collect();
        println!("{}  {}  {}  {}", post.id, post.status, when, text);
        if let Some(error) = post.last_error {
            println!("    last error: {}", error);
        }
    }
    Ok(())
}

async fn cancel(repo: &SqlitePostRepository, post_id: &str) -> Result<()> {
    let mut post = repo
        .find_by_id(post_id)
        .await?
        .ok_or_else(|| SyndicateError::InvalidInput(format!("No such post: {}", post_id)))?;

    post.cancel()?;
    repo.update(&post).await?;
    println!("Canceled post {}", post_id);
    Ok(())
}

async fn reschedule(repo: &SqlitePostRepository, post_id: &str, time: &str) -> Result<()> {
    let when: DateTime<Utc> = time
        .parse()
        .map_err(|_| SyndicateError::InvalidInput(format!("Invalid RFC 3339 time: {}", time)))?;

    let mut post = repo
        .find_by_id(post_id)
        .await?
        .ok_or_else(|| SyndicateError::InvalidInput(format!("No such post: {}", post_id)))?;

    post.schedule(when)?;
    repo.update(&post).await?;
    println!("Rescheduled post {} for {}", post_id, when.to_rfc3339());
    Ok(())
}

async fn dlq_list(queue: &JobQueue, format: &str) -> Result<()> {
    let jobs = queue.dead_letter_jobs(PUBLISH_JOB).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&jobs).unwrap_or_default());
        return Ok(());
    }

    if jobs.is_empty() {
        println!("Dead-letter queue is empty.");
        return Ok(());
    }

    for job in jobs {
        println!(
            "{}  retries={}  post={}",
            job.id,
            job.retry_count,
            job.payload.get("post_id").map(String::as_str).unwrap_or("-")
        );
        if let Some(error) = job.last_error {
            println!("    last error: {}", error);
        }
    }
    Ok(())
}

async fn dlq_requeue(queue: &JobQueue, job_id: &str) -> Result<()> {
    if queue.requeue_dead(PUBLISH_JOB, job_id).await? {
        println!("Requeued job {}", job_id);
        Ok(())
    } else {
        Err(SyndicateError::InvalidInput(format!(
            "Job not in the dead-letter queue: {}",
            job_id
        )))
    }
}
