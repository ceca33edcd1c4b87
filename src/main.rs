use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use discourse_thread_archiver::bundle::target_dir;
use discourse_thread_archiver::config::Config;
use discourse_thread_archiver::{
    classify_directory, parse_thread_ref, sanitize, ArchiveEvent, Archiver, EventReporter,
};

/// Archive Discourse threads into self-contained directories.
#[derive(Debug, Parser)]
#[command(name = "thread-archiver", version, about)]
struct Cli {
    /// User API key; overrides `FORUM_API_KEY`.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the metadata of a thread as JSON.
    Resolve {
        /// Thread id or URL.
        thread: String,
    },
    /// Archive a thread into a directory.
    Archive {
        /// Thread id or URL.
        thread: String,
        /// Target directory.
        target: PathBuf,
        /// Replace author identities with pseudonyms.
        #[arg(long)]
        mask_users: bool,
        /// Always write into a child directory named after the thread.
        #[arg(long, conflicts_with = "no_create_subdir")]
        create_subdir: bool,
        /// Never create a child directory, even if the target is not empty.
        #[arg(long)]
        no_create_subdir: bool,
    },
    /// Report whether a directory is empty, holds a bundle of the thread, or
    /// holds something else.
    Classify {
        /// Thread id or URL.
        thread: String,
        /// Directory to inspect.
        target: PathBuf,
    },
    /// Print text sanitized for use as a file name.
    Sanitize { text: String },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    let cli = Cli::parse();
    match cli.command {
        Command::Sanitize { text } => {
            println!("{}", sanitize(&text));
            Ok(())
        }
        Command::Classify { thread, target } => {
            let thread_id = thread_id(&thread)?;
            let state = classify_directory(&target, thread_id)
                .await
                .with_context(|| format!("Failed to inspect {}", target.display()))?;
            println!("{}", serde_json::to_string(&state)?);
            Ok(())
        }
        Command::Resolve { thread } => {
            let thread_id = thread_id(&thread)?;
            let archiver = build_archiver(cli.token, EventReporter::discard())?;
            let meta = archiver
                .resolve_metadata(thread_id)
                .await
                .context("Failed to resolve thread")?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(())
        }
        Command::Archive {
            thread,
            target,
            mask_users,
            create_subdir,
            no_create_subdir,
        } => {
            let create_subdir = match (create_subdir, no_create_subdir) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            archive(cli.token, &thread, target, mask_users, create_subdir).await
        }
    }
}

async fn archive(
    token: Option<String>,
    thread: &str,
    target: PathBuf,
    mask_users: bool,
    create_subdir: Option<bool>,
) -> Result<()> {
    let thread_id = thread_id(thread)?;
    let (reporter, events) = EventReporter::channel();
    let archiver = build_archiver(token, reporter)?;

    archiver
        .validate_token()
        .await
        .context("Token rejected by the forum")?;
    let meta = archiver
        .resolve_metadata(thread_id)
        .await
        .context("Failed to resolve thread")?;
    info!(thread_id, title = %meta.title, posts = meta.post_ids.len(), "Resolved thread");

    let state = classify_directory(&target, thread_id)
        .await
        .with_context(|| format!("Failed to inspect {}", target.display()))?;
    let root = target_dir(&target, state, &meta.title, create_subdir);
    info!(?state, root = %root.display(), "Archiving");

    let cancel = CancellationToken::new();
    let progress = tokio::spawn(log_progress(events));
    let signal = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            warn!("Interrupted, stopping after in-flight requests");
            cancel.cancel();
        }
    });

    let result = archiver.run_archive(&meta, &root, mask_users, &cancel).await;
    signal.abort();
    // The archiver holds the last sender; dropping it ends the progress log.
    drop(archiver);
    let _ = progress.await;

    let summary = result.with_context(|| format!("Failed to archive thread {thread_id}"))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn thread_id(reference: &str) -> Result<u64> {
    match parse_thread_ref(reference) {
        Some(id) => Ok(id),
        None => bail!("'{reference}' is neither a thread id nor a thread URL"),
    }
}

fn build_archiver(token: Option<String>, reporter: EventReporter) -> Result<Archiver> {
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if token.is_some() {
        config.api_key = token;
    }
    info!(forum_url = %config.forum_url, "Configuration loaded");
    Archiver::new(config, reporter).context("Invalid configuration")
}

/// Turn the event stream into log lines until the run ends.
async fn log_progress(mut events: UnboundedReceiver<ArchiveEvent>) {
    let mut chunks_total = 0;
    let mut chunks_done = 0;
    let mut resources_total = 0;
    let mut resources_done = 0;

    while let Some(event) = events.recv().await {
        match event {
            ArchiveEvent::ChunksTotal(total) => chunks_total = total,
            ArchiveEvent::ChunkDownloaded => {
                chunks_done += 1;
                info!(
                    "Posts: chunk {chunks_done}/{chunks_total}, resources {resources_done}/{resources_total}"
                );
            }
            ArchiveEvent::ResourceTotalIncrement => resources_total += 1,
            ArchiveEvent::ResourceDownloadedIncrement => resources_done += 1,
            ArchiveEvent::RateLimit(0) => info!("Rate limit lifted, resuming"),
            ArchiveEvent::RateLimit(seconds) => {
                info!("Rate limited, resuming in {seconds}s");
            }
        }
    }
    info!("Resources: {resources_done}/{resources_total} processed");
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,discourse_thread_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    // Logs go to stderr; stdout carries command output.
    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
