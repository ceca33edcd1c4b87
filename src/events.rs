//! Progress and rate-limit events streamed to the caller during a run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

/// Events emitted while resolving and archiving a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "value", rename_all = "kebab-case")]
pub enum ArchiveEvent {
    /// Total post chunks of the run. Emitted once, before any `ChunkDownloaded`.
    ChunksTotal(usize),
    /// A post chunk has been fetched.
    ChunkDownloaded,
    /// A new resource was discovered. The total is never known up front.
    ResourceTotalIncrement,
    /// A resource finished, including soft failures replaced by a placeholder.
    ResourceDownloadedIncrement,
    /// Throttled; the pipeline is suspended for this many more seconds.
    RateLimit(u64),
}

/// Cloneable sending half of the event stream.
///
/// Emitting never blocks and never fails: a caller that stopped listening
/// does not abort the run.
#[derive(Debug, Clone)]
pub struct EventReporter {
    tx: Option<mpsc::UnboundedSender<ArchiveEvent>>,
}

impl EventReporter {
    /// Create a reporter together with the receiving end of its stream.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ArchiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that drops every event.
    #[must_use]
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ArchiveEvent) {
        trace!(?event, "Archive event");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Snapshot of the counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub chunks_total: usize,
    pub chunks_downloaded: usize,
    pub resources_total: usize,
    pub resources_downloaded: usize,
}

#[derive(Debug, Default)]
struct Counters {
    chunks_total: AtomicUsize,
    chunks_downloaded: AtomicUsize,
    resources_total: AtomicUsize,
    resources_downloaded: AtomicUsize,
}

/// Per-run progress counters that emit the matching event on every change.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    reporter: EventReporter,
    counters: Arc<Counters>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(reporter: EventReporter) -> Self {
        Self {
            reporter,
            counters: Arc::default(),
        }
    }

    pub fn chunks_total(&self, total: usize) {
        self.counters.chunks_total.store(total, Ordering::SeqCst);
        self.reporter.emit(ArchiveEvent::ChunksTotal(total));
    }

    pub fn chunk_downloaded(&self) {
        self.counters.chunks_downloaded.fetch_add(1, Ordering::SeqCst);
        self.reporter.emit(ArchiveEvent::ChunkDownloaded);
    }

    pub fn resource_discovered(&self) {
        self.counters.resources_total.fetch_add(1, Ordering::SeqCst);
        self.reporter.emit(ArchiveEvent::ResourceTotalIncrement);
    }

    pub fn resource_downloaded(&self) {
        self.counters
            .resources_downloaded
            .fetch_add(1, Ordering::SeqCst);
        self.reporter.emit(ArchiveEvent::ResourceDownloadedIncrement);
    }

    #[must_use]
    pub fn snapshot(&self) -> RunProgress {
        RunProgress {
            chunks_total: self.counters.chunks_total.load(Ordering::SeqCst),
            chunks_downloaded: self.counters.chunks_downloaded.load(Ordering::SeqCst),
            resources_total: self.counters.resources_total.load(Ordering::SeqCst),
            resources_downloaded: self.counters.resources_downloaded.load(Ordering::SeqCst),
        }
    }
}
