//! Concurrent, at-most-once resource downloads for one archive run.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::retry::{with_retry, RetryPolicy};
use crate::client::ForumClient;
use crate::constants::{PLACEHOLDER_AVATAR, PLACEHOLDER_RESOURCE};
use crate::error::{ArchiveError, RequestError};
use crate::events::ProgressTracker;
use crate::fs_utils::write_atomic;
use crate::resources::{ResourceKind, ResourceRef};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Stored,
    Failed,
}

#[derive(Debug)]
struct Shared {
    client: ForumClient,
    root: PathBuf,
    progress: ProgressTracker,
    cancel: CancellationToken,
    retry: RetryPolicy,
    permits: Semaphore,
    /// Claimed source URLs. A URL is inserted before its download is
    /// spawned, which is what makes downloads at-most-once.
    seen: Mutex<HashSet<Url>>,
    outcomes: Mutex<HashMap<Url, (ResourceRef, Outcome)>>,
}

/// Downloads resources into `<root>/resources` as they are discovered.
///
/// Downloads run on up to `concurrency` workers. [`ResourceDownloader::settle`]
/// waits for everything enqueued so far; only after that may content that
/// references those resources be written.
#[derive(Debug)]
pub struct ResourceDownloader {
    shared: Arc<Shared>,
    tasks: JoinSet<Result<(), ArchiveError>>,
}

impl ResourceDownloader {
    #[must_use]
    pub fn new(
        client: ForumClient,
        root: PathBuf,
        progress: ProgressTracker,
        cancel: CancellationToken,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                root,
                progress,
                cancel,
                retry,
                permits: Semaphore::new(concurrency.max(1)),
                seen: Mutex::new(HashSet::new()),
                outcomes: Mutex::new(HashMap::new()),
            }),
            tasks: JoinSet::new(),
        }
    }

    /// Claim `resource` and start downloading it unless it was seen before.
    ///
    /// Returns whether the resource was new to this run.
    pub fn enqueue(&mut self, resource: ResourceRef) -> bool {
        let newly_seen = self
            .shared
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.source_url.clone());
        if !newly_seen {
            return false;
        }

        debug!(url = %resource.source_url, path = %resource.local_path, "Discovered resource");
        self.shared.progress.resource_discovered();
        let shared = Arc::clone(&self.shared);
        self.tasks.spawn(async move { fetch_resource(shared, resource).await });
        true
    }

    /// Wait for every enqueued download to finish.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any download (write failure, rejected
    /// token, cancellation). Remaining downloads are aborted.
    pub async fn settle(&mut self) -> Result<(), ArchiveError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.tasks.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
        Ok(())
    }

    /// Bundle path that content should use for `url`: the stored file, the
    /// placeholder for a failed download, or `None` if the URL was never
    /// downloaded in this run.
    #[must_use]
    pub fn resolve(&self, url: &Url) -> Option<String> {
        let outcomes = self
            .shared
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (resource, outcome) = outcomes.get(url)?;
        Some(match (outcome, resource.kind) {
            (Outcome::Stored, _) => resource.local_path.clone(),
            (Outcome::Failed, ResourceKind::Avatar) => PLACEHOLDER_AVATAR.to_string(),
            (Outcome::Failed, _) => PLACEHOLDER_RESOURCE.to_string(),
        })
    }

    /// Source URL to bundle path of every resource stored in this run.
    #[must_use]
    pub fn stored(&self) -> BTreeMap<String, String> {
        self.collect(&Outcome::Stored)
            .into_iter()
            .map(|r| (r.source_url.to_string(), r.local_path))
            .collect()
    }

    /// Source URLs that could not be downloaded in this run.
    #[must_use]
    pub fn failed(&self) -> BTreeSet<String> {
        self.collect(&Outcome::Failed)
            .into_iter()
            .map(|r| r.source_url.to_string())
            .collect()
    }

    fn collect(&self, wanted: &Outcome) -> Vec<ResourceRef> {
        self.shared
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(_, outcome)| outcome == wanted)
            .map(|(resource, _)| resource.clone())
            .collect()
    }
}

async fn fetch_resource(shared: Arc<Shared>, resource: ResourceRef) -> Result<(), ArchiveError> {
    let _permit = tokio::select! {
        biased;
        () = shared.cancel.cancelled() => return Err(ArchiveError::Cancelled),
        permit = shared.permits.acquire() => permit.map_err(|_| ArchiveError::Cancelled)?,
    };

    let target = shared.root.join(&resource.local_path);
    let outcome = if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        debug!(path = %target.display(), "Resource already in bundle");
        Outcome::Stored
    } else {
        let url = &resource.source_url;
        let download = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => return Err(ArchiveError::Cancelled),
            result = with_retry(&shared.retry, || shared.client.get_bytes(url)) => result,
        };

        match download {
            Ok(download) => {
                debug!(
                    %url,
                    bytes = download.bytes.len(),
                    content_type = download.content_type.as_deref().unwrap_or(""),
                    "Downloaded resource"
                );
                write_atomic(target, download.bytes).await?;
                Outcome::Stored
            }
            Err(e @ RequestError::Unauthorized(_)) if same_origin(url, shared.client.base_url()) => {
                return Err(e.into_archive_error(0));
            }
            Err(e @ RequestError::InvalidRetryAfter(_)) => return Err(e.into_archive_error(0)),
            Err(e) => {
                warn!(%url, error = %e, "Resource download failed, using placeholder");
                Outcome::Failed
            }
        }
    };

    shared
        .outcomes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(resource.source_url.clone(), (resource, outcome));
    shared.progress.resource_downloaded();
    Ok(())
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::archiver::rate_limiter::RateLimiter;
    use crate::config::Config;
    use crate::events::EventReporter;

    fn downloader(root: PathBuf, cancel: CancellationToken) -> ResourceDownloader {
        // Nothing listens on this port; any download attempt fails fast.
        let config = Config::for_testing("http://127.0.0.1:9/");
        let client = ForumClient::new(&config, RateLimiter::new(EventReporter::discard())).unwrap();
        ResourceDownloader::new(
            client,
            root,
            ProgressTracker::new(EventReporter::discard()),
            cancel,
            RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                jitter: false,
            },
            2,
        )
    }

    fn resource(url: &str) -> ResourceRef {
        ResourceRef::new(Url::parse(url).unwrap(), ResourceKind::Image)
    }

    #[tokio::test]
    async fn test_existing_file_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let res = resource("http://127.0.0.1:9/uploads/cat.png");
        let path = dir.path().join(&res.local_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"cached").unwrap();

        let mut downloader = downloader(dir.path().to_path_buf(), CancellationToken::new());
        assert!(downloader.enqueue(res.clone()));
        downloader.settle().await.unwrap();

        assert_eq!(downloader.resolve(&res.source_url), Some(res.local_path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = downloader(dir.path().to_path_buf(), CancellationToken::new());
        let res = resource("http://127.0.0.1:9/uploads/dog.png");
        assert!(downloader.enqueue(res.clone()));
        assert!(!downloader.enqueue(res.clone()));
        downloader.settle().await.unwrap();
        assert_eq!(downloader.stored().len() + downloader.failed().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_resolves_to_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = downloader(dir.path().to_path_buf(), CancellationToken::new());
        let res = resource("http://127.0.0.1:9/uploads/gone.png");
        let avatar = ResourceRef::new(
            Url::parse("http://127.0.0.1:9/user_avatar/forum/a/48/1.png").unwrap(),
            ResourceKind::Avatar,
        );
        downloader.enqueue(res.clone());
        downloader.enqueue(avatar.clone());
        downloader.settle().await.unwrap();

        assert_eq!(
            downloader.resolve(&res.source_url).as_deref(),
            Some(PLACEHOLDER_RESOURCE)
        );
        assert_eq!(
            downloader.resolve(&avatar.source_url).as_deref(),
            Some(PLACEHOLDER_AVATAR)
        );
        assert_eq!(downloader.failed().len(), 2);
        assert!(!dir.path().join(&res.local_path).exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut downloader = downloader(dir.path().to_path_buf(), cancel);
        downloader.enqueue(resource("http://127.0.0.1:9/uploads/x.png"));
        assert!(matches!(downloader.settle().await, Err(ArchiveError::Cancelled)));
    }

    #[test]
    fn test_unknown_url_does_not_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = downloader(dir.path().to_path_buf(), CancellationToken::new());
        assert_eq!(
            downloader.resolve(&Url::parse("http://127.0.0.1:9/never.png").unwrap()),
            None
        );
    }
}
