//! The archival engine: one [`Archiver`] per forum, one `run_archive` per
//! thread.

pub mod downloader;
pub mod masking;
pub mod rate_limiter;
pub mod retry;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::pin::{pin, Pin};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use crate::bundle::{ArchiveWriter, WriteMode};
use crate::client::ForumClient;
use crate::config::Config;
use crate::error::ArchiveError;
use crate::events::{EventReporter, ProgressTracker, RunProgress};
use crate::resources::{
    discover_resources, normalize_reference, rewrite_references, ResourceKind, ResourceRef,
};
use crate::thread::metadata::summarize;
use crate::thread::posts::{archived_post, reaction_resource, reveal};
use crate::thread::{post_chunks, PostAuthor, PostChunk, RawPost, ThreadMeta};

pub use downloader::ResourceDownloader;
pub use masking::IdentityMasker;
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;

/// Longest sanitized text, in characters.
const MAX_SANITIZED_LENGTH: usize = 120;

/// Names Windows refuses as file or directory names.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Result of a completed archive run.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub root: PathBuf,
    pub mode: WriteMode,
    pub posts_written: usize,
    /// Posts in the bundle after the run, including ones kept from earlier runs.
    pub posts_in_bundle: usize,
    pub resources_stored: usize,
    pub resources_failed: usize,
    pub progress: RunProgress,
}

/// A post ready to be written once its resources have settled.
struct PendingPost {
    post: RawPost,
    author: PostAuthor,
    avatar: Option<Url>,
    /// Reaction emoji and how many users reacted with each.
    reactions: Vec<(Url, u64)>,
    content: String,
}

/// Archival engine bound to one forum and one event stream.
#[derive(Debug, Clone)]
pub struct Archiver {
    config: Config,
    client: ForumClient,
    reporter: EventReporter,
}

impl Archiver {
    /// Build an engine for the configured forum.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfig`] if the configuration is
    /// unusable.
    pub fn new(config: Config, reporter: EventReporter) -> Result<Self, ArchiveError> {
        config
            .validate()
            .map_err(|e| ArchiveError::InvalidConfig(e.to_string()))?;
        let client = ForumClient::new(&config, RateLimiter::new(reporter.clone()))?;
        Ok(Self {
            config,
            client,
            reporter,
        })
    }

    #[must_use]
    pub fn client(&self) -> &ForumClient {
        &self.client
    }

    /// Check that the configured token is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Auth`] if it is not.
    pub async fn validate_token(&self) -> Result<(), ArchiveError> {
        self.client.validate_token().await
    }

    /// Resolve the metadata of a thread.
    ///
    /// # Errors
    ///
    /// See [`crate::thread::resolve_metadata`].
    pub async fn resolve_metadata(&self, thread_id: u64) -> Result<ThreadMeta, ArchiveError> {
        crate::thread::resolve_metadata(&self.client, thread_id).await
    }

    /// Archive a thread into `target`, creating or updating the bundle there.
    ///
    /// Progress is reported through the engine's event stream. Posts are
    /// written chunk by chunk in thread order, each chunk only after every
    /// resource it references has been stored or replaced by a placeholder.
    /// A masked run fetches the whole thread before writing anything.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; whatever was written before it stays
    /// in place.
    #[instrument(
        skip(self, meta, target, cancel),
        fields(thread_id = meta.id, root = %target.display())
    )]
    pub async fn run_archive(
        &self,
        meta: &ThreadMeta,
        target: &Path,
        mask_users: bool,
        cancel: &CancellationToken,
    ) -> Result<ArchiveSummary, ArchiveError> {
        let progress = ProgressTracker::new(self.reporter.clone());
        let mut masker = mask_users.then(IdentityMasker::new);
        let base = self.client.base_url();

        let mut chunks = pin!(post_chunks(
            &self.client,
            meta,
            self.config.chunk_size,
            &progress
        ));

        // Masking needs every identity of the thread before the first post
        // is written, so the masked run fetches all chunks up front.
        let mut bundle_meta = meta.clone();
        let mut revealed = VecDeque::new();
        if let Some(masker) = masker.as_mut() {
            while let Some(chunk) = next_chunk(chunks.as_mut(), cancel).await? {
                revealed.push_back(self.reveal_chunk(meta.id, chunk).await?);
            }
            masker.register_thread(revealed.iter().flat_map(|chunk| chunk.posts.iter()));
            bundle_meta.description = masked_description(masker, meta, &revealed);
        }

        let mut writer = ArchiveWriter::open(target, &bundle_meta, mask_users).await?;
        let mut downloader = ResourceDownloader::new(
            self.client.clone(),
            target.to_path_buf(),
            progress.clone(),
            cancel.clone(),
            RetryPolicy::from_config(&self.config),
            self.config.resource_concurrency,
        );

        loop {
            let chunk = match revealed.pop_front() {
                Some(chunk) => chunk,
                None => match next_chunk(chunks.as_mut(), cancel).await? {
                    Some(chunk) => self.reveal_chunk(meta.id, chunk).await?,
                    None => break,
                },
            };
            debug!(chunk_index = chunk.index, posts = chunk.posts.len(), "Processing chunk");

            let mut pending = Vec::with_capacity(chunk.posts.len());
            for post in chunk.posts {
                let (author, avatar, content) = match masker.as_mut() {
                    Some(masker) => {
                        let author = masker.mask_author(&post);
                        let content = masker.mask_html(&post.cooked);
                        (author, None, content)
                    }
                    None => {
                        let avatar = self.avatar_resource(&post);
                        let avatar_url = avatar.as_ref().map(|r| r.source_url.clone());
                        if let Some(avatar) = avatar {
                            downloader.enqueue(avatar);
                        }
                        (author_of(&post), avatar_url, post.cooked.clone())
                    }
                };

                let mut reactions = Vec::with_capacity(post.retorts.len());
                for (emoji, count) in post
                    .retorts
                    .iter()
                    .filter_map(|retort| reaction_resource(retort, base))
                {
                    reactions.push((emoji.source_url.clone(), count));
                    downloader.enqueue(emoji);
                }
                for resource in discover_resources(&content, base) {
                    downloader.enqueue(resource);
                }
                pending.push(PendingPost {
                    post,
                    author,
                    avatar,
                    reactions,
                    content,
                });
            }

            downloader.settle().await?;
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }

            for PendingPost {
                post,
                mut author,
                avatar,
                reactions,
                content,
            } in pending
            {
                if let Some(url) = avatar {
                    author.avatar = downloader.resolve(&url);
                }
                let content = rewrite_references(&content, base, |url| downloader.resolve(url));
                let mut archived = archived_post(&post, author, content);
                for (url, count) in reactions {
                    if let Some(path) = downloader.resolve(&url) {
                        *archived.reactions.entry(path).or_insert(0) += count;
                    }
                }
                writer.write_post(&archived).await?;
            }
        }

        let posts_written = writer.posts_written();
        let mode = writer.mode();
        let root = writer.root().to_path_buf();
        let manifest = writer
            .finish(downloader.stored(), downloader.failed())
            .await?;

        let summary = ArchiveSummary {
            root,
            mode,
            posts_written,
            posts_in_bundle: manifest.posts.len(),
            resources_stored: manifest.resources.len(),
            resources_failed: manifest.failed_resources.len(),
            progress: progress.snapshot(),
        };
        info!(
            posts = summary.posts_written,
            resources = summary.resources_stored,
            failed = summary.resources_failed,
            "Archive run complete"
        );
        Ok(summary)
    }

    async fn reveal_chunk(
        &self,
        thread_id: u64,
        mut chunk: PostChunk,
    ) -> Result<PostChunk, ArchiveError> {
        let mut posts = Vec::with_capacity(chunk.posts.len());
        for post in chunk.posts {
            posts.push(reveal(&self.client, thread_id, post).await?);
        }
        chunk.posts = posts;
        Ok(chunk)
    }

    /// The author's avatar at the configured size.
    fn avatar_resource(&self, post: &RawPost) -> Option<ResourceRef> {
        let template = post.avatar_template.as_deref()?;
        let reference = template.replace("{size}", &self.config.avatar_size.to_string());
        let url = normalize_reference(&reference, self.client.base_url())?;
        Some(ResourceRef::new(url, ResourceKind::Avatar))
    }
}

/// Next chunk of the thread, or `None` once the stream is exhausted.
async fn next_chunk<S>(
    mut chunks: Pin<&mut S>,
    cancel: &CancellationToken,
) -> Result<Option<PostChunk>, ArchiveError>
where
    S: Stream<Item = Result<PostChunk, ArchiveError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ArchiveError::Cancelled),
        next = chunks.next() => next.transpose(),
    }
}

/// The thread description rebuilt from the masked first post.
fn masked_description(
    masker: &mut IdentityMasker,
    meta: &ThreadMeta,
    chunks: &VecDeque<PostChunk>,
) -> String {
    let first = meta.post_ids.first().and_then(|first_id| {
        chunks
            .iter()
            .flat_map(|chunk| chunk.posts.iter())
            .find(|post| post.id == *first_id)
    });
    match first {
        Some(post) => summarize(&masker.mask_html(&post.cooked)),
        None => masker.mask_text(&meta.description),
    }
}

fn author_of(post: &RawPost) -> PostAuthor {
    PostAuthor {
        user_id: post.user_id,
        username: post.username.clone(),
        display_name: post.name.clone().filter(|name| !name.trim().is_empty()),
        avatar: None,
    }
}

/// Make arbitrary text (typically a thread title) usable as a single file or
/// directory name on any platform.
///
/// Path separators and other reserved characters become `_`, whitespace is
/// collapsed, and the result is never empty.
#[must_use]
pub fn sanitize(text: &str) -> String {
    let replaced: String = text
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(MAX_SANITIZED_LENGTH).collect();
    let trimmed = truncated.trim_matches(|c: char| c == '.' || c == ' ' || c == '_');

    if trimmed.is_empty() {
        return "untitled".to_string();
    }
    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}
