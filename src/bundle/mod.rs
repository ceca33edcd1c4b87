//! On-disk bundle layout, target classification and update-mode merging.
//!
//! ```text
//! <root>/metadata.json        sentinel + manifest
//! <root>/posts/<id>.json      one archived post per file
//! <root>/resources/...        downloaded resources and placeholders
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{
    BUNDLE_FORMAT_VERSION, METADATA_FILE, PLACEHOLDER_AVATAR, PLACEHOLDER_AVATAR_SVG,
    PLACEHOLDER_RESOURCE, PLACEHOLDER_RESOURCE_SVG, POSTS_DIR, RESOURCES_DIR,
};
use crate::error::ArchiveError;
use crate::fs_utils::{write_atomic, write_json_atomic};
use crate::thread::{ArchivedPost, ThreadMeta};

/// What a target directory currently holds, relative to one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryState {
    /// Missing or empty: a fresh bundle can be written in place.
    Empty,
    /// Has contents that are not a bundle of this thread.
    NonEmpty,
    /// Holds a previous bundle of this thread; archiving updates it.
    PriorBundle,
}

/// Whether a run created a bundle or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Fresh,
    Update,
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub format_version: u32,
    pub thread: ThreadMeta,
    /// Archived posts in display order. Posts no longer present upstream
    /// are kept after the upstream ones.
    pub posts: Vec<u64>,
    /// Source URL to bundle path of every stored resource.
    pub resources: BTreeMap<String, String>,
    /// Source URLs that are currently shown as placeholders.
    pub failed_resources: BTreeSet<String>,
    pub masked: bool,
    pub archived_at: DateTime<Utc>,
}

/// Classify `path` for archiving `thread_id` into it.
///
/// # Errors
///
/// Returns [`ArchiveError::Write`] if the directory exists but cannot be
/// read.
pub async fn classify_directory(
    path: &Path,
    thread_id: u64,
) -> Result<DirectoryState, ArchiveError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DirectoryState::Empty),
        Err(e) => return Err(ArchiveError::write(path, e)),
    };
    if !metadata.is_dir() {
        return Ok(DirectoryState::NonEmpty);
    }

    if let Some(manifest) = read_manifest(path).await? {
        if manifest.thread.id == thread_id {
            return Ok(DirectoryState::PriorBundle);
        }
        debug!(
            path = %path.display(),
            found = manifest.thread.id,
            wanted = thread_id,
            "Directory holds a bundle of another thread"
        );
        return Ok(DirectoryState::NonEmpty);
    }

    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| ArchiveError::write(path, e))?;
    match entries.next_entry().await {
        Ok(None) => Ok(DirectoryState::Empty),
        Ok(Some(_)) => Ok(DirectoryState::NonEmpty),
        Err(e) => Err(ArchiveError::write(path, e)),
    }
}

/// Directory a run should write into, given the classification of `path`.
///
/// Empty targets and prior bundles are written in place. Any other
/// non-empty directory gets a child named after the thread title, unless
/// `create_subdir` says otherwise.
#[must_use]
pub fn target_dir(
    path: &Path,
    state: DirectoryState,
    title: &str,
    create_subdir: Option<bool>,
) -> PathBuf {
    let nest = create_subdir.unwrap_or(state == DirectoryState::NonEmpty);
    if nest {
        path.join(crate::archiver::sanitize(title))
    } else {
        path.to_path_buf()
    }
}

/// Read the manifest of a bundle rooted at `root`.
///
/// Returns `None` if there is no manifest or it is not a bundle manifest.
///
/// # Errors
///
/// Returns [`ArchiveError::Write`] if the file exists but cannot be read.
pub async fn read_manifest(root: &Path) -> Result<Option<BundleManifest>, ArchiveError> {
    let path = root.join(METADATA_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ArchiveError::write(path, e)),
    };
    match serde_json::from_slice(&bytes) {
        Ok(manifest) => Ok(Some(manifest)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable metadata file");
            Ok(None)
        }
    }
}

/// Writes one run's output into a bundle, merging with a prior bundle of the
/// same thread.
#[derive(Debug)]
pub struct ArchiveWriter {
    root: PathBuf,
    thread: ThreadMeta,
    masked: bool,
    mode: WriteMode,
    prior: Option<BundleManifest>,
    written: HashSet<u64>,
}

impl ArchiveWriter {
    /// Prepare `root` for writing and record the thread in its manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Write`] on any filesystem failure, or if
    /// `root` already holds the bundle of another thread.
    pub async fn open(
        root: &Path,
        thread: &ThreadMeta,
        masked: bool,
    ) -> Result<Self, ArchiveError> {
        let prior = match read_manifest(root).await? {
            Some(manifest) if manifest.thread.id != thread.id => {
                warn!(
                    root = %root.display(),
                    found = manifest.thread.id,
                    wanted = thread.id,
                    "Refusing to overwrite the bundle of another thread"
                );
                return Err(ArchiveError::write(
                    root.join(METADATA_FILE),
                    io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("directory holds the bundle of thread {}", manifest.thread.id),
                    ),
                ));
            }
            prior => prior,
        };

        for dir in [root.to_path_buf(), root.join(POSTS_DIR), root.join(RESOURCES_DIR)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ArchiveError::write(&dir, e))?;
        }

        let mode = if prior.is_some() {
            WriteMode::Update
        } else {
            WriteMode::Fresh
        };
        info!(root = %root.display(), thread_id = thread.id, ?mode, "Opening bundle");

        for (relative, svg) in [
            (PLACEHOLDER_RESOURCE, PLACEHOLDER_RESOURCE_SVG),
            (PLACEHOLDER_AVATAR, PLACEHOLDER_AVATAR_SVG),
        ] {
            let path = root.join(relative);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                write_atomic(path, svg.as_bytes().to_vec()).await?;
            }
        }

        let writer = Self {
            root: root.to_path_buf(),
            thread: thread.clone(),
            masked,
            mode,
            prior,
            written: HashSet::new(),
        };
        // The sentinel goes down first so an interrupted run is recognized
        // and repaired by the next one.
        writer
            .write_manifest(BTreeMap::new(), BTreeSet::new())
            .await?;
        Ok(writer)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Write (or overwrite) one post.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Write`] naming the post file on failure.
    pub async fn write_post(&mut self, post: &ArchivedPost) -> Result<(), ArchiveError> {
        let path = self.post_path(post.id);
        write_json_atomic(path, post).await?;
        self.written.insert(post.id);
        Ok(())
    }

    #[must_use]
    pub fn posts_written(&self) -> usize {
        self.written.len()
    }

    /// Write the final manifest, merging this run's resources with the
    /// prior bundle's.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Write`] if the manifest cannot be written.
    pub async fn finish(
        self,
        stored: BTreeMap<String, String>,
        failed: BTreeSet<String>,
    ) -> Result<BundleManifest, ArchiveError> {
        let manifest = self.write_manifest(stored, failed).await?;
        info!(
            root = %self.root.display(),
            posts = manifest.posts.len(),
            resources = manifest.resources.len(),
            failed = manifest.failed_resources.len(),
            "Bundle complete"
        );
        Ok(manifest)
    }

    async fn write_manifest(
        &self,
        stored: BTreeMap<String, String>,
        failed: BTreeSet<String>,
    ) -> Result<BundleManifest, ArchiveError> {
        let manifest = self.merged_manifest(stored, failed);
        write_json_atomic(self.root.join(METADATA_FILE), &manifest).await?;
        Ok(manifest)
    }

    fn merged_manifest(
        &self,
        stored: BTreeMap<String, String>,
        failed: BTreeSet<String>,
    ) -> BundleManifest {
        let (prior_posts, mut resources, mut failed_resources) = match &self.prior {
            Some(prior) => (
                prior.posts.clone(),
                prior.resources.clone(),
                prior.failed_resources.clone(),
            ),
            None => Default::default(),
        };

        for url in stored.keys() {
            failed_resources.remove(url);
        }
        resources.extend(stored);
        failed_resources.extend(failed);

        let present: HashSet<u64> = self
            .written
            .iter()
            .chain(prior_posts.iter())
            .copied()
            .collect();
        let upstream: HashSet<u64> = self.thread.post_ids.iter().copied().collect();
        let posts = self
            .thread
            .post_ids
            .iter()
            .copied()
            .filter(|id| present.contains(id))
            .chain(prior_posts.iter().copied().filter(|id| !upstream.contains(id)))
            .collect();

        BundleManifest {
            format_version: BUNDLE_FORMAT_VERSION,
            thread: self.thread.clone(),
            posts,
            resources,
            failed_resources,
            masked: self.masked,
            archived_at: Utc::now(),
        }
    }

    fn post_path(&self, id: u64) -> PathBuf {
        self.root.join(POSTS_DIR).join(format!("{id}.json"))
    }
}
