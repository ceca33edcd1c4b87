//! Discourse JSON payloads and the archive-side thread/post records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response of `/t/{id}.json`.
#[derive(Debug, Deserialize)]
pub struct TopicResponse {
    pub title: String,
    #[serde(default)]
    pub fancy_title: Option<String>,
    #[serde(default)]
    pub category_id: Option<u64>,
    #[serde(default)]
    pub tags: Vec<TagValue>,
    pub post_stream: PostStream,
}

/// Tags are plain strings on older forums and objects on newer ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Name(String),
    Object { name: String },
}

impl TagValue {
    #[must_use]
    pub fn into_name(self) -> String {
        match self {
            Self::Name(name) | Self::Object { name } => name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PostStream {
    #[serde(default)]
    pub posts: Vec<RawPost>,
    #[serde(default)]
    pub stream: Option<Vec<u64>>,
}

/// Response of `/t/{id}/posts.json`.
#[derive(Debug, Deserialize)]
pub struct PostsResponse {
    pub post_stream: PostStream,
}

/// Response of `/c/{id}/show.json`.
#[derive(Debug, Deserialize)]
pub struct CategoryResponse {
    pub category: CategoryInfo,
}

#[derive(Debug, Deserialize)]
pub struct CategoryInfo {
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub parent_category_id: Option<u64>,
}

/// Response of `/posts/{id}/cooked.json`.
#[derive(Debug, Deserialize)]
pub struct CookedResponse {
    pub cooked: String,
}

/// A post as returned by the forum.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPost {
    pub id: u64,
    pub post_number: u64,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_template: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooked: String,
    #[serde(default)]
    pub cooked_hidden: bool,
    #[serde(default)]
    pub reply_to_post_number: Option<u64>,
    #[serde(default)]
    pub actions_summary: Vec<ActionSummary>,
    #[serde(default)]
    pub action_code: Option<String>,
    #[serde(default)]
    pub polls: Vec<Poll>,
    /// Emoji reactions left by the retort plugin.
    #[serde(default)]
    pub retorts: Vec<Retort>,
}

/// Live results of a poll rendered in a post.
#[derive(Debug, Clone, Deserialize)]
pub struct Poll {
    pub name: String,
    #[serde(default)]
    pub voters: u64,
    #[serde(default)]
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollOption {
    pub id: String,
    #[serde(default)]
    pub html: String,
    /// Absent while results are hidden from the requesting user.
    #[serde(default)]
    pub votes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retort {
    pub emoji: String,
    #[serde(default)]
    pub usernames: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionSummary {
    pub id: u64,
    #[serde(default)]
    pub count: Option<u64>,
}

/// A category in a thread's breadcrumb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub color: String,
}

/// Thread-level metadata, resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub id: u64,
    pub title: String,
    pub description: String,
    /// Root category first.
    pub categories: Vec<Category>,
    pub tags: BTreeSet<String>,
    /// Canonical post order.
    pub post_ids: Vec<u64>,
}

/// Author of an archived post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAuthor {
    pub user_id: Option<i64>,
    pub username: String,
    pub display_name: Option<String>,
    /// Bundle-relative path of the avatar image.
    pub avatar: Option<String>,
}

/// A post as written into the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedPost {
    pub id: u64,
    pub post_number: u64,
    pub author: PostAuthor,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub reply_to: Option<u64>,
    pub likes: u64,
    pub hidden: bool,
    /// Reaction counts keyed by the bundle-relative path of the emoji image.
    #[serde(default)]
    pub reactions: BTreeMap<String, u64>,
    /// Post HTML with resource references pointing into the bundle.
    pub content: String,
}

/// A batch of posts covering a contiguous slice of [`ThreadMeta::post_ids`].
#[derive(Debug)]
pub struct PostChunk {
    pub index: usize,
    pub post_ids: Vec<u64>,
    /// Posts in canonical order; ids the forum no longer returns are absent.
    pub posts: Vec<RawPost>,
}
