//! Thread metadata, pagination and post preparation.

pub mod fetcher;
pub mod metadata;
pub mod models;
pub mod posts;

use once_cell::sync::Lazy;
use regex::Regex;

pub use fetcher::post_chunks;
pub use metadata::resolve_metadata;
pub use models::{ArchivedPost, Category, PostAuthor, PostChunk, RawPost, ThreadMeta};

static THREAD_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/t/(?:[^/?#]+/)?(\d+)(?:[/?#]|$)").expect("valid regex"));

/// Parse a thread reference given either as a numeric id or as a thread URL
/// such as `https://forum.example.com/t/some-slug/42/7`.
///
/// Returns `None` for anything that does not name a positive thread id.
#[must_use]
pub fn parse_thread_ref(input: &str) -> Option<u64> {
    let input = input.trim();
    let id = if let Ok(id) = input.parse::<u64>() {
        id
    } else {
        let path = url::Url::parse(input)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| input.to_string());
        THREAD_URL
            .captures(&path)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())?
    };
    (id > 0).then_some(id)
}
