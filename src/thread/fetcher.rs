use std::collections::HashMap;

use async_stream::try_stream;
use futures_util::Stream;
use tracing::{debug, warn};

use super::models::{PostChunk, PostsResponse, RawPost, ThreadMeta};
use crate::client::ForumClient;
use crate::error::{ArchiveError, RequestError};
use crate::events::ProgressTracker;

/// Lazily fetch the posts of a thread in chunks of `chunk_size` ids,
/// following [`ThreadMeta::post_ids`] order.
///
/// The stream is forward-only: once it yields an error it ends, and a new
/// stream has to start from the first chunk again. `chunks-total` is
/// reported on the first successful response (or immediately for a thread
/// without posts), before any `chunk-downloaded`.
pub fn post_chunks<'a>(
    client: &'a ForumClient,
    meta: &'a ThreadMeta,
    chunk_size: usize,
    progress: &'a ProgressTracker,
) -> impl Stream<Item = Result<PostChunk, ArchiveError>> + 'a {
    let chunk_size = chunk_size.max(1);
    let total = meta.post_ids.len().div_ceil(chunk_size);
    let path = format!("t/{}/posts.json", meta.id);

    try_stream! {
        if total == 0 {
            progress.chunks_total(0);
        }

        let mut last_successful_chunk = None;
        for (index, ids) in meta.post_ids.chunks(chunk_size).enumerate() {
            debug!(thread_id = meta.id, chunk_index = index, posts = ids.len(), "Fetching post chunk");
            let query: Vec<(&str, String)> = ids
                .iter()
                .map(|id| ("post_ids[]", id.to_string()))
                .collect();

            let response: PostsResponse = client
                .get_json(&path, &query)
                .await
                .map_err(|e| chunk_error(e, meta.id, index, last_successful_chunk))?;

            if index == 0 {
                progress.chunks_total(total);
            }
            let posts = in_stream_order(ids, response.post_stream.posts);
            progress.chunk_downloaded();
            last_successful_chunk = Some(index);

            yield PostChunk {
                index,
                post_ids: ids.to_vec(),
                posts,
            };
        }
    }
}

/// Order the posts of a chunk by the requested ids, dropping anything the
/// forum returned that was not asked for.
fn in_stream_order(ids: &[u64], posts: Vec<RawPost>) -> Vec<RawPost> {
    let mut by_id: HashMap<u64, RawPost> = posts.into_iter().map(|p| (p.id, p)).collect();
    let ordered: Vec<RawPost> = ids.iter().filter_map(|id| by_id.remove(id)).collect();
    if ordered.len() < ids.len() {
        debug!(
            requested = ids.len(),
            returned = ordered.len(),
            "Forum omitted some posts (deleted or hidden from this user)"
        );
    }
    if !by_id.is_empty() {
        warn!(extra = by_id.len(), "Forum returned posts that were not requested");
    }
    ordered
}

fn chunk_error(
    error: RequestError,
    thread_id: u64,
    chunk_index: usize,
    last_successful_chunk: Option<usize>,
) -> ArchiveError {
    match error {
        e @ (RequestError::Unauthorized(_)
        | RequestError::Decode { .. }
        | RequestError::InvalidRetryAfter(_)) => e.into_archive_error(thread_id),
        other => {
            warn!(thread_id, chunk_index, error = %other, "Post chunk fetch failed");
            ArchiveError::Fetch {
                chunk_index,
                last_successful_chunk,
                message: other.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn post(id: u64) -> RawPost {
        RawPost {
            id,
            post_number: id,
            user_id: Some(1),
            username: "alice".to_string(),
            name: None,
            avatar_template: None,
            created_at: Utc::now(),
            updated_at: None,
            cooked: String::new(),
            cooked_hidden: false,
            reply_to_post_number: None,
            actions_summary: Vec::new(),
            action_code: None,
            polls: Vec::new(),
            retorts: Vec::new(),
        }
    }

    #[test]
    fn test_posts_follow_requested_order() {
        let ordered = in_stream_order(&[3, 1, 2], vec![post(1), post(2), post(3), post(9)]);
        let ids: Vec<u64> = ordered.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_missing_posts_are_skipped() {
        let ordered = in_stream_order(&[1, 2, 3], vec![post(3), post(1)]);
        let ids: Vec<u64> = ordered.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_chunk_error_classification() {
        assert!(matches!(
            chunk_error(RequestError::Status(reqwest::StatusCode::BAD_GATEWAY), 1, 2, Some(1)),
            ArchiveError::Fetch {
                chunk_index: 2,
                last_successful_chunk: Some(1),
                ..
            }
        ));
        assert!(matches!(
            chunk_error(RequestError::NotFound, 1, 0, None),
            ArchiveError::Fetch {
                chunk_index: 0,
                last_successful_chunk: None,
                ..
            }
        ));
        assert!(matches!(
            chunk_error(
                RequestError::Unauthorized(reqwest::StatusCode::UNAUTHORIZED),
                1,
                0,
                None
            ),
            ArchiveError::Auth(_)
        ));
    }
}
