use std::collections::BTreeSet;

use scraper::Html;
use tracing::{debug, info, instrument, warn};

use super::models::{Category, CategoryResponse, TagValue, ThreadMeta, TopicResponse};
use crate::client::ForumClient;
use crate::error::{ArchiveError, RequestError};

/// Longest thread description kept in the metadata, in characters.
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Parent links followed before the category chain is considered cyclic.
const MAX_CATEGORY_DEPTH: usize = 8;

/// Resolve thread-level metadata.
///
/// # Errors
///
/// - [`ArchiveError::Auth`] if the forum rejects the token
/// - [`ArchiveError::NotFound`] if the thread does not exist (or the id is 0)
/// - [`ArchiveError::Protocol`] if a response cannot be interpreted
#[instrument(skip(client))]
pub async fn resolve_metadata(
    client: &ForumClient,
    thread_id: u64,
) -> Result<ThreadMeta, ArchiveError> {
    if thread_id == 0 {
        return Err(ArchiveError::NotFound(thread_id));
    }

    let topic: TopicResponse = client
        .get_json(&format!("t/{thread_id}.json"), &[])
        .await
        .map_err(|e| e.into_archive_error(thread_id))?;

    let Some(post_ids) = topic.post_stream.stream else {
        return Err(ArchiveError::protocol(
            format!("thread {thread_id} response has no post stream"),
            None,
        ));
    };

    let description = topic
        .post_stream
        .posts
        .first()
        .map(|post| summarize(&post.cooked))
        .unwrap_or_default();

    let categories = match topic.category_id {
        Some(id) => category_chain(client, thread_id, id).await?,
        None => Vec::new(),
    };

    let tags: BTreeSet<String> = topic.tags.into_iter().map(TagValue::into_name).collect();

    info!(
        title = %topic.title,
        posts = post_ids.len(),
        categories = categories.len(),
        "Resolved thread metadata"
    );

    Ok(ThreadMeta {
        id: thread_id,
        title: topic.title,
        description,
        categories,
        tags,
        post_ids,
    })
}

/// Walk from the thread's category up through its parents, root first.
async fn category_chain(
    client: &ForumClient,
    thread_id: u64,
    leaf_id: u64,
) -> Result<Vec<Category>, ArchiveError> {
    let mut chain = Vec::new();
    let mut next = Some(leaf_id);

    while let Some(id) = next {
        if chain.len() >= MAX_CATEGORY_DEPTH {
            warn!(category_id = id, "Category chain too deep, truncating");
            break;
        }
        let response: CategoryResponse = client
            .get_json(&format!("c/{id}/show.json"), &[])
            .await
            .map_err(|e| match e {
                RequestError::NotFound => {
                    ArchiveError::protocol(format!("category {id} does not exist"), None)
                }
                other => other.into_archive_error(thread_id),
            })?;
        debug!(category_id = id, name = %response.category.name, "Resolved category");
        next = response.category.parent_category_id;
        chain.push(Category {
            name: response.category.name,
            color: response.category.color,
        });
    }

    chain.reverse();
    Ok(chain)
}

/// Plain-text summary of a post's HTML, whitespace collapsed.
#[must_use]
pub fn summarize(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");

    if text.chars().count() <= MAX_DESCRIPTION_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_DESCRIPTION_CHARS - 1).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}
