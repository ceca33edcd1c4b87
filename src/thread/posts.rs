//! Turning raw forum posts into archived posts.

use std::collections::BTreeMap;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};
use url::Url;

use super::metadata::summarize;
use super::models::{ArchivedPost, CookedResponse, Poll, PostAuthor, RawPost, Retort};
use crate::client::ForumClient;
use crate::error::{ArchiveError, RequestError};
use crate::resources::{ResourceKind, ResourceRef};

/// `actions_summary` id of the "like" action.
const LIKE_ACTION_ID: u64 = 2;

/// Emoji set used for standard reaction images.
const EMOJI_SET: &str = "google";

static POLL_INFO_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(<(span|div) class="info-number">)[^<]*(</(?:span|div)>)"#)
        .expect("valid regex")
});
static TONED_EMOJI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+):t([1-6])$").expect("valid regex"));

/// Small-action codes and the message shown in their place.
const ACTION_MESSAGES: &[(&str, &str)] = &[
    ("closed.enabled", "closed this topic"),
    ("closed.disabled", "opened this topic"),
    ("autoclosed.enabled", "topic closed automatically"),
    ("autoclosed.disabled", "topic opened automatically"),
    ("archived.enabled", "archived this topic"),
    ("archived.disabled", "unarchived this topic"),
    ("pinned.enabled", "pinned this topic"),
    ("pinned.disabled", "unpinned this topic"),
    ("pinned_globally.enabled", "pinned this topic globally"),
    ("pinned_globally.disabled", "unpinned this topic globally"),
    ("banner.enabled", "made this topic a banner"),
    ("banner.disabled", "removed this banner"),
    ("visible.enabled", "listed this topic"),
    ("visible.disabled", "unlisted this topic"),
    ("split_topic", "split this topic"),
    ("invited_user", "invited a user"),
    ("invited_group", "invited a group"),
    ("user_left", "left this message"),
    ("removed_user", "removed a user"),
    ("removed_group", "removed a group"),
    ("public_topic", "made this topic public"),
    ("private_topic", "converted this topic to a personal message"),
    ("open_topic", "converted this to a topic"),
    ("forwarded", "forwarded the above email"),
];

/// Human-readable message for a small-action code.
#[must_use]
pub fn system_message(action_code: &str) -> Option<&'static str> {
    ACTION_MESSAGES
        .iter()
        .find(|(code, _)| *code == action_code)
        .map(|(_, message)| *message)
}

/// Replace system posts with their message, reveal hidden content and
/// write live poll results into the post HTML.
///
/// Hidden content that can no longer be fetched is left as the forum
/// rendered it.
///
/// # Errors
///
/// Returns [`ArchiveError::Auth`] or [`ArchiveError::Protocol`] if fetching
/// hidden content fails in a way that affects the whole run.
pub async fn reveal(
    client: &ForumClient,
    thread_id: u64,
    post: RawPost,
) -> Result<RawPost, ArchiveError> {
    let mut post = reveal_hidden(client, thread_id, post).await?;
    reify_votes(&mut post);
    Ok(post)
}

async fn reveal_hidden(
    client: &ForumClient,
    thread_id: u64,
    mut post: RawPost,
) -> Result<RawPost, ArchiveError> {
    if let Some(message) = post.action_code.as_deref().and_then(system_message) {
        post.cooked = format!(r#"<p class="system-message">System message: {message}</p>"#);
        return Ok(post);
    }
    if !post.cooked_hidden {
        return Ok(post);
    }

    debug!(post_id = post.id, "Fetching hidden post content");
    match client
        .get_json::<CookedResponse>(&format!("posts/{}/cooked.json", post.id), &[])
        .await
    {
        Ok(hidden) => {
            post.cooked = format!(
                r#"<p class="hidden-content-notice">Hidden content</p>{}"#,
                hidden.cooked
            );
            Ok(post)
        }
        Err(
            e @ (RequestError::Unauthorized(_)
            | RequestError::Decode { .. }
            | RequestError::InvalidRetryAfter(_)),
        ) => Err(e.into_archive_error(thread_id)),
        Err(e) => {
            warn!(post_id = post.id, error = %e, "Could not reveal hidden post");
            Ok(post)
        }
    }
}

/// Write voter and per-option vote counts into each poll of the post.
///
/// The forum renders polls without results; counts come from the post's
/// `polls` field. Options whose results are hidden are left untouched.
pub fn reify_votes(post: &mut RawPost) {
    for poll in &post.polls {
        let Some(range) = poll_region(&post.cooked, &poll.name) else {
            debug!(post_id = post.id, poll = %poll.name, "Poll not found in post content");
            continue;
        };
        let reified = reify_poll(&post.cooked[range.clone()], poll);
        post.cooked.replace_range(range, &reified);
    }
}

fn reify_poll(html: &str, poll: &Poll) -> String {
    let mut html = POLL_INFO_NUMBER
        .replacen(html, 1, |caps: &Captures| {
            format!("{}{}{}", &caps[1], poll.voters, &caps[3])
        })
        .into_owned();

    for option in &poll.options {
        let Some(votes) = option.votes else {
            warn!(
                poll = %poll.name,
                option = %summarize(&option.html),
                "No vote count available, results may be hidden until voting"
            );
            continue;
        };
        let pattern = format!(
            r#"(?s)(<li\b[^>]*\bdata-poll-option-id="{}"[^>]*>.*?)(</li>)"#,
            regex::escape(&option.id)
        );
        let Ok(item) = Regex::new(&pattern) else {
            continue;
        };
        html = item
            .replacen(&html, 1, |caps: &Captures| {
                format!("{} - {votes} votes{}", &caps[1], &caps[2])
            })
            .into_owned();
    }
    html
}

/// Byte range of the poll container named `name`, up to the next poll.
fn poll_region(html: &str, name: &str) -> Option<Range<usize>> {
    const NAME_ATTR: &str = "data-poll-name=\"";
    let marker = format!("{NAME_ATTR}{name}\"");
    let at = html.find(&marker)?;
    let start = html[..at].rfind('<').unwrap_or(at);
    let after = at + marker.len();
    let end = html[after..]
        .find(NAME_ATTR)
        .and_then(|next| html[..after + next].rfind('<'))
        .unwrap_or(html.len());
    Some(start..end)
}

/// The image of a reaction emoji, with the number of users who reacted.
#[must_use]
pub fn reaction_resource(retort: &Retort, base: &Url) -> Option<(ResourceRef, u64)> {
    let name = retort.emoji.trim_matches(':');
    if name.is_empty() {
        return None;
    }
    let name = TONED_EMOJI.replace(name, "$1/$2");
    let url = base
        .join(&format!("images/emoji/{EMOJI_SET}/{name}.png"))
        .ok()?;
    let count = u64::try_from(retort.usernames.len()).unwrap_or(u64::MAX);
    Some((ResourceRef::new(url, ResourceKind::Emoji), count))
}

/// Number of likes recorded on a post.
#[must_use]
pub fn like_count(post: &RawPost) -> u64 {
    post.actions_summary
        .iter()
        .find(|a| a.id == LIKE_ACTION_ID)
        .and_then(|a| a.count)
        .unwrap_or(0)
}

/// Build the archived record for a post whose content has already been
/// masked and rewritten.
#[must_use]
pub fn archived_post(post: &RawPost, author: PostAuthor, content: String) -> ArchivedPost {
    ArchivedPost {
        id: post.id,
        post_number: post.post_number,
        author,
        created_at: post.created_at,
        updated_at: post.updated_at,
        reply_to: post.reply_to_post_number,
        likes: like_count(post),
        hidden: post.cooked_hidden,
        reactions: BTreeMap::new(),
        content,
    }
}
