//! Deterministic pseudonymization of author identities.
//!
//! Every distinct identity gets the next `User N` pseudonym. The whole
//! thread is registered before any content is masked: first every post
//! author in post order, then every identity the posts mention or quote.
//! The same post sequence therefore always yields the same assignment, and
//! a name written before its owner's first post is still masked.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use crate::constants::PLACEHOLDER_AVATAR;
use crate::thread::{PostAuthor, RawPost};

/// Shortest ASCII name replaced in free text.
const MIN_ASCII_NAME_LENGTH: usize = 5;
/// Shortest non-ASCII name replaced in free text, in characters.
const MIN_UNICODE_NAME_LENGTH: usize = 2;

static IDENTITY_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"data-username="([^"]+)"|<a class="mention"[^>]*>@([^<]+)</a>"#)
        .expect("valid regex")
});
static MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<a class="mention"[^>]*>@([^<]+)</a>"#).expect("valid regex")
});
static QUOTE_USERNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-username="([^"]+)""#).expect("valid regex"));
static AVATAR_IMG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<img\b[^>]*\bclass="[^"]*\bavatar\b[^"]*"[^>]*>"#).expect("valid regex")
});
static IMG_SOURCE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\s(?:src|srcset)="[^"]*""#).expect("valid regex"));
static QUOTE_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(<img\b[^>]*\bclass="[^"]*\bavatar\b[^"]*"[^>]*>\s*)([^<:]+?)(:\s*</div>)"#)
        .expect("valid regex")
});
static PROFILE_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\s+(?:href="(?:https?://[^"/]*)?/u/[^"]*"|data-user-card="[^"]*")"#)
        .expect("valid regex")
});
static AT_USERNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([\w.\-]+)").expect("valid regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Assigns and applies pseudonyms for one archive run.
#[derive(Debug, Default)]
pub struct IdentityMasker {
    /// Number of identities seen; identity `i` is `User {i + 1}`.
    count: usize,
    by_user_id: HashMap<i64, usize>,
    by_username: HashMap<String, usize>,
    /// Real names replaced in free text, with their identity.
    names: HashMap<String, usize>,
    text_pattern: Option<Regex>,
}

impl IdentityMasker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the author of every post, then every identity the posts
    /// reference, before anything is masked.
    pub fn register_thread<'a>(
        &mut self,
        posts: impl IntoIterator<Item = &'a RawPost> + Clone,
    ) {
        for post in posts.clone() {
            self.identify(post.user_id, &post.username, post.name.as_deref());
        }
        for post in posts {
            self.register_references(&post.cooked);
        }
    }

    /// Register a post's author and return the masked author record.
    pub fn mask_author(&mut self, post: &RawPost) -> PostAuthor {
        let index = self.identify(post.user_id, &post.username, post.name.as_deref());
        PostAuthor {
            user_id: None,
            username: pseudonym(index),
            display_name: None,
            avatar: Some(PLACEHOLDER_AVATAR.to_string()),
        }
    }

    /// The pseudonym assigned to `username`, if it has been seen.
    #[must_use]
    pub fn pseudonym_of(&self, username: &str) -> Option<String> {
        self.by_username
            .get(&username.to_lowercase())
            .map(|&index| pseudonym(index))
    }

    /// Replace identities in post HTML: mentions, quote headers, quote
    /// avatars and textual occurrences of known names.
    pub fn mask_html(&mut self, html: &str) -> String {
        self.register_references(html);

        let html = MENTION.replace_all(html, |caps: &Captures| {
            let index = self.lookup_or_register(&caps[1]);
            format!(r#"<a class="mention">@{}</a>"#, pseudonym(index))
        });
        let html = QUOTE_USERNAME.replace_all(&html, |caps: &Captures| {
            let index = self.lookup_or_register(&caps[1]);
            format!(r#"data-username="{}""#, pseudonym(index))
        });
        let html = QUOTE_TITLE.replace_all(&html, |caps: &Captures| {
            let index = self.lookup_or_register(caps[2].trim());
            format!("{}{}{}", &caps[1], pseudonym(index), &caps[3])
        });
        let html = AVATAR_IMG.replace_all(&html, |caps: &Captures| {
            let without_source = IMG_SOURCE_ATTR.replace_all(&caps[0], "");
            without_source.replacen("<img", &format!(r#"<img src="{PLACEHOLDER_AVATAR}""#), 1)
        });
        let html = PROFILE_ATTR.replace_all(&html, "");

        self.replace_names_in_text(&html)
    }

    /// Replace known identities in plain text, such as a thread description.
    pub fn mask_text(&mut self, text: &str) -> String {
        let text = AT_USERNAME
            .replace_all(text, |caps: &Captures| {
                match self.by_username.get(&caps[1].to_lowercase()) {
                    Some(&index) => format!("@{}", pseudonym(index)),
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
        self.replace_names_in_text(&text)
    }

    /// Register identities referenced in content, in document order.
    fn register_references(&mut self, html: &str) {
        for caps in IDENTITY_REFERENCE.captures_iter(html) {
            if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
                self.lookup_or_register(name.as_str());
            }
        }
    }

    fn identify(
        &mut self,
        user_id: Option<i64>,
        username: &str,
        display_name: Option<&str>,
    ) -> usize {
        let key = username.to_lowercase();
        let index = user_id
            .and_then(|id| self.by_user_id.get(&id).copied())
            .or_else(|| self.by_username.get(&key).copied())
            .unwrap_or_else(|| self.next_identity());

        if let Some(id) = user_id {
            self.by_user_id.insert(id, index);
        }
        self.by_username.entry(key).or_insert(index);
        self.add_name(username, index);
        if let Some(display_name) = display_name {
            self.add_name(display_name, index);
        }
        index
    }

    /// Resolve a name seen in content: a known username, a known display
    /// name, or a new identity.
    fn lookup_or_register(&mut self, name: &str) -> usize {
        let name = name.trim();
        if let Some(&index) = self.by_username.get(&name.to_lowercase()) {
            return index;
        }
        if let Some(&index) = self.names.get(name) {
            return index;
        }
        self.identify(None, name, None)
    }

    fn next_identity(&mut self) -> usize {
        let index = self.count;
        self.count += 1;
        debug!(pseudonym = %pseudonym(index), "Assigned pseudonym");
        index
    }

    fn add_name(&mut self, name: &str, index: usize) {
        let name = name.trim();
        if is_replaceable(name) && !self.names.contains_key(name) {
            self.names.insert(name.to_string(), index);
            self.text_pattern = None;
        }
    }

    fn replace_names_in_text(&mut self, html: &str) -> String {
        if self.names.is_empty() {
            return html.to_string();
        }
        if self.text_pattern.is_none() {
            self.text_pattern = Some(self.build_text_pattern());
        }
        let Some(pattern) = self.text_pattern.as_ref() else {
            return html.to_string();
        };

        let mut out = String::with_capacity(html.len());
        let mut last = 0;
        for tag in TAG.find_iter(html) {
            out.push_str(&self.replace_in(pattern, &html[last..tag.start()]));
            out.push_str(tag.as_str());
            last = tag.end();
        }
        out.push_str(&self.replace_in(pattern, &html[last..]));
        out
    }

    fn replace_in(&self, pattern: &Regex, text: &str) -> String {
        pattern
            .replace_all(text, |caps: &Captures| {
                self.names
                    .get(&caps[0])
                    .map_or_else(|| caps[0].to_string(), |&index| pseudonym(index))
            })
            .into_owned()
    }

    /// One alternation over every known name, longest first so that a name
    /// containing another wins.
    fn build_text_pattern(&self) -> Regex {
        let ordered: BTreeSet<(std::cmp::Reverse<usize>, &str)> = self
            .names
            .keys()
            .map(|name| (std::cmp::Reverse(name.len()), name.as_str()))
            .collect();
        let alternation = ordered
            .into_iter()
            .map(|(_, name)| {
                let escaped = regex::escape(name);
                if name.is_ascii() {
                    format!(r"\b{escaped}\b")
                } else {
                    escaped
                }
            })
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&alternation)
            .unwrap_or_else(|_| Regex::new(r"[^\s\S]").expect("valid regex"))
    }
}

fn pseudonym(index: usize) -> String {
    format!("User {}", index + 1)
}

fn is_replaceable(name: &str) -> bool {
    if name.is_ascii() {
        name.len() >= MIN_ASCII_NAME_LENGTH
    } else {
        name.chars().count() >= MIN_UNICODE_NAME_LENGTH
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn post(user_id: i64, username: &str, name: Option<&str>) -> RawPost {
        RawPost {
            id: 1,
            post_number: 1,
            user_id: Some(user_id),
            username: username.to_string(),
            name: name.map(ToString::to_string),
            avatar_template: Some("/user_avatar/forum/x/{size}/1_2.png".to_string()),
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
    fn test_pseudonyms_follow_first_appearance() {
        let mut masker = IdentityMasker::new();
        assert_eq!(masker.mask_author(&post(10, "carol", None)).username, "User 1");
        assert_eq!(masker.mask_author(&post(20, "dave", None)).username, "User 2");
        assert_eq!(masker.mask_author(&post(10, "carol", None)).username, "User 1");
    }

    #[test]
    fn test_masking_is_deterministic() {
        let posts = [
            post(3, "zed", Some("Zed Zulu")),
            post(1, "amy", None),
            post(3, "zed", Some("Zed Zulu")),
            post(2, "bob", None),
        ];
        let run = || {
            let mut masker = IdentityMasker::new();
            posts
                .iter()
                .map(|p| masker.mask_author(p).username)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
        assert_eq!(run(), vec!["User 1", "User 2", "User 1", "User 3"]);
    }

    #[test]
    fn test_masked_author_has_placeholder_avatar() {
        let mut masker = IdentityMasker::new();
        let author = masker.mask_author(&post(1, "amy", Some("Amy Adams")));
        assert_eq!(author.user_id, None);
        assert_eq!(author.display_name, None);
        assert_eq!(author.avatar.as_deref(), Some(PLACEHOLDER_AVATAR));
    }

    #[test]
    fn test_mentions_are_masked() {
        let mut masker = IdentityMasker::new();
        masker.mask_author(&post(1, "amy", None));
        let html = r#"<p>Hi <a class="mention" href="/u/bob">@bob</a> and <a class="mention" href="/u/amy">@amy</a></p>"#;
        assert_eq!(
            masker.mask_html(html),
            r#"<p>Hi <a class="mention">@User 2</a> and <a class="mention">@User 1</a></p>"#
        );
        assert_eq!(masker.pseudonym_of("bob").as_deref(), Some("User 2"));
    }

    #[test]
    fn test_quotes_are_masked() {
        let mut masker = IdentityMasker::new();
        masker.mask_author(&post(1, "amy", None));
        let html = concat!(
            r#"<aside class="quote no-group" data-username="bob" data-post="2" data-topic="42">"#,
            r#"<div class="title"><img alt="" width="24" height="24" "#,
            r#"src="https://forum.example.com/user_avatar/forum/bob/48/5_2.png" class="avatar"> bob:</div>"#,
            r#"<blockquote><p>quoted</p></blockquote></aside>"#
        );
        let masked = masker.mask_html(html);
        assert!(masked.contains(r#"data-username="User 2""#), "{masked}");
        assert!(masked.contains(r#"<img src="resources/avatar-placeholder.svg""#), "{masked}");
        assert!(masked.contains("> User 2:</div>"), "{masked}");
        assert!(!masked.contains("bob"), "{masked}");
    }

    #[test]
    fn test_long_names_replaced_in_text_only() {
        let mut masker = IdentityMasker::new();
        masker.mask_author(&post(1, "alexander", Some("Alexander Great")));
        masker.mask_author(&post(2, "bob", None));
        let html = r#"<p>Thanks Alexander Great and alexander, bob says hi</p>"#;
        assert_eq!(
            masker.mask_html(html),
            r#"<p>Thanks User 1 and User 1, bob says hi</p>"#
        );
    }

    #[test]
    fn test_profile_links_are_stripped() {
        let mut masker = IdentityMasker::new();
        masker.mask_author(&post(1, "alexander", Some("Alexander Great")));
        let html = concat!(
            r#"<p><a href="/u/alexander">profile</a> "#,
            r#"<a href="https://forum.example.com/u/alexander/summary" data-user-card="alexander">card</a> "#,
            r#"<a href="/t/other/7">thread</a></p>"#
        );
        let masked = masker.mask_html(html);
        assert_eq!(
            masked,
            r#"<p><a>profile</a> <a>card</a> <a href="/t/other/7">thread</a></p>"#
        );
    }

    #[test]
    fn test_names_registered_before_their_first_post() {
        let mut first = post(1, "carol", None);
        first.cooked = "<p>Waiting for Alexander Great</p>".to_string();
        let mut second = post(2, "alexander", Some("Alexander Great"));
        second.id = 2;
        second.post_number = 2;

        let mut masker = IdentityMasker::new();
        masker.register_thread([&first, &second]);
        assert_eq!(masker.mask_author(&first).username, "User 1");
        assert_eq!(masker.mask_html(&first.cooked), "<p>Waiting for User 2</p>");
        assert_eq!(masker.mask_author(&second).username, "User 2");
    }

    #[test]
    fn test_mask_text_replaces_usernames_and_names() {
        let mut masker = IdentityMasker::new();
        masker.mask_author(&post(1, "bob", None));
        masker.mask_author(&post(2, "alexander", Some("Alexander Great")));
        assert_eq!(
            masker.mask_text("@bob asked Alexander Great, cc @stranger"),
            "@User 1 asked User 2, cc @stranger"
        );
    }

    #[test]
    fn test_unicode_names_use_lower_threshold() {
        let mut masker = IdentityMasker::new();
        masker.mask_author(&post(1, "u1", Some("小明")));
        assert_eq!(masker.mask_html("<p>小明说</p>"), "<p>User 1说</p>");
    }
}
