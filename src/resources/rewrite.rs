use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::Url;

use super::normalize::normalize_reference;

static URL_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(\s(src|href|poster|srcset)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid regex")
});

/// Rewrite every resource reference in `html` for which `resolve` returns a
/// bundle path. References it does not know are left as they are.
///
/// `resolve` receives the canonical URL of the reference, as produced by
/// [`normalize_reference`].
pub fn rewrite_references<F>(html: &str, base: &Url, resolve: F) -> String
where
    F: Fn(&Url) -> Option<String>,
{
    let rewrite_one = |value: &str| -> Option<String> {
        let unescaped = value.replace("&amp;", "&");
        let url = normalize_reference(&unescaped, base)?;
        resolve(&url)
    };

    let rewritten = URL_ATTRIBUTE.replace_all(html, |caps: &Captures| {
        let prefix = &caps[1];
        let name = caps[2].to_ascii_lowercase();
        let (value, quote) = match (caps.get(3), caps.get(4)) {
            (Some(v), _) => (v.as_str(), '"'),
            (None, Some(v)) => (v.as_str(), '\''),
            (None, None) => return caps[0].to_string(),
        };

        let new_value: Cow<str> = if name == "srcset" {
            Cow::Owned(rewrite_srcset(value, &rewrite_one))
        } else {
            rewrite_one(value).map_or(Cow::Borrowed(value), Cow::Owned)
        };
        format!("{prefix}{quote}{new_value}{quote}")
    });

    rewritten.into_owned()
}

/// Rewrite each candidate of a `srcset`, keeping its descriptor.
fn rewrite_srcset(srcset: &str, rewrite: impl Fn(&str) -> Option<String>) -> String {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| {
            let (url, descriptor) = candidate
                .split_once(char::is_whitespace)
                .map_or((candidate, ""), |(u, d)| (u, d.trim()));
            let url = rewrite(url).unwrap_or_else(|| url.to_string());
            if descriptor.is_empty() {
                url
            } else {
                format!("{url} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
