//! Embedded resources: discovery in post HTML, normalization, stable local
//! paths, and rewriting of references to point into the bundle.

pub mod extractor;
pub mod normalize;
pub mod rewrite;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::constants::RESOURCES_DIR;

pub use extractor::discover_resources;
pub use normalize::normalize_reference;
pub use rewrite::rewrite_references;

/// Hex characters of the URL digest used as a file name prefix.
const HASH_PREFIX_LEN: usize = 16;

/// Longest file name part kept after the hash prefix.
const MAX_NAME_LENGTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Video,
    Attachment,
    Avatar,
    Emoji,
}

/// A resource referenced from archived content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Canonical source URL; the identity of the resource within a run.
    pub source_url: Url,
    /// Bundle-relative path the resource is stored at.
    pub local_path: String,
    pub kind: ResourceKind,
}

impl ResourceRef {
    #[must_use]
    pub fn new(source_url: Url, kind: ResourceKind) -> Self {
        let local_path = local_path_for(&source_url);
        Self {
            source_url,
            local_path,
            kind,
        }
    }
}

/// Derive the bundle-relative path of a resource from its canonical URL.
///
/// The path is `resources/<digest>-<file name>`, where the digest covers the
/// full URL, so two URLs never share a path and the same URL always maps to
/// the same one.
#[must_use]
pub fn local_path_for(url: &Url) -> String {
    let digest = hex::encode(Sha256::digest(url.as_str().as_bytes()));
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(sanitize_file_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "resource".to_string());
    format!("{RESOURCES_DIR}/{}-{name}", &digest[..HASH_PREFIX_LEN])
}

/// Reduce a file name to characters that are safe on every filesystem and
/// in URLs, keeping the extension.
#[must_use]
pub fn sanitize_file_name(file_name: &str) -> String {
    let (name, ext) = match file_name.rfind('.') {
        Some(dot) if dot > 0 => file_name.split_at(dot),
        _ => (file_name, ""),
    };

    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '(' | ')' | '[' | ']' | '-' | '_' | '.' => c,
            c if c.is_ascii_alphanumeric() => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let cleaned: String = cleaned.chars().take(MAX_NAME_LENGTH).collect();

    let ext: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
        .take(10)
        .collect::<String>()
        .to_ascii_lowercase();
    let ext = if ext == "." { String::new() } else { ext };

    format!("{cleaned}{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_is_stable_and_prefixed() {
        let url =
            Url::parse("https://forum.example.com/uploads/default/original/1X/cat.png").unwrap();
        let a = local_path_for(&url);
        let b = local_path_for(&url);
        assert_eq!(a, b);
        assert!(a.starts_with("resources/"));
        assert!(a.ends_with("-cat.png"));
        assert_eq!(a.len(), "resources/".len() + HASH_PREFIX_LEN + "-cat.png".len());
    }

    #[test]
    fn test_same_name_different_url_differs() {
        let a = Url::parse("https://a.example.com/img/logo.png").unwrap();
        let b = Url::parse("https://b.example.com/img/logo.png").unwrap();
        assert_ne!(local_path_for(&a), local_path_for(&b));
    }

    #[test]
    fn test_path_without_file_name() {
        let url = Url::parse("https://example.com/").unwrap();
        assert!(local_path_for(&url).ends_with("-resource"));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("My Photo #1.JPG"), "My_Photo_1.jpg");
        assert_eq!(sanitize_file_name("été.png"), "t.png");
        assert_eq!(sanitize_file_name("no_extension"), "no_extension");
        assert_eq!(sanitize_file_name(".hidden"), ".hidden");
        assert_eq!(sanitize_file_name("a%20b.gif"), "a_20b.gif");
    }

    #[test]
    fn test_percent_escapes_are_flattened() {
        let url = Url::parse("https://example.com/files/my report.pdf").unwrap();
        assert!(local_path_for(&url).ends_with("-my_20report.pdf"));
    }
}
