use url::Url;

const BUNDLE_PREFIX: &str = "resources/";

/// Normalize a resource reference found in post HTML into the canonical URL
/// that identifies it within a run.
///
/// Relative and scheme-relative references are resolved against the forum
/// base URL. Returns `None` for references that are not downloadable
/// resources (`data:`, anchors, non-HTTP schemes).
#[must_use]
pub fn normalize_reference(raw: &str, base: &Url) -> Option<Url> {
    let raw = raw.trim();
    // Bundle paths written by a previous rewrite or by masking.
    if raw.is_empty() || raw.starts_with('#') || raw.starts_with(BUNDLE_PREFIX) {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("data:")
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("blob:")
    {
        return None;
    }

    let mut url = base.join(raw).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.host_str()?;

    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else if url.query_pairs().count() != kept.len() {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    Some(url)
}

fn is_tracking_param(key: &str) -> bool {
    key.to_ascii_lowercase().starts_with("utm_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://forum.example.com/community/").unwrap()
    }

    #[test]
    fn test_absolute_reference_kept() {
        assert_eq!(
            normalize_reference("https://cdn.example.com/a/b.png", &base())
                .unwrap()
                .as_str(),
            "https://cdn.example.com/a/b.png"
        );
    }

    #[test]
    fn test_root_relative_resolves_against_host() {
        assert_eq!(
            normalize_reference("/uploads/default/1X/cat.png", &base())
                .unwrap()
                .as_str(),
            "https://forum.example.com/uploads/default/1X/cat.png"
        );
    }

    #[test]
    fn test_scheme_relative_takes_base_scheme() {
        assert_eq!(
            normalize_reference("//cdn.example.com/x.jpg", &base())
                .unwrap()
                .as_str(),
            "https://cdn.example.com/x.jpg"
        );
    }

    #[test]
    fn test_fragment_and_tracking_dropped() {
        assert_eq!(
            normalize_reference("https://EXAMPLE.com:443/x.jpg?utm_source=a#top", &base())
                .unwrap()
                .as_str(),
            "https://example.com/x.jpg"
        );
        assert_eq!(
            normalize_reference("https://example.com/x.jpg?v=2&utm_medium=b", &base())
                .unwrap()
                .as_str(),
            "https://example.com/x.jpg?v=2"
        );
    }

    #[test]
    fn test_query_kept_verbatim_without_tracking() {
        assert_eq!(
            normalize_reference("https://example.com/img?id=1&size=large", &base())
                .unwrap()
                .as_str(),
            "https://example.com/img?id=1&size=large"
        );
    }

    #[test]
    fn test_non_resources_rejected() {
        assert!(normalize_reference("data:image/png;base64,AAAA", &base()).is_none());
        assert!(normalize_reference("#anchor", &base()).is_none());
        assert!(normalize_reference("mailto:a@example.com", &base()).is_none());
        assert!(normalize_reference("ftp://example.com/file.png", &base()).is_none());
        assert!(normalize_reference("   ", &base()).is_none());
        assert!(normalize_reference("resources/avatar-placeholder.svg", &base()).is_none());
    }
}
