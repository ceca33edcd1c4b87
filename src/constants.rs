//! Shared constants used across the archiver.

/// User agent sent with every forum request unless overridden by `USER_AGENT`.
pub const ARCHIVER_USER_AGENT: &str = concat!(
    "discourse-thread-archiver/",
    env!("CARGO_PKG_VERSION"),
    " (+offline thread archive)"
);

/// Header carrying a Discourse user API key.
pub const USER_API_KEY_HEADER: &str = "user-api-key";

/// Name of the sentinel metadata file at the bundle root.
pub const METADATA_FILE: &str = "metadata.json";

/// Directory (relative to the bundle root) holding one JSON file per post.
pub const POSTS_DIR: &str = "posts";

/// Directory (relative to the bundle root) holding downloaded resources.
pub const RESOURCES_DIR: &str = "resources";

/// Relative path of the image substituted for resources that could not be downloaded.
pub const PLACEHOLDER_RESOURCE: &str = "resources/placeholder.svg";

/// Relative path of the neutral avatar used when identities are masked.
pub const PLACEHOLDER_AVATAR: &str = "resources/avatar-placeholder.svg";

/// Version of the on-disk bundle layout.
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

pub(crate) const PLACEHOLDER_RESOURCE_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="160" height="120" viewBox="0 0 160 120"><rect width="160" height="120" fill="#e5e5e5"/><path d="M40 85l25-30 20 22 12-14 23 22z" fill="#b3b3b3"/><circle cx="108" cy="42" r="10" fill="#b3b3b3"/><text x="80" y="110" font-family="sans-serif" font-size="10" text-anchor="middle" fill="#808080">unavailable</text></svg>"##;

pub(crate) const PLACEHOLDER_AVATAR_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="48" height="48" viewBox="0 0 48 48"><circle cx="24" cy="24" r="24" fill="#9e9e9e"/><circle cx="24" cy="19" r="8" fill="#f5f5f5"/><path d="M9 40c3-8 9-12 15-12s12 4 15 12" fill="#f5f5f5"/></svg>"##;
