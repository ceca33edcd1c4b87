//! Error taxonomy of the archival engine.
//!
//! [`ArchiveError`] is the single terminal result surfaced to callers.
//! [`RequestError`] describes what went wrong with one HTTP exchange; the
//! component that issued the request decides which [`ArchiveError`] it becomes.

use std::io;
use std::path::PathBuf;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Longest raw payload excerpt kept in a protocol error.
const MAX_PAYLOAD_EXCERPT: usize = 2048;

/// Fatal outcome of an archive operation.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The session token is missing, invalid or expired.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The thread identifier does not resolve.
    #[error("thread {0} not found")]
    NotFound(u64),
    /// The server answered with something the engine cannot interpret.
    #[error("unexpected server response: {message}")]
    Protocol {
        message: String,
        payload: Option<String>,
    },
    /// A non-throttling HTTP failure while paginating posts.
    #[error("failed to fetch post chunk {chunk_index}: {message}")]
    Fetch {
        chunk_index: usize,
        last_successful_chunk: Option<usize>,
        message: String,
    },
    /// Filesystem failure while writing the bundle.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The run was cancelled by the caller.
    #[error("archive run cancelled")]
    Cancelled,
    /// The engine could not be constructed from the given settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Coarse error category for rendering a user-facing explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    NotFound,
    Protocol,
    Fetch,
    Write,
    Cancelled,
    Config,
}

impl ArchiveError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::Auth,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Write { .. } => ErrorKind::Write,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>, payload: Option<String>) -> Self {
        let message = message.into();
        tracing::error!(
            %message,
            payload = payload.as_deref().unwrap_or(""),
            "Malformed server response"
        );
        Self::Protocol { message, payload }
    }
}

/// Failure of a single HTTP exchange, before it is classified by the caller.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unauthorized ({0})")]
    Unauthorized(StatusCode),
    #[error("not found")]
    NotFound,
    #[error("server returned {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        payload: String,
    },
    #[error("unusable Retry-After value: {0:?}")]
    InvalidRetryAfter(String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl RequestError {
    /// Whether repeating the same request could plausibly succeed.
    ///
    /// Throttling is not represented here: it never surfaces as an error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Self::Status(status) => status.is_server_error() || *status == StatusCode::REQUEST_TIMEOUT,
            Self::Unauthorized(_)
            | Self::NotFound
            | Self::Decode { .. }
            | Self::InvalidRetryAfter(_)
            | Self::InvalidUrl(_) => false,
        }
    }

    /// Convert into the terminal error used outside of pagination.
    pub(crate) fn into_archive_error(self, thread_id: u64) -> ArchiveError {
        match self {
            Self::Unauthorized(status) => ArchiveError::Auth(format!(
                "the forum rejected the session token ({status}); please sign in again"
            )),
            Self::NotFound => ArchiveError::NotFound(thread_id),
            Self::Decode { source, payload } => {
                ArchiveError::protocol(source.to_string(), Some(excerpt(&payload)))
            }
            Self::InvalidRetryAfter(value) => {
                ArchiveError::protocol(format!("unusable Retry-After value {value:?}"), None)
            }
            other => ArchiveError::protocol(other.to_string(), None),
        }
    }
}

/// Truncate a raw payload for diagnostics, respecting char boundaries.
pub(crate) fn excerpt(payload: &str) -> String {
    if payload.len() <= MAX_PAYLOAD_EXCERPT {
        return payload.to_string();
    }
    let mut end = MAX_PAYLOAD_EXCERPT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &payload[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ArchiveError::NotFound(1).kind(), ErrorKind::NotFound);
        assert_eq!(ArchiveError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ArchiveError::write("/tmp/x", io::Error::other("disk full")).kind(),
            ErrorKind::Write
        );
    }

    #[test]
    fn test_write_error_names_path() {
        let err = ArchiveError::write("/bundle/posts/1.json", io::Error::other("disk full"));
        assert_eq!(err.to_string(), "failed to write /bundle/posts/1.json: disk full");
    }

    #[test]
    fn test_status_retryability() {
        assert!(RequestError::Status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(RequestError::Status(StatusCode::REQUEST_TIMEOUT).is_retryable());
        assert!(!RequestError::Status(StatusCode::GONE).is_retryable());
        assert!(!RequestError::NotFound.is_retryable());
        assert!(!RequestError::Unauthorized(StatusCode::FORBIDDEN).is_retryable());
    }

    #[test]
    fn test_into_archive_error() {
        assert!(matches!(
            RequestError::NotFound.into_archive_error(42),
            ArchiveError::NotFound(42)
        ));
        assert!(matches!(
            RequestError::Unauthorized(StatusCode::UNAUTHORIZED).into_archive_error(42),
            ArchiveError::Auth(_)
        ));
        let decode = serde_json::from_str::<u32>("nope").unwrap_err();
        match (RequestError::Decode {
            source: decode,
            payload: "nope".to_string(),
        })
        .into_archive_error(42)
        {
            ArchiveError::Protocol { payload, .. } => assert_eq!(payload.as_deref(), Some("nope")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_PAYLOAD_EXCERPT);
        let cut = excerpt(&long);
        assert!(cut.ends_with('…'));
        assert!(cut.len() <= MAX_PAYLOAD_EXCERPT + '…'.len_utf8());
    }
}
