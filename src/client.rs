//! Authenticated, rate-limit-aware forum client.
//!
//! All outbound traffic of the engine goes through [`ForumClient`], which in
//! turn routes every exchange through the run-wide [`RateLimiter`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::archiver::rate_limiter::{Attempt, RateLimiter};
use crate::config::Config;
use crate::constants::{ARCHIVER_USER_AGENT, USER_API_KEY_HEADER};
use crate::error::{ArchiveError, RequestError};

/// A downloaded binary body.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Forum HTTP client shared by every component of a run.
#[derive(Debug, Clone)]
pub struct ForumClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<HeaderValue>,
    limiter: RateLimiter,
    rate_limit_fallback: Duration,
}

impl ForumClient {
    /// Build a client for the configured forum.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not a valid header value or the
    /// underlying HTTP client cannot be built.
    pub fn new(config: &Config, limiter: RateLimiter) -> Result<Self, ArchiveError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(|token| {
                let mut value = HeaderValue::from_str(token.trim()).map_err(|_| {
                    ArchiveError::InvalidConfig("API key is not a valid header value".into())
                })?;
                value.set_sensitive(true);
                Ok::<_, ArchiveError>(value)
            })
            .transpose()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_deref().unwrap_or(ARCHIVER_USER_AGENT))
            .build()
            .map_err(|e| {
                ArchiveError::InvalidConfig(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            base_url: config.forum_url.clone(),
            api_key,
            limiter,
            rate_limit_fallback: config.rate_limit_fallback,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a forum-relative path (e.g. `t/42.json`) against the base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined.
    pub fn endpoint(&self, path: &str) -> Result<Url, RequestError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// GET a forum API path and decode its JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error on non-throttling HTTP failures or undecodable bodies.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, RequestError> {
        let url = self.endpoint(path)?;
        let body = self
            .limiter
            .execute(|| {
                let request = self.authorized(self.http.get(url.clone())).query(query);
                async move {
                    let response = request.send().await?;
                    match self.check(response).await? {
                        Attempt::Done(response) => Ok(Attempt::Done(response.text().await?)),
                        Attempt::Throttled(wait) => Ok(Attempt::Throttled(wait)),
                    }
                }
            })
            .await?;

        serde_json::from_str(&body).map_err(|source| RequestError::Decode {
            source,
            payload: body,
        })
    }

    /// GET an absolute URL and return its body.
    ///
    /// # Errors
    ///
    /// Returns an error on non-throttling HTTP failures. The API key is only
    /// sent when `url` shares the forum's origin.
    pub async fn get_bytes(&self, url: &Url) -> Result<Download, RequestError> {
        let same_origin = url.origin() == self.base_url.origin();
        self.limiter
            .execute(|| {
                let request = self.http.get(url.clone());
                let request = if same_origin {
                    self.authorized(request)
                } else {
                    request
                };
                async move {
                    let response = request.send().await?;
                    match self.check(response).await? {
                        Attempt::Done(response) => {
                            let content_type = response
                                .headers()
                                .get(CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .map(ToString::to_string);
                            let bytes = response.bytes().await?.to_vec();
                            Ok(Attempt::Done(Download {
                                bytes,
                                content_type,
                            }))
                        }
                        Attempt::Throttled(wait) => Ok(Attempt::Throttled(wait)),
                    }
                }
            })
            .await
    }

    /// Check that the configured token is accepted by the forum.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Auth`] if the forum rejects the token or reports
    /// no current user.
    pub async fn validate_token(&self) -> Result<(), ArchiveError> {
        let session: serde_json::Value = self
            .get_json("session/current.json", &[])
            .await
            .map_err(|e| match e {
                RequestError::NotFound => {
                    ArchiveError::Auth("no active session for this token".to_string())
                }
                other => other.into_archive_error(0),
            })?;
        if session.get("current_user").is_some_and(|u| !u.is_null()) {
            Ok(())
        } else {
            Err(ArchiveError::Auth(
                "no active session for this token".to_string(),
            ))
        }
    }

    /// Attach the API key. Only ever called for forum-origin requests.
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(USER_API_KEY_HEADER, key.clone()),
            None => request,
        }
    }

    /// Classify a response: success, throttling signal, or error.
    async fn check(&self, response: Response) -> Result<Attempt<Response>, RequestError> {
        let status = response.status();
        if status.is_success() {
            return Ok(Attempt::Done(response));
        }
        debug!(url = %response.url(), %status, "Request failed");
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = self.retry_after(response).await?;
                Ok(Attempt::Throttled(wait))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RequestError::Unauthorized(status))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(RequestError::NotFound),
            _ => Err(RequestError::Status(status)),
        }
    }

    /// Determine how long a throttling response asks us to wait.
    async fn retry_after(&self, response: Response) -> Result<Duration, RequestError> {
        if let Some(value) = response.headers().get(RETRY_AFTER) {
            let raw = value.to_str().unwrap_or_default().to_string();
            return parse_retry_after(&raw, Utc::now()).ok_or(RequestError::InvalidRetryAfter(raw));
        }

        // Discourse also reports the wait in its JSON error body.
        let body = response.text().await.unwrap_or_default();
        if let Some(seconds) = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/extras/wait_seconds").and_then(serde_json::Value::as_u64))
        {
            return Ok(Duration::from_secs(seconds));
        }

        warn!(
            fallback_secs = self.rate_limit_fallback.as_secs(),
            "Throttled without a usable wait duration, using fallback"
        );
        Ok(self.rate_limit_fallback)
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
