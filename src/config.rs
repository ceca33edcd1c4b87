use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Archiver configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Forum
    pub forum_url: Url,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,

    // Pagination
    pub chunk_size: usize,

    // Resources
    pub resource_concurrency: usize,
    pub resource_retry_attempts: u32,
    pub resource_retry_delay: Duration,
    pub avatar_size: u32,

    // HTTP
    pub request_timeout: Duration,
    pub connect_timeout: Duration,

    // Rate limiting
    pub rate_limit_fallback: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Forum
            forum_url: parse_forum_url(&required_env("FORUM_URL")?)?,
            api_key: optional_env("FORUM_API_KEY"),
            user_agent: optional_env("USER_AGENT"),

            // Pagination
            chunk_size: parse_env_usize("CHUNK_SIZE", 20)?,

            // Resources
            resource_concurrency: parse_env_usize("RESOURCE_CONCURRENCY", 4)?,
            resource_retry_attempts: parse_env_u32("RESOURCE_RETRY_ATTEMPTS", 3)?,
            resource_retry_delay: Duration::from_millis(parse_env_u64(
                "RESOURCE_RETRY_DELAY_MS",
                1000,
            )?),
            avatar_size: parse_env_u32("AVATAR_SIZE", 48)?,

            // HTTP
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 30)?),
            connect_timeout: Duration::from_secs(parse_env_u64("CONNECT_TIMEOUT_SECS", 10)?),

            // Rate limiting
            rate_limit_fallback: Duration::from_secs(parse_env_u64(
                "RATE_LIMIT_FALLBACK_SECS",
                30,
            )?),
        })
    }

    /// Configuration pointing at a (usually mocked) forum, with short timeouts.
    #[must_use]
    pub fn for_testing(forum_url: &str) -> Self {
        Self {
            forum_url: parse_forum_url(forum_url).unwrap_or_else(|_| {
                Url::parse("http://127.0.0.1/").expect("static url is valid")
            }),
            api_key: Some("test-api-key".to_string()),
            user_agent: None,
            chunk_size: 20,
            resource_concurrency: 4,
            resource_retry_attempts: 3,
            resource_retry_delay: Duration::from_millis(10),
            avatar_size: 48,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            rate_limit_fallback: Duration::from_secs(1),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CHUNK_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.resource_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "RESOURCE_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.avatar_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "AVATAR_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.api_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                name: "FORUM_API_KEY".to_string(),
                message: "cannot be blank".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse the forum base URL, normalizing it to end with a slash so relative
/// API paths join underneath it.
fn parse_forum_url(value: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(value.trim()).map_err(|e| ConfigError::InvalidValue {
        name: "FORUM_URL".to_string(),
        message: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidValue {
            name: "FORUM_URL".to_string(),
            message: format!("must be http or https, got '{}'", url.scheme()),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_forum_url_adds_trailing_slash() {
        let url = parse_forum_url("https://forum.example.com/community").unwrap();
        assert_eq!(url.as_str(), "https://forum.example.com/community/");
        assert_eq!(
            url.join("t/42.json").unwrap().as_str(),
            "https://forum.example.com/community/t/42.json"
        );
    }

    #[test]
    fn test_parse_forum_url_rejects_other_schemes() {
        assert!(parse_forum_url("ftp://forum.example.com").is_err());
        assert!(parse_forum_url("not a url").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = Config {
            chunk_size: 0,
            ..Config::for_testing("http://localhost:1234")
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { name, .. }) if name == "CHUNK_SIZE"
        ));
    }

    #[test]
    fn test_validate_rejects_blank_api_key() {
        let config = Config {
            api_key: Some("   ".to_string()),
            ..Config::for_testing("http://localhost:1234")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_testing_is_valid() {
        assert!(Config::for_testing("http://localhost:1234").validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::set_var("FORUM_URL", "https://forum.example.com");
        std::env::remove_var("CHUNK_SIZE");
        std::env::remove_var("RESOURCE_CONCURRENCY");
        std::env::remove_var("RATE_LIMIT_FALLBACK_SECS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.forum_url.as_str(), "https://forum.example.com/");
        assert_eq!(config.chunk_size, 20);
        assert_eq!(config.resource_concurrency, 4);
        assert_eq!(config.rate_limit_fallback, Duration::from_secs(30));

        std::env::remove_var("FORUM_URL");
    }

    #[test]
    #[serial]
    fn test_from_env_missing_forum_url() {
        std::env::remove_var("FORUM_URL");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnvVar(name)) if name == "FORUM_URL"
        ));
    }

    #[test]
    #[serial]
    fn test_from_env_bad_integer() {
        std::env::set_var("FORUM_URL", "https://forum.example.com");
        std::env::set_var("CHUNK_SIZE", "lots");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::ParseInt { name, .. }) if name == "CHUNK_SIZE"
        ));
        std::env::remove_var("CHUNK_SIZE");
        std::env::remove_var("FORUM_URL");
    }
}
