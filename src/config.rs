//! Configuration types for nozomi-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote host configuration
///
/// The index host serves version tokens, B-tree node files, data blobs, sorted
/// ID lists, item records and the obfuscation script. The CDN domain is never
/// requested directly: resource hosts are derived from it per file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Host serving the index files (default: "ltn.gold-usergeneratedcontent.net")
    #[serde(default = "default_index_domain")]
    pub index_domain: String,

    /// Base domain of the resource CDN (default: "gold-usergeneratedcontent.net")
    #[serde(default = "default_cdn_domain")]
    pub cdn_domain: String,

    /// Site prefix used to build the referer header (default: "https://hitomi.la")
    #[serde(default = "default_referer_base")]
    pub referer_base: String,

    /// URL scheme for index requests (default: "https")
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            index_domain: default_index_domain(),
            cdn_domain: default_cdn_domain(),
            referer_base: default_referer_base(),
            scheme: default_scheme(),
        }
    }
}

impl EndpointConfig {
    /// Absolute URL of a path on the index host
    pub fn index_url(&self, path: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            self.index_domain,
            path.trim_start_matches('/')
        )
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (default: 10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 5 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Growth factor applied to the delay after each retry (default: 1.5)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Resource retrieval configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum simultaneous file fetches per retrieval (default: 5)
    ///
    /// Keep this small: the CDN throttles clients that open many connections.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Extension requested from the CDN and used for archive entry names (default: "webp")
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_ms_serde")]
    pub request_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            extension: default_extension(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Obfuscation script handling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    /// Age after which the routing table is fetched again (default: 10 minutes)
    #[serde(default = "default_obfuscation_max_age", with = "duration_ms_serde")]
    pub max_age: Duration,

    /// Append a `_=<millis>` query parameter to bypass caches (default: false)
    #[serde(default)]
    pub cache_bust: bool,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            max_age: default_obfuscation_max_age(),
            cache_bust: false,
        }
    }
}

/// HTTP client settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Proxy URL applied to all requests (None = direct)
    #[serde(default)]
    pub proxy: Option<String>,

    /// User-Agent header (None = reqwest default)
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote hosts
    #[serde(default)]
    pub endpoints: EndpointConfig,

    /// Retry policy for index and resource fetches
    #[serde(default)]
    pub retry: RetryConfig,

    /// Retrieval settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Obfuscation script refresh settings
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Check the configuration for values that would make every request fail
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(config_error(
                "max_attempts must be at least 1",
                "retry.max_attempts",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be >= 1.0",
                "retry.backoff_multiplier",
            ));
        }
        if self.endpoints.index_domain.trim().is_empty() {
            return Err(config_error(
                "index_domain must not be empty",
                "endpoints.index_domain",
            ));
        }
        if self.endpoints.cdn_domain.trim().is_empty() {
            return Err(config_error(
                "cdn_domain must not be empty",
                "endpoints.cdn_domain",
            ));
        }
        let ext = &self.download.extension;
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(config_error(
                format!("extension {ext:?} must be non-empty ASCII alphanumeric"),
                "download.extension",
            ));
        }
        if let Some(proxy) = &self.http.proxy {
            url::Url::parse(proxy).map_err(|e| {
                config_error(format!("invalid proxy URL: {e}"), "http.proxy")
            })?;
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

// Default value functions
fn default_index_domain() -> String {
    "ltn.gold-usergeneratedcontent.net".to_string()
}

fn default_cdn_domain() -> String {
    "gold-usergeneratedcontent.net".to_string()
}

fn default_referer_base() -> String {
    "https://hitomi.la".to_string()
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_concurrency() -> usize {
    5
}

fn default_extension() -> String {
    "webp".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_obfuscation_max_age() -> Duration {
    Duration::from_secs(600)
}

// Duration serialization helper (milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
