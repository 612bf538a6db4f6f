use crate::utils::validation::MAX_FILE_SIZE;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Runtime configuration for the extractor service
#[derive(Debug, Clone, Validate)]
pub struct AppConfig {
    /// Gemini API key (default: empty)
    pub gemini_api_key: String,

    /// Gemini API root, without version segment
    #[validate(url)]
    pub gemini_base_url: String,

    /// Model used for generateContent (default: "gemini-2.0-flash")
    #[validate(length(min = 1))]
    pub model: String,

    /// How long to wait for an uploaded file to become active (default: 60s)
    #[validate(range(min = 1))]
    pub poll_timeout_secs: u64,

    /// Delay between file status checks (default: 1000ms)
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,

    /// Maximum image size in bytes (default: 20 MB)
    #[validate(range(min = 1024))]
    pub max_file_size: usize,

    /// Per-request timeout for remote calls (default: 120s)
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Listen address (default: 127.0.0.1:3000)
    pub bind_addr: SocketAddr,

    /// Allowed CORS Origins (comma separated, empty = any)
    pub allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            poll_timeout_secs: 60,
            poll_interval_ms: 1000,
            max_file_size: MAX_FILE_SIZE,
            request_timeout_secs: 120,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            allowed_origins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            gemini_api_key: env::var("GEMINI_API_KEY").unwrap_or(default.gemini_api_key),

            gemini_base_url: env::var("GEMINI_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(default.gemini_base_url),

            model: env::var("GEMINI_MODEL").unwrap_or(default.model),

            poll_timeout_secs: env::var("POLL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.poll_timeout_secs),

            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.poll_interval_ms),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.request_timeout_secs),

            bind_addr: env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.bind_addr),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Create config for development and tests (fast polling, short timeouts)
    pub fn development() -> Self {
        Self {
            gemini_api_key: "test-key".to_string(),
            poll_timeout_secs: 1,
            poll_interval_ms: 10,
            request_timeout_secs: 5,
            ..Self::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn has_api_key(&self) -> bool {
        !self.gemini_api_key.trim().is_empty()
    }
}
