//! Relay configuration
//!
//! Everything the uploader needs to reach the verification backend. The
//! defaults point at the FaceTec testing API.

use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default processing endpoint (FaceTec testing API)
pub const DEFAULT_ENDPOINT: &str = "https://api.facetec.com/api/v4/biometrics/process-request";

/// Total time a single request may take, retries excluded
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Connection-level retries performed by the HTTP uploader before giving up
const DEFAULT_MAX_TRANSPORT_RETRIES: u32 = 2;

/// Delay between uploader retries
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Body chunk size used for upload progress reporting
const DEFAULT_UPLOAD_CHUNK_SIZE: u32 = 16 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Upload chunk size must be greater than zero")]
    ZeroChunkSize,
}

/// Relay configuration exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct RelayConfig {
    /// Webservice endpoint that forwards request blobs to the verification server
    pub endpoint: String,
    /// Sent as `X-Device-Key`
    pub device_key_identifier: String,
    /// Sent as `X-Testing-API-Header` (testing API only)
    pub testing_api_header: Option<String>,
    pub request_timeout_secs: u64,
    pub max_transport_retries: u32,
    pub retry_delay_ms: u64,
    pub upload_chunk_size: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            device_key_identifier: String::new(),
            testing_api_header: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_transport_retries: DEFAULT_MAX_TRANSPORT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
        }
    }
}

impl RelayConfig {
    /// Create a config for the given endpoint and device key, defaults elsewhere
    pub fn new(endpoint: impl Into<String>, device_key_identifier: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            device_key_identifier: device_key_identifier.into(),
            ..Self::default()
        }
    }

    /// Set the testing API header
    pub fn with_testing_api_header(mut self, header: impl Into<String>) -> Self {
        self.testing_api_header = Some(header.into());
        self
    }

    /// Check the endpoint parses and uses http(s)
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{} ({})", self.endpoint, e)))?;

        match url.scheme() {
            "https" | "http" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        if self.upload_chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
