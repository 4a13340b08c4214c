use thiserror::Error;

pub type CollectorResult<T> = Result<T, CollectorError>;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("OAuth error: {0}")]
    OAuthError(String),

    #[error("Graph API error: {status} - {message}")]
    GraphApiError { status: u16, message: String },

    #[error("Rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Connection failed after {attempts} retries: {message}")]
    RetryExhausted { attempts: u32, message: String },

    #[error("Store error: {0}")]
    StoreError(#[from] storage::StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String)
}

impl CollectorError {
    /// Transient transport faults that warrant another attempt. Protocol
    /// faults reported by the service are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::RateLimited { .. } => true,
            _ => false
        }
    }
}
