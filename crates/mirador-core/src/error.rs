use thiserror::Error;

/// Application-wide error types.
///
/// This enum represents every failure the sync engine and its collaborators
/// can surface. Upstream failures are classified at the HTTP boundary so the
/// rest of the engine can reason about them without looking at status codes.
///
/// # Error Conversion
///
/// Most library errors convert automatically using the `#[from]` attribute:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use mirador_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::ConfigurationError("missing upstream base URL".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// This error wraps all errors from SQLx database operations, including
    /// connection failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Upstream configuration is missing or unusable.
    ///
    /// Fatal to a whole cycle: the engine aborts before any request is made.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Upstream rejected our credentials (HTTP 401/403). Never retried.
    #[error("Upstream authentication failed: HTTP {0}")]
    AuthError(u16),

    /// Upstream has no record with this identifier (HTTP 404 on detail fetch).
    #[error("Listing not found upstream: {0}")]
    NotFound(i64),

    /// Upstream returned HTTP 429.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Upstream returned a 5xx status.
    #[error("Upstream server error: HTTP {0}")]
    ServerError(u16),

    /// Network or connection error.
    ///
    /// This error occurs when a network request fails due to connectivity issues,
    /// DNS resolution failures, or the remote server being unreachable.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Any other non-2xx response. Terminal.
    #[error("Request to {url} failed: HTTP {status}")]
    RequestFailed { status: u16, url: String },

    /// The first listing page could not be fetched, so no cycle can run.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Reconciling a single record failed.
    #[error("Failed to process listing {external_id}: {reason}")]
    RecordProcessing { external_id: i64, reason: String },

    /// A sync cycle is already running.
    #[error("A sync cycle is already in progress")]
    CycleInProgress,

    /// The cycle-scoped cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Reading or parsing the configuration file failed.
    #[error("Config file error: {0}")]
    ConfigFile(String),

    /// Generic application error for cases not covered by specific variants.
    ///
    /// Use this sparingly - prefer creating specific error variants
    /// for better error handling and debugging.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Try: docker-compose up -d".to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::ConfigurationError(msg) => {
                format!(
                    "Upstream is not configured: {}\n   Set UPSTREAM_BASE_URL and UPSTREAM_API_KEY.",
                    msg
                )
            }
            AppError::AuthError(status) => {
                format!(
                    "Upstream rejected the API credentials (HTTP {}).\n   Check UPSTREAM_API_KEY and UPSTREAM_API_SECRET.",
                    status
                )
            }
            AppError::UpstreamUnavailable(msg) => {
                format!(
                    "Upstream listings API is unavailable: {}\n   Try again later.",
                    msg
                )
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!("Request timed out after {} seconds.\n   The server may be overloaded. Try again later.", secs)
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::CycleInProgress => {
                "A sync cycle is already running. Check `mirador status`.".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use mirador_core::error::AppError;
    ///
    /// // Network errors are retryable
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// // Rate limits are retryable (after a longer delay)
    /// assert!(AppError::RateLimitExceeded.is_retryable());
    ///
    /// // Auth failures and 404s are NOT retryable
    /// assert!(!AppError::AuthError(401).is_retryable());
    /// assert!(!AppError::NotFound(5).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ServerError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::NotFound(42);
        assert_eq!(err.to_string(), "Listing not found upstream: 42");
    }

    #[test]
    fn test_generic_error() {
        let err = AppError::Generic("Something went wrong".to_string());
        assert_eq!(err.to_string(), "Error: Something went wrong");
    }

    #[test]
    fn test_request_failed_display() {
        let err = AppError::RequestFailed {
            status: 418,
            url: "https://api.example.com/properties".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request to https://api.example.com/properties failed: HTTP 418"
        );
    }

    #[test]
    fn test_user_message_auth() {
        let msg = AppError::AuthError(403).user_message();
        assert!(msg.contains("rejected the API credentials"));
        assert!(msg.contains("403"));
    }

    #[test]
    fn test_user_message_configuration() {
        let msg = AppError::ConfigurationError("missing base URL".to_string()).user_message();
        assert!(msg.contains("UPSTREAM_BASE_URL"));
    }

    #[test]
    fn test_error_from_serde() {
        let json = "{ invalid json }";
        let result: Result<serde_json::Value, _> = serde_json::from_str(json);
        let serde_err = result.unwrap_err();
        let app_err: AppError = serde_err.into();
        assert!(matches!(app_err, AppError::SerializationError(_)));
    }

    #[test]
    fn test_user_message_database_connection() {
        let err = AppError::DatabaseError(sqlx::Error::PoolTimedOut);
        let msg = err.user_message();
        assert!(msg.contains("Cannot connect to database") || msg.contains("Database error"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(AppError::NetworkError("timeout".to_string()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(AppError::ServerError(503).is_retryable());
        assert!(!AppError::AuthError(401).is_retryable());
        assert!(!AppError::NotFound(1).is_retryable());
        assert!(!AppError::RequestFailed {
            status: 400,
            url: "x".to_string()
        }
        .is_retryable());
        assert!(!AppError::ConfigurationError("x".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_error() {
        let err = AppError::Timeout(30);
        assert_eq!(err.to_string(), "Request timed out after 30 seconds");
    }
}
