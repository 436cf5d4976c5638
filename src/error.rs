use thiserror::Error;

/// Main error type for the synchronizer and keeper processes.
///
/// Classes map to how the caller recovers: configuration problems skip the
/// affected operation (fatal only at startup), provider problems go through
/// the reconnect policy, per-event and per-collateral problems are logged
/// and retried without touching unrelated state.
#[derive(Error, Debug)]
pub enum PerpdError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    // Provider / RPC transport errors
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider {index} unavailable after {attempts} attempts")]
    ProviderUnavailable { index: usize, attempts: u32 },

    #[error("Subscription dropped: {0}")]
    SubscriptionDropped(String),

    #[error("Chain read reverted: {0}")]
    ChainRead(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Event processing errors
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    #[error("Malformed event payload: {0}")]
    MalformedEvent(String),

    // Reconciliation errors
    #[error("Reconciliation failed for collateral {collateral}: {reason}")]
    Reconciliation { collateral: u8, reason: String },

    // Oracle errors
    #[error("Oracle proof request failed: {0}")]
    Oracle(String),

    #[error("Stale price for pair {pair_index}")]
    StalePrice { pair_index: u32 },

    // Trigger submission errors
    #[error("Trigger submission failed: {0}")]
    Submission(String),

    #[error("Unknown collateral index: {0}")]
    UnknownCollateral(u8),

    #[error("Unknown pair index: {0}")]
    UnknownPair(u32),

    // Bus errors
    #[error("Bus channel closed: {0}")]
    BusClosed(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PerpdError {
    /// True for errors that should abort a reconnection campaign instead of
    /// being retried (the endpoint is wrong, not flaky).
    pub fn is_non_retryable(&self) -> bool {
        match self {
            PerpdError::Provider(msg) | PerpdError::SubscriptionDropped(msg) => {
                msg.contains("404") || msg.contains("Not Found")
            }
            PerpdError::MissingConfig(_) | PerpdError::Config(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for PerpdError
pub type Result<T> = std::result::Result<T, PerpdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_retryable_classification() {
        assert!(PerpdError::Provider("HTTP 404 Not Found".into()).is_non_retryable());
        assert!(PerpdError::MissingConfig("rpc_urls".into()).is_non_retryable());
        assert!(!PerpdError::Provider("connection reset".into()).is_non_retryable());
        assert!(!PerpdError::Submission("reverted".into()).is_non_retryable());
    }
}
