use thiserror::Error;

/// Error types for cache engine operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Invalid cache strategy '{name}': {reason}")]
    InvalidStrategy { name: String, reason: String },

    #[error("Backing store error: {0}")]
    BackingStore(String),

    #[error("Peer node {node_id} unavailable: {reason}")]
    PeerUnavailable { node_id: String, reason: String },

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl CacheError {
    /// Create a new StrategyNotFound error
    pub fn strategy_not_found(name: impl Into<String>) -> Self {
        Self::StrategyNotFound(name.into())
    }

    /// Create a new InvalidStrategy error
    pub fn invalid_strategy(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStrategy {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new BackingStore error
    pub fn backing_store(message: impl Into<String>) -> Self {
        Self::BackingStore(message.into())
    }

    /// Create a new PeerUnavailable error
    pub fn peer_unavailable(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PeerUnavailable {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Loader error
    pub fn loader(message: impl Into<String>) -> Self {
        Self::Loader(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Encryption error
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Errors raised by a secondary tier (peer nodes) are always absorbed
    /// by the engine and never surface to callers.
    pub fn is_secondary_tier(&self) -> bool {
        matches!(self, Self::PeerUnavailable { .. })
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StrategyNotFound(_) | Self::InvalidStrategy { .. } => ErrorCategory::Strategy,
            Self::BackingStore(_) => ErrorCategory::Storage,
            Self::PeerUnavailable { .. } => ErrorCategory::Peer,
            Self::Loader(_) => ErrorCategory::Loader,
            Self::Serialization(_) | Self::JsonError(_) => ErrorCategory::Serialization,
            Self::Encryption(_) => ErrorCategory::Encryption,
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Strategy,
    Storage,
    Peer,
    Loader,
    Serialization,
    Encryption,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strategy => write!(f, "strategy"),
            Self::Storage => write!(f, "storage"),
            Self::Peer => write!(f, "peer"),
            Self::Loader => write!(f, "loader"),
            Self::Serialization => write!(f, "serialization"),
            Self::Encryption => write!(f, "encryption"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CacheError::strategy_not_found("user");
        assert_eq!(err.to_string(), "Cache strategy not found: user");

        let err = CacheError::invalid_strategy("user", "ttl_seconds must be >= 0");
        assert_eq!(
            err.to_string(),
            "Invalid cache strategy 'user': ttl_seconds must be >= 0"
        );

        let err = CacheError::peer_unavailable("node-b", "connection refused");
        assert_eq!(
            err.to_string(),
            "Peer node node-b unavailable: connection refused"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let err: CacheError = json_err.into();

        assert!(matches!(err, CacheError::JsonError(_)));
        assert_eq!(err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_only_peer_errors_are_secondary_tier() {
        assert!(CacheError::peer_unavailable("n1", "timeout").is_secondary_tier());
        assert!(!CacheError::backing_store("down").is_secondary_tier());
        assert!(!CacheError::loader("boom").is_secondary_tier());
        assert!(!CacheError::strategy_not_found("x").is_secondary_tier());
    }

    #[test]
    fn test_error_categories_display() {
        assert_eq!(ErrorCategory::Strategy.to_string(), "strategy");
        assert_eq!(ErrorCategory::Storage.to_string(), "storage");
        assert_eq!(ErrorCategory::Peer.to_string(), "peer");
        assert_eq!(ErrorCategory::Loader.to_string(), "loader");
        assert_eq!(ErrorCategory::Serialization.to_string(), "serialization");
        assert_eq!(ErrorCategory::Encryption.to_string(), "encryption");
        assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(CacheError::backing_store("x").category(), ErrorCategory::Storage);
        assert_eq!(CacheError::encryption("x").category(), ErrorCategory::Encryption);
        assert_eq!(CacheError::configuration("x").category(), ErrorCategory::Configuration);
        assert_eq!(CacheError::serialization("x").category(), ErrorCategory::Serialization);
        assert_eq!(
            CacheError::invalid_strategy("s", "bad").category(),
            ErrorCategory::Strategy
        );
    }
}
