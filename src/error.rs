//! Error handling for the message fabric

use thiserror::Error;

/// Result type alias for the message fabric
pub type Result<T> = std::result::Result<T, FabricError>;

/// Main error type for broker and agent runtime operations
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("callback delivery failed: {0}")]
    Callback(String),

    #[error("no online agents for service '{0}'")]
    NoCandidates(String),

    #[error("not yet registered with the broker")]
    NotRegistered,

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("timed out waiting for a reply")]
    ReplyTimeout,

    #[error("tool error: {0}")]
    Tool(String),

    #[error("translator error: {0}")]
    Translator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised while signing or verifying envelope tokens
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("private key not found at {0}")]
    MissingKey(String),

    #[error("unreadable key material: {0}")]
    BadKey(String),

    #[error("no public key found for issuer '{0}'")]
    UnknownIssuer(String),

    #[error("malformed token")]
    Malformed,

    #[error("token rejected: {0}")]
    Rejected(String),

    #[error("token missing 'env' claim")]
    MissingEnvelope,

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl FabricError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::Http(_)
                | FabricError::Callback(_)
                | FabricError::Tool(_)
                | FabricError::Delivery(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            FabricError::Signature(_) => "signature",
            FabricError::Validation(_) => "validation",
            FabricError::Config(_) => "config",
            FabricError::UnknownAgent(_) => "unknown_agent",
            FabricError::Callback(_) => "callback",
            FabricError::NoCandidates(_) => "no_candidates",
            FabricError::NotRegistered => "not_registered",
            FabricError::Registration(_) => "registration",
            FabricError::Delivery(_) => "delivery",
            FabricError::ReplyTimeout => "reply_timeout",
            FabricError::Tool(_) => "tool",
            FabricError::Translator(_) => "translator",
            FabricError::Io(_) => "io",
            FabricError::Serialization(_) => "serialization",
            FabricError::Http(_) => "http",
        }
    }
}
