//! SDK-wide error type.
//!
//! Every failed operation surfaces as a single [`MemphisError`]. Broker reply
//! text is preserved verbatim (modulo the transport-name rewrite the broker
//! ecosystem expects), schema failures carry the full violation list.

/// Result type for all SDK operations.
pub type Result<T> = std::result::Result<T, MemphisError>;

/// Errors that can occur during SDK operations.
#[derive(Debug, thiserror::Error)]
pub enum MemphisError {
    /// Transport-level failure (connect, request timeout, publish failure).
    /// Not retried by the SDK; retries are the caller's responsibility.
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker-reported failure carried in a reply or publish acknowledgement.
    #[error("broker error: {0}")]
    Broker(String),

    /// Payload rejected by the station's active schema.
    #[error("schema validation failed: {message}")]
    SchemaValidation {
        message: String,
        /// One entry per violated constraint, with its location where available.
        violations: Vec<String>,
    },

    /// Operation invalid in the current lifecycle state (double consume,
    /// stop while inactive, detach without a matching attach).
    #[error("invalid state: {0}")]
    State(String),

    /// Wire payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MemphisError {
    /// Build a broker error from reply text, rewriting the transport name the
    /// way the broker's own tooling reports it.
    pub(crate) fn broker(text: impl AsRef<str>) -> Self {
        Self::Broker(text.as_ref().replace("nats", "memphis"))
    }
}

impl From<serde_json::Error> for MemphisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
