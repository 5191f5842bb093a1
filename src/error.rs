use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Every per-play phase boundary catches the non-fatal variants so one bad
/// play cannot stop a cycle. `Fatal` aborts the tick and is escalated to the
/// shutdown path.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// All market-data providers returned no data for the same key.
    #[error("no data from any provider for {key}")]
    NoData { key: String },

    /// All market-data providers failed with transport-level errors.
    #[error("all providers failed for {key}: {detail}")]
    TransportFailure { key: String, detail: String },

    #[error("broker rejected order: {reason}")]
    BrokerRejected { reason: String },

    /// Transport error talking to the broker. PENDING_* state is preserved
    /// and the poll is retried next tick; submits are never auto-retried.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("broker authentication failed: {0}")]
    BrokerAuth(String),

    #[error("risk check denied: {reason}")]
    RiskDenied { reason: String },

    /// A play record failed invariants on load or an illegal state
    /// transition was requested. The record is quarantined, never acted on.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Validation(_) | EngineError::Integrity(_) => 2,
            EngineError::BrokerAuth(_) => 3,
            _ => 4,
        }
    }

    /// True when the condition may clear on a later cycle without operator
    /// intervention (caller should retry, not skip).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::TransportFailure { .. } | EngineError::BrokerUnavailable(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
