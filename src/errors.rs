// =============================================================================
// Stable error taxonomy for operation-scoped failures
// =============================================================================
//
// Propagation policy: recoverable errors (Network, RateLimit) stay inside the
// trading loop and feed the error budget. Config and Auth errors surface to
// the operator and are fatal. Venue rejections and integrity violations are
// journaled and never retried.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid mode/environment/symbol set. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Bad credentials or bad signature. Never retried.
    #[error("auth error: {0}")]
    Auth(String),

    /// Transient connectivity or timeout. Retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Venue rate limit. Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// The venue refused the action (insufficient margin, invalid qty, ...).
    #[error("venue rejection (retCode={code}): {message}")]
    VenueRejection { code: i64, message: String },

    /// Local invariant broken: missing instrument, stop on wrong side,
    /// qty below minimum after rounding.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Kill switch is active; placement refused immediately.
    #[error("halted")]
    Halted,

    /// Feature build failed (e.g. insufficient bars). Skip this tick.
    #[error("data quality: {0}")]
    DataQuality(String),
}

impl EngineError {
    /// Whether the trading loop may retry the failed operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }

    /// Whether the failure should count against the loop's error budget.
    pub fn counts_against_budget(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_) | Self::VenueRejection { .. })
    }

    /// Short stable token used in journal entries and persisted error rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::RateLimit(_) => "rate_limit",
            Self::VenueRejection { .. } => "venue_rejection",
            Self::Integrity(_) => "integrity",
            Self::Halted => "halted",
            Self::DataQuality(_) => "data_quality",
        }
    }
}
