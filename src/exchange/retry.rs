// =============================================================================
// Retry core — exponential backoff with venue return-code classification
// =============================================================================
//
// Backoff starts at 0.5 s, doubles, and caps at 10 s. Auth and
// invalid-parameter codes are never retried; rate-limit codes retry with
// backoff; other temporary failures retry up to the attempt cap, after which
// the call returns a failure without raising out of the core.
// =============================================================================

use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::EngineError;

/// Default attempt cap for retriable failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Classification of a Bybit V5 `retCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// retCode == 0.
    Success,
    /// Temporary server-side conditions; retry with backoff.
    Retriable,
    /// Rate limited; retry with backoff.
    RateLimited,
    /// Bad credentials or signature; never retry.
    AuthError,
    /// Invalid request parameters; never retry.
    InvalidParameter,
    /// The venue refused the action (margin, qty, leverage); never retry.
    VenueRejection,
}

/// Classify a Bybit return code. The named sets are canonical; unknown
/// non-zero codes are treated as retriable up to the attempt cap.
pub fn classify_ret_code(code: i64) -> RetryClass {
    match code {
        0 => RetryClass::Success,
        // Timestamp drift, server busy.
        10002 | 10016 => RetryClass::Retriable,
        // Rate limits (request rate, IP).
        10006 | 10018 => RetryClass::RateLimited,
        // Auth failures.
        10003 | 10004 | 10005 | 33004 => RetryClass::AuthError,
        // Invalid parameter.
        10001 => RetryClass::InvalidParameter,
        // Insufficient margin / invalid qty / leverage exceeded.
        110007 | 110012 | 110045 => RetryClass::VenueRejection,
        _ => RetryClass::Retriable,
    }
}

/// Map a non-zero return code to the stable error taxonomy.
pub fn ret_code_error(code: i64, message: &str) -> EngineError {
    match classify_ret_code(code) {
        RetryClass::Success => unreachable!("retCode 0 is not an error"),
        RetryClass::AuthError => EngineError::Auth(format!("retCode {code}: {message}")),
        RetryClass::RateLimited => EngineError::RateLimit(format!("retCode {code}: {message}")),
        RetryClass::InvalidParameter | RetryClass::VenueRejection => EngineError::VenueRejection {
            code,
            message: message.to_string(),
        },
        RetryClass::Retriable => EngineError::Network(format!("retCode {code}: {message}")),
    }
}

/// Delay before the given (1-based) retry attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE * 2u32.pow(exp);
    delay.min(BACKOFF_CAP)
}

/// Run `op` with retry. `op` returns `Ok(T)` or an [`EngineError`]; only
/// Network and RateLimit errors are retried.
pub async fn with_retry<T, F, Fut>(label: &str, max_attempts: u32, mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(err) if err.is_retriable() && attempt < max_attempts => {
                let delay = backoff_delay(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retriable failure — backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
