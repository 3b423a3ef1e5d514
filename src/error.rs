//! Error taxonomy for the coordination core.
//!
//! Most module boundaries use `anyhow::Result`; this enum names the handful
//! of conditions with defined recovery behavior so callers can match on them
//! or surface a stable message to the driver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The store cannot be reached. Callers log and skip the cycle; the
    /// operation is retried on the next poll.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A persisted request carries an unparsable payload. Falls back to the
    /// least-surprising safe default rather than failing the request.
    #[error("malformed request payload: {0}")]
    RequestMalformed(String),

    /// The wrapped host capability threw or reported failure. Captured into
    /// the request's error_message with status=failed.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    /// A `running` row survived a restart with no recoverable outcome.
    #[error("no result found for request {0} after restart")]
    OrphanedRequest(i64),
}
