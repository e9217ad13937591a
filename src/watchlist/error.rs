use thiserror::Error;

/// Errors surfaced synchronously from engine entry points.
///
/// Retryable transport conditions (no buffers, write-call-again) are not
/// errors; they are absorbed by the engine and reported through the
/// NEED_FLUSH hint. Protocol timeouts are synthesized as status/ack events,
/// never as `Err`.
#[derive(Debug, Error)]
pub enum WatchlistError {
  /// Malformed submission. State is untouched.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// Decoded content violates the RDM schema. State is untouched.
  #[error("invalid data: {0}")]
  InvalidData(String),

  /// Resource exhaustion; the engine remains safe to tear down.
  #[error("memory allocation failed: {0}")]
  MemoryAllocation(String),

  /// The channel failed fatally; the engine has entered recovery.
  #[error("transport failure: {0}")]
  TransportFatal(String),

  /// Internal invariant violation.
  #[error("internal error: {0}")]
  Internal(String),
}

impl WatchlistError {
  pub fn invalid_argument(text: impl Into<String>) -> Self {
    WatchlistError::InvalidArgument(text.into())
  }

  pub fn invalid_data(text: impl Into<String>) -> Self {
    WatchlistError::InvalidData(text.into())
  }
}

pub type Result<T> = std::result::Result<T, WatchlistError>;
