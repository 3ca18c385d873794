//! Error types shared by every formsync component.

use thiserror::Error;

/// Library error type.
#[derive(Debug, Error)]
pub enum Error {
  /// The form is not listed by the server, or an update target is missing.
  #[error("not found: {0}")]
  NotFound(String),

  /// The server answered 401.
  #[error("unauthorized: {0}")]
  Unauthorized(String),

  /// Any other non-2xx answer.
  #[error("upstream responded with status {status}: {message}")]
  Upstream { status: u16, message: String },

  /// The network could not be reached (connect failure or timeout).
  #[error("offline: {0}")]
  Offline(String),

  #[error("{name} is {size} bytes, larger than the accepted maximum of {max} bytes")]
  TooLarge { name: String, size: u64, max: u64 },

  #[error("invalid record: {0}")]
  InvalidRecord(String),

  #[error("survey {0} requires encryption but no encryption capability is configured")]
  EncryptionUnavailable(String),

  #[error("storage error: {0}")]
  Storage(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  #[error("http error: {0}")]
  Http(String),

  #[error("configuration error: {0}")]
  Config(String),
}

impl Error {
  /// Build an error from a non-success HTTP status.
  ///
  /// 401 and 404 get their own variants so callers can react to them
  /// without inspecting status codes.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      401 => Error::Unauthorized(message),
      404 => Error::NotFound(message),
      _ => Error::Upstream { status, message },
    }
  }

  /// Whether retrying later could succeed without user intervention.
  pub fn is_transient(&self) -> bool {
    match self {
      Error::Offline(_) | Error::Http(_) => true,
      Error::Upstream { status, .. } => *status >= 500 || *status == 408 || *status == 429,
      _ => false,
    }
  }

  /// Whether the server says the form is gone or off-limits.
  pub fn is_not_found_or_unauthorized(&self) -> bool {
    matches!(self, Error::NotFound(_) | Error::Unauthorized(_))
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_connect() || e.is_timeout() {
      return Error::Offline(e.to_string());
    }
    if let Some(status) = e.status() {
      return Error::from_status(status.as_u16(), e.to_string());
    }
    Error::Http(e.to_string())
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Serialization(e.to_string())
  }
}

impl From<quick_xml::DeError> for Error {
  fn from(e: quick_xml::DeError) -> Self {
    Error::Serialization(e.to_string())
  }
}

impl From<url::ParseError> for Error {
  fn from(e: url::ParseError) -> Self {
    Error::Config(format!("invalid URL: {}", e))
  }
}

/// Result type alias for formsync operations.
pub type Result<T> = std::result::Result<T, Error>;
