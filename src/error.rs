//! Error types for the LarkDB client SDK.

use thiserror::Error;

/// Reasons a request payload was rejected before reaching the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidDataKind {
  #[error("serialization failure")]
  SerializationFailure,

  #[error("invalid filter")]
  InvalidFilter,

  #[error("invalid document")]
  InvalidDocument,

  #[error("invalid identifier format")]
  InvalidIdentifierFormat,

  #[error("invalid key path")]
  InvalidKeyPath,

  #[error("invalid limit")]
  InvalidLimit,
}

/// Reasons an optimistic execution did not complete.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
  #[error("write conflict")]
  WriteConflict,

  #[error("aborted")]
  Aborted,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
  #[error("Permission denied")]
  PermissionDenied,

  #[error("Server error: {0}")]
  Server(String),

  #[error("Invalid request")]
  InvalidRequest,

  #[error("Connection terminated")]
  ConnectionTerminated,

  #[error("Invalid data: {0}")]
  InvalidData(InvalidDataKind),

  #[error("Timeout")]
  Timeout,

  #[error("Invalid auth token")]
  InvalidAuthToken,

  #[error("Execution failed: {0}")]
  ExecutionFailed(ExecutionErrorKind),

  #[error("Channel closed")]
  ChannelClosed,

  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Maps a server `err-type` tag to the client-side error taxonomy.
  pub(crate) fn from_wire(err_type: &str, err_msg: Option<&str>) -> Self {
    match err_type {
      "permission-denied" => Error::PermissionDenied,
      "server-error" => Error::Server(err_msg.unwrap_or("internal server error").to_string()),
      "invalid-request" => Error::InvalidRequest,
      "connection-terminated" => Error::ConnectionTerminated,
      "invalid-auth-token" => Error::InvalidAuthToken,
      "write-conflict" => Error::ExecutionFailed(ExecutionErrorKind::WriteConflict),
      other => Error::Other(err_msg.map(str::to_string).unwrap_or_else(|| other.to_string())),
    }
  }

  /// True when the logical session is gone and the connection id must be
  /// discarded before reconnecting.
  pub(crate) fn terminates_session(&self) -> bool {
    matches!(self, Error::ConnectionTerminated | Error::Timeout)
  }
}

impl From<serde_json::Error> for Error {
  fn from(_: serde_json::Error) -> Self {
    Error::InvalidData(InvalidDataKind::SerializationFailure)
  }
}

impl From<std::io::Error> for Error {
  fn from(e: std::io::Error) -> Self {
    Error::Other(format!("io error: {}", e))
  }
}

pub type Result<T> = std::result::Result<T, Error>;
