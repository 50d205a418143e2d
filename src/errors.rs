//! engine error
use std::io::ErrorKind;
use std::num::ParseIntError;

use http::StatusCode;
use thiserror::Error as ThisError;

use crate::transaction::TransactionId;

/// A `Result` alias where the `Err` case is `waylay::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while proxying a transaction.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Invalid scope, exclusion or breakpoint pattern
  #[error(transparent)]
  Regex(#[from] regex::Error),
  /// Upstream SOCKS5 proxy refused the request
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Root or leaf certificate could not be produced
  #[error("certificate: {0}")]
  Certificate(String),
  /// Client sent something that is not HTTP/1.x
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Message body exceeded the configured limit
  #[error("payload exceeds {0} bytes")]
  PayloadTooLarge(usize),
  /// Start line or header section exceeded the configured limit
  #[error("header section exceeds {0} bytes")]
  HeaderTooLarge(usize),
  /// Upstream server or proxy misbehaved
  #[error("upstream: {0}")]
  Upstream(String),
  /// An operation did not finish in time
  #[error("timed out: {0}")]
  Timeout(String),
  /// Breakpoint control failure
  #[error(transparent)]
  Breakpoint(#[from] BreakpointError),
  /// Session store failure
  #[error(transparent)]
  Session(#[from] SessionError),
  /// History store failure
  #[error("history: {0}")]
  History(String),
  /// Configuration could not be loaded or is inconsistent
  #[error("config: {0}")]
  Config(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// The status a client should see when its own request caused this error.
  ///
  /// `None` means the connection should simply be closed.
  pub fn client_status(&self) -> Option<StatusCode> {
    match self {
      Error::InvalidRequest(_) | Error::Http(_) | Error::IntError(_) => Some(StatusCode::BAD_REQUEST),
      Error::PayloadTooLarge(_) => Some(StatusCode::PAYLOAD_TOO_LARGE),
      Error::HeaderTooLarge(_) => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
      Error::IO(e) if e.kind() == ErrorKind::InvalidData => Some(StatusCode::BAD_REQUEST),
      _ => None,
    }
  }
}

/// SOCKS5 reply codes other than success.
#[derive(ThisError, Debug)]
pub enum ReplyError {
  /// 0x01
  #[error("General failure")]
  GeneralFailure,
  /// 0x02
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// 0x03
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// 0x04
  #[error("Host unreachable")]
  HostUnreachable,
  /// 0x05
  #[error("Connection refused")]
  ConnectionRefused,
  /// 0x06
  #[error("TTL expired")]
  TtlExpired,
  /// 0x07
  #[error("Command not supported")]
  CommandNotSupported,
  /// 0x08
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// anything else
  #[error("Unknown reply code {0:#04x}")]
  Unknown(u8),
}

/// Errors returned by the breakpoint manager.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum BreakpointError {
  /// No decision is pending for the transaction (never paused or already resolved)
  #[error("transaction {0} is not paused")]
  NotPaused(TransactionId),
  /// A second pause was requested while one is still pending
  #[error("transaction {0} is already paused")]
  AlreadyPaused(TransactionId),
  /// The decision does not fit the phase the transaction is paused in
  #[error("decision not valid for transaction {0}: {1}")]
  InvalidDecision(TransactionId, String),
  /// The configured number of concurrently paused transactions is reached
  #[error("{0} transactions already paused")]
  TooManyPaused(usize),
  /// Unknown rule id
  #[error("no breakpoint rule with id {0}")]
  UnknownRule(u64),
}

/// Errors returned by the session state store.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
  /// No session with that name exists for the site
  #[error("site {site} has no session named {name:?}")]
  UnknownSession {
    /// site key
    site: String,
    /// session name
    name: String,
  },
  /// A session with that name already exists for the site
  #[error("site {site} already has a session named {name:?}")]
  DuplicateSession {
    /// site key
    site: String,
    /// session name
    name: String,
  },
  /// The value could not be turned into a site key
  #[error("not a site: {0}")]
  InvalidSite(String),
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUriParts> for Error {
  fn from(value: http::uri::InvalidUriParts) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn certificate<E: std::fmt::Display>(context: &str, e: E) -> Error {
  let err = Error::Certificate(format!("{context}: {e}"));
  tracing::error!("{}", err);
  err
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn client_errors_map_to_statuses() {
    assert_eq!(
      Error::InvalidRequest("x".into()).client_status(),
      Some(StatusCode::BAD_REQUEST)
    );
    assert_eq!(
      Error::PayloadTooLarge(10).client_status(),
      Some(StatusCode::PAYLOAD_TOO_LARGE)
    );
    assert_eq!(
      Error::HeaderTooLarge(10).client_status(),
      Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
    );
    let eof = new_io_error(ErrorKind::UnexpectedEof, "closed");
    assert_eq!(eof.client_status(), None);
  }
}
