//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `hat::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The Errors that may occur while running the proxy.
///
/// Each variant maps onto one failure class: configuration problems are fatal
/// at startup, crypto problems fail a single certificate operation, and the
/// I/O-flavoured variants fail a single connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Missing or invalid configuration, or unusable CA material
  #[error("config error: {0}")]
  Config(String),
  /// Key generation, signing or PEM encode/decode failure
  #[error("crypto error: {0}")]
  Crypto(String),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// Could not open a connection to the origin
  #[error("failed to connect to {addr}: {source}")]
  Dial {
    /// host:port that was dialed
    addr: String,
    /// underlying socket error
    #[source]
    source: std::io::Error,
  },
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// The client sent something that is not a usable proxy request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// The persistence collaborator failed
  #[error("store error: {0}")]
  Store(String),
}

impl Error {
  /// Create a config error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a crypto error and log it
  pub fn crypto_error(msg: impl Into<String>) -> Self {
    let error = Error::Crypto(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a store error and log it
  pub fn store_error(msg: impl Into<String>) -> Self {
    let error = Error::Store(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a dial error and log it
  pub fn dial_error(addr: impl Into<String>, source: std::io::Error) -> Self {
    let error = Error::Dial {
      addr: addr.into(),
      source,
    };
    tracing::warn!("{}", error);
    error
  }
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

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
