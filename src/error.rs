//! Error type shared by dispatchers, observer chains and scopes.
//!
//! Delivery failures travel as [`Error`] values through `Result` rather than
//! unwinding. Panics that escape fire-and-forget work are converted into
//! [`Error::Panicked`] at the dispatcher boundary.

use std::{any::Any, sync::Arc};

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  /// The dispatcher (or the scope owning it) has been disposed.
  #[error("dispatcher has been disposed")]
  Disposed,
  /// The cancellation scope observed by the work was cancelled before it ran.
  #[error("operation was cancelled")]
  Cancelled,
  /// Dispatched work panicked; the payload message is preserved when it is a
  /// string.
  #[error("dispatched work panicked: {0}")]
  Panicked(String),
  #[error("{0}")]
  Message(String),
  #[error(transparent)]
  Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
  /// Builds an error from a plain message.
  pub fn msg(message: impl Into<String>) -> Self { Error::Message(message.into()) }

  /// Wraps any standard error.
  pub fn failed<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Error::Failed(Arc::new(err))
  }

  #[inline]
  pub fn is_disposed(&self) -> bool { matches!(self, Error::Disposed) }

  #[inline]
  pub fn is_cancelled(&self) -> bool { matches!(self, Error::Cancelled) }

  pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    Error::Panicked(message)
  }
}

/// A failure offered to an error callback together with its "handled" flag.
///
/// Callbacks leave `handled` as they find it to accept the default, or flip it
/// to pass the failure on (or take it back).
#[derive(Debug)]
pub struct Caught {
  error: Error,
  pub handled: bool,
}

impl Caught {
  pub(crate) fn new(error: Error, handled: bool) -> Self { Caught { error, handled } }

  #[inline]
  pub fn error(&self) -> &Error { &self.error }

  pub fn into_error(self) -> Error { self.error }
}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Self { Error::failed(err) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn panic_payloads_keep_their_message() {
    let err = Error::from_panic(Box::new("boom"));
    assert_eq!(err.to_string(), "dispatched work panicked: boom");

    let err = Error::from_panic(Box::new(String::from("owned")));
    assert!(matches!(err, Error::Panicked(ref m) if m == "owned"));

    let err = Error::from_panic(Box::new(42_u8));
    assert!(matches!(err, Error::Panicked(_)));
  }

  #[test]
  fn wrapped_errors_are_transparent() {
    let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
    let err: Error = io.into();
    assert_eq!(err.to_string(), "disk gone");
    assert!(!err.is_disposed());
    assert!(Error::Disposed.is_disposed());
    assert!(Error::Cancelled.is_cancelled());
  }
}
