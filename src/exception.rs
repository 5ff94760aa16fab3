//! Exception-handler collaborator.
//!
//! Every dispatcher is built with a [`SharedHandler`]; failures that nothing
//! else handled (fire-and-forget work, async observer boundaries, sources
//! configured with a handler) end up there. [`ExceptionHub`] is the usual
//! implementation: it logs and republishes each failure through its own
//! observable so other parts of an application can react.

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

use tracing::{error, warn};

use crate::{
  error::Error,
  event::{EventSource, Observable},
};

pub trait ExceptionHandler: Send + Sync {
  fn handle(&self, error: &Error);
}

pub type SharedHandler = Arc<dyn ExceptionHandler>;

impl<F> ExceptionHandler for F
where
  F: Fn(&Error) + Send + Sync,
{
  #[inline]
  fn handle(&self, error: &Error) { self(error) }
}

/// Logs through `tracing` and nothing else.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogExceptionHandler;

impl ExceptionHandler for LogExceptionHandler {
  fn handle(&self, err: &Error) { error!(error = %err, "unhandled exception"); }
}

/// Logs unhandled failures and republishes them.
pub struct ExceptionHub {
  source: EventSource<Error>,
  count: AtomicUsize,
}

impl ExceptionHub {
  pub fn new() -> Arc<Self> {
    Arc::new(ExceptionHub { source: EventSource::new(), count: AtomicUsize::new(0) })
  }

  /// Every failure the hub received, as it arrives.
  pub fn observable(&self) -> Observable<Error> { self.source.observable() }

  /// Number of failures received so far.
  pub fn unhandled_count(&self) -> usize { self.count.load(Ordering::Acquire) }

  pub fn as_handler(self: &Arc<Self>) -> SharedHandler { self.clone() }
}

impl ExceptionHandler for ExceptionHub {
  fn handle(&self, err: &Error) {
    self.count.fetch_add(1, Ordering::AcqRel);
    error!(error = %err, "unhandled exception");
    if let Err(listener) = self.source.publish(err.clone()) {
      // Never loop back into the hub from its own listeners.
      warn!(error = %listener, "exception listener failed");
    }
  }
}
