use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::debug;

use super::{catch_panics, Dispatcher};
use crate::{
  error::{Error, Result},
  exception::SharedHandler,
  subscription::Disposable,
};

/// Runs work on a tokio runtime.
pub struct TokioDispatcher {
  handle: Handle,
  handler: SharedHandler,
  disposed: AtomicBool,
}

impl TokioDispatcher {
  pub fn new(handle: Handle, handler: SharedHandler) -> Self {
    TokioDispatcher { handle, handler, disposed: AtomicBool::new(false) }
  }

  /// Dispatch onto the runtime the caller is running in.
  pub fn current(handler: SharedHandler) -> Result<Self> {
    let handle = Handle::try_current().map_err(|e| Error::msg(e.to_string()))?;
    Ok(Self::new(handle, handler))
  }
}

impl Dispatcher for TokioDispatcher {
  fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()> {
    if self.is_disposed() {
      return Err(Error::Disposed);
    }
    self.handle.spawn(catch_panics(task, self.handler.clone()));
    Ok(())
  }

  #[inline]
  fn exception_handler(&self) -> &SharedHandler { &self.handler }
}

impl Disposable for TokioDispatcher {
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      debug!("tokio dispatcher disposed");
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}
