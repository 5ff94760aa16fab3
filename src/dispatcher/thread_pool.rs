use std::sync::atomic::{AtomicBool, Ordering};

use futures::{executor::ThreadPool, future::BoxFuture, task::SpawnExt};
use tracing::debug;

use super::{build_pool, catch_panics, default_pool, Dispatcher};
use crate::{
  config::Config,
  error::{Error, Result},
  exception::SharedHandler,
  subscription::Disposable,
};

/// Runs work on a `futures` thread pool. Submissions execute concurrently
/// and in no particular order.
pub struct ThreadPoolDispatcher {
  pool: ThreadPool,
  handler: SharedHandler,
  disposed: AtomicBool,
}

impl ThreadPoolDispatcher {
  /// Dispatch onto the process-wide shared pool.
  pub fn new(handler: SharedHandler) -> Result<Self> {
    Ok(Self::with_pool(default_pool()?.clone(), handler))
  }

  /// Dispatch onto a pool of its own, sized by `cfg`.
  pub fn from_config(cfg: &Config, handler: SharedHandler) -> Result<Self> {
    Ok(Self::with_pool(build_pool(cfg)?, handler))
  }

  pub fn with_pool(pool: ThreadPool, handler: SharedHandler) -> Self {
    ThreadPoolDispatcher { pool, handler, disposed: AtomicBool::new(false) }
  }
}

impl Dispatcher for ThreadPoolDispatcher {
  fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()> {
    if self.is_disposed() {
      return Err(Error::Disposed);
    }
    self
      .pool
      .spawn(catch_panics(task, self.handler.clone()))
      .map_err(|e| Error::msg(format!("thread pool refused task: {e}")))
  }

  #[inline]
  fn exception_handler(&self) -> &SharedHandler { &self.handler }
}

impl Disposable for ThreadPoolDispatcher {
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      debug!("thread pool dispatcher disposed");
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}
