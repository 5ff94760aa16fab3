//! Dispatchers run submitted work on a specific execution context.
//!
//! Every dispatcher moves through `Running -> Disposed`; once disposed,
//! every submission fails with [`Error::Disposed`]. Failures of
//! fire-and-forget work (including panics) never escape: they are offered
//! to the caller's error callback and otherwise to the dispatcher's
//! [`ExceptionHandler`](crate::exception::ExceptionHandler).
//!
//! - [`ThreadPoolDispatcher`]: the shared worker pool, no ordering.
//! - [`DedicatedThreadDispatcher`]: one FIFO worker thread, reentrant.
//! - [`ScopedDispatcher`]: wraps either of the above and threads a
//!   cancellation scope and a transaction lease through every call.
//! - `TokioDispatcher` (feature `tokio-scheduler`): a tokio runtime handle.

use std::{
  future::Future,
  panic::{self, AssertUnwindSafe},
  sync::{mpsc, Arc},
  time::Duration,
};

use futures::{
  channel::oneshot,
  executor::ThreadPool,
  future::{self, BoxFuture, Either},
  FutureExt,
};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::{
  cancel::CancellationScope,
  config::Config,
  error::{Caught, Error, Result},
  exception::SharedHandler,
  subscription::Disposable,
};

mod dedicated;
mod scoped;
mod thread_pool;
#[cfg(feature = "tokio-scheduler")]
mod tokio_runtime;

pub use dedicated::DedicatedThreadDispatcher;
pub use scoped::ScopedDispatcher;
pub use thread_pool::ThreadPoolDispatcher;
#[cfg(feature = "tokio-scheduler")]
pub use tokio_runtime::TokioDispatcher;

/// Error callback for fire-and-forget work. The failure arrives marked
/// handled; clearing the flag forwards it to the exception handler.
pub type ErrorCallback = Arc<dyn Fn(&mut Caught) + Send + Sync>;

pub trait Dispatcher: Disposable + Send + Sync {
  /// Queue `task`. Fails with [`Error::Disposed`] once disposed.
  fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()>;

  /// `true` when called from the execution context this dispatcher runs
  /// work on. Only meaningful for single-threaded dispatchers.
  fn is_current(&self) -> bool { false }

  fn exception_handler(&self) -> &SharedHandler;
}

/// Submission helpers available on every dispatcher.
pub trait DispatcherExt: Dispatcher {
  /// Fire-and-forget; failures go to the exception handler.
  fn run(&self, action: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
    self.run_with(action, None)
  }

  /// Fire-and-forget with an error callback.
  fn run_with(
    &self,
    action: impl FnOnce() -> Result<()> + Send + 'static,
    on_error: Option<ErrorCallback>,
  ) -> Result<()> {
    let handler = self.exception_handler().clone();
    self.spawn(shielded(future::lazy(move |_| action()), on_error, handler))
  }

  /// Run `func` and hand its result back through the returned future.
  ///
  /// On a dispatcher that is already executing the caller, `func` runs
  /// inline before this returns.
  fn run_async<R, F>(&self, func: F) -> BoxFuture<'static, Result<R>>
  where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
  {
    if self.is_disposed() {
      return future::ready(Err(Error::Disposed)).boxed();
    }
    if self.is_current() {
      return future::ready(func()).boxed();
    }
    self.run_future(future::lazy(move |_| func()))
  }

  /// Drive `fut` on this dispatcher and hand its output back.
  fn run_future<R, F>(&self, fut: F) -> BoxFuture<'static, Result<R>>
  where
    R: Send + 'static,
    F: Future<Output = Result<R>> + Send + 'static,
  {
    if self.is_disposed() {
      return future::ready(Err(Error::Disposed)).boxed();
    }
    if self.is_current() {
      return fut.boxed();
    }
    let (tx, rx) = oneshot::channel();
    let task = AssertUnwindSafe(fut).catch_unwind().map(move |outcome| {
      let _ = tx.send(outcome.unwrap_or_else(|payload| Err(Error::from_panic(payload))));
    });
    match self.spawn(task.boxed()) {
      // A dropped sender means the queue was torn down before the task ran.
      Ok(()) => rx.map(|received| received.unwrap_or(Err(Error::Disposed))).boxed(),
      Err(err) => future::ready(Err(err)).boxed(),
    }
  }

  /// Run `func` and block the calling thread until it finished.
  ///
  /// Runs `func` inline when [`is_current`](Dispatcher::is_current) says the
  /// caller already is on this dispatcher, which only single-threaded
  /// dispatchers detect. Calling it from work running on the same thread
  /// pool blocks a worker and deadlocks once every worker waits this way;
  /// use [`run_async`](Self::run_async) there.
  fn invoke<R, F>(&self, func: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
  {
    if self.is_disposed() {
      return Err(Error::Disposed);
    }
    if self.is_current() {
      return func();
    }
    let (tx, rx) = mpsc::sync_channel(1);
    let task = future::lazy(move |_| {
      let outcome = panic::catch_unwind(AssertUnwindSafe(func));
      let _ = tx.send(outcome.unwrap_or_else(|payload| Err(Error::from_panic(payload))));
    });
    self.spawn(task.boxed())?;
    rx.recv().unwrap_or(Err(Error::Disposed))
  }
}

impl<D: Dispatcher + ?Sized> DispatcherExt for D {}

/// Offer `err` to `on_error`, then to `handler` unless it was handled.
/// Cancellation is not a failure and is only logged.
pub(crate) fn report(err: Error, on_error: Option<&ErrorCallback>, handler: &SharedHandler) {
  if err.is_cancelled() {
    debug!("dispatched work observed cancellation");
    return;
  }
  let err = match on_error {
    Some(on_error) => {
      let mut caught = Caught::new(err, true);
      on_error(&mut caught);
      if caught.handled {
        return;
      }
      caught.into_error()
    }
    None => err,
  };
  handler.handle(&err);
}

/// Wrap fallible fire-and-forget work so neither its error nor a panic can
/// escape the worker.
pub(crate) fn shielded(
  task: impl Future<Output = Result<()>> + Send + 'static,
  on_error: Option<ErrorCallback>,
  handler: SharedHandler,
) -> BoxFuture<'static, ()> {
  AssertUnwindSafe(task)
    .catch_unwind()
    .map(move |outcome| {
      let result = outcome.unwrap_or_else(|payload| Err(Error::from_panic(payload)));
      if let Err(err) = result {
        report(err, on_error.as_ref(), &handler);
      }
    })
    .boxed()
}

/// Guard raw spawned futures against panics.
pub(crate) fn catch_panics(
  task: BoxFuture<'static, ()>,
  handler: SharedHandler,
) -> impl Future<Output = ()> + Send + 'static {
  AssertUnwindSafe(task).catch_unwind().map(move |outcome| {
    if let Err(payload) = outcome {
      handler.handle(&Error::from_panic(payload));
    }
  })
}

static DEFAULT_POOL: Lazy<std::result::Result<ThreadPool, String>> = Lazy::new(|| {
  let cfg = Config::from_env().unwrap_or_default();
  build_pool(&cfg).map_err(|e| e.to_string())
});

pub(crate) fn build_pool(cfg: &Config) -> std::io::Result<ThreadPool> {
  ThreadPool::builder()
    .pool_size(cfg.effective_pool_size())
    .name_prefix(cfg.pool_name_prefix.clone())
    .create()
}

/// The process-wide worker pool, created on first use.
pub(crate) fn default_pool() -> Result<&'static ThreadPool> {
  DEFAULT_POOL.as_ref().map_err(|e| Error::msg(e.clone()))
}

/// Wait `delay` unless `scope` is cancelled first. Resolves to `true` when
/// the full delay elapsed.
pub(crate) async fn delay_unless_cancelled(delay: Duration, scope: &CancellationScope) -> bool {
  let sleep = Box::pin(futures_time::task::sleep(delay.into()));
  match future::select(sleep, scope.cancelled()).await {
    Either::Left(_) => !scope.is_cancelled(),
    Either::Right(_) => false,
  }
}
