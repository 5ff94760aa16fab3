use std::{
  future::Future,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use futures::{
  future::{self, BoxFuture},
  FutureExt,
};
use smallvec::SmallVec;
use tracing::debug;

use super::{Dispatcher, DispatcherExt, ErrorCallback};
use crate::{
  cancel::CancellationScope,
  error::{Error, Result},
  exception::SharedHandler,
  subscription::Disposable,
  transaction::{Lease, Transaction},
};

type Leases = SmallVec<[Lease; 2]>;

/// A dispatcher bound to the lifetime of an owning scope.
///
/// Every call receives its own cancellation scope, cancelled as soon as the
/// owner's scope or any extra scope given with the call is cancelled. The
/// call holds a lease on the owner's [`Transaction`] (and on the
/// transactions of the owner's ancestors) until it returns, so
/// [`shutdown`](Self::shutdown) can wait until nothing is in flight.
///
/// Cancellation is cooperative: running work is never interrupted, it only
/// observes its scope. Calls made after the owner's scope was cancelled
/// fail with [`Error::Cancelled`] without running; calls made after
/// [`dispose`](Disposable::dispose) fail with [`Error::Disposed`].
pub struct ScopedDispatcher {
  inner: Arc<dyn Dispatcher>,
  scope: CancellationScope,
  transactions: SmallVec<[Transaction; 2]>,
  disposed: AtomicBool,
}

impl ScopedDispatcher {
  pub fn new(inner: Arc<dyn Dispatcher>, scope: CancellationScope) -> Self {
    Self::with_transactions(inner, scope, SmallVec::from_elem(Transaction::new(), 1))
  }

  /// `transactions[0]` is the dispatcher's own; the rest belong to owners
  /// further up that also wait for this dispatcher's work.
  pub(crate) fn with_transactions(
    inner: Arc<dyn Dispatcher>,
    scope: CancellationScope,
    transactions: SmallVec<[Transaction; 2]>,
  ) -> Self {
    debug_assert!(!transactions.is_empty());
    ScopedDispatcher { inner, scope, transactions, disposed: AtomicBool::new(false) }
  }

  /// Scope of the owner; cancelling it cancels every call.
  pub fn scope(&self) -> &CancellationScope { &self.scope }

  pub fn transaction(&self) -> &Transaction { &self.transactions[0] }

  /// The dispatcher work actually runs on.
  pub fn inner(&self) -> &Arc<dyn Dispatcher> { &self.inner }

  /// Fire-and-forget; failures go to the exception handler.
  pub fn run(
    &self,
    action: impl FnOnce(&CancellationScope) -> Result<()> + Send + 'static,
  ) -> Result<()> {
    self.run_with(action, &[], None)
  }

  /// Fire-and-forget with extra cancellation inputs and an error callback.
  pub fn run_with(
    &self,
    action: impl FnOnce(&CancellationScope) -> Result<()> + Send + 'static,
    extra: &[&CancellationScope],
    on_error: Option<ErrorCallback>,
  ) -> Result<()> {
    let (scope, leases) = self.begin(extra)?;
    self.inner.run_with(
      move || {
        let _leases = leases;
        action(&scope)
      },
      on_error,
    )
  }

  pub fn run_async<R, F>(&self, func: F) -> BoxFuture<'static, Result<R>>
  where
    R: Send + 'static,
    F: FnOnce(&CancellationScope) -> Result<R> + Send + 'static,
  {
    self.run_async_with(func, &[])
  }

  pub fn run_async_with<R, F>(
    &self,
    func: F,
    extra: &[&CancellationScope],
  ) -> BoxFuture<'static, Result<R>>
  where
    R: Send + 'static,
    F: FnOnce(&CancellationScope) -> Result<R> + Send + 'static,
  {
    match self.begin(extra) {
      Ok((scope, leases)) => self.inner.run_async(move || {
        let _leases = leases;
        func(&scope)
      }),
      Err(err) => future::ready(Err(err)).boxed(),
    }
  }

  /// Drive the future built by `f` on the inner dispatcher. The lease is
  /// held until the future completes.
  pub fn run_future<R, F, Fut>(
    &self,
    f: F,
    extra: &[&CancellationScope],
  ) -> BoxFuture<'static, Result<R>>
  where
    R: Send + 'static,
    F: FnOnce(CancellationScope) -> Fut,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    match self.begin(extra) {
      Ok((scope, leases)) => {
        let fut = f(scope);
        self.inner.run_future(async move {
          let _leases = leases;
          fut.await
        })
      }
      Err(err) => future::ready(Err(err)).boxed(),
    }
  }

  /// Cancel the owner's scope, then wait until every call has returned.
  pub async fn shutdown(&self) {
    self.scope.cancel();
    let leases = self.transaction().lease_count();
    if leases > 0 {
      debug!(leases, "scoped dispatcher waiting for in-flight work");
    }
    self.transaction().closed().await;
  }

  fn begin(&self, extra: &[&CancellationScope]) -> Result<(CancellationScope, Leases)> {
    if self.disposed.load(Ordering::Acquire) {
      return Err(Error::Disposed);
    }
    self.scope.check()?;
    if self.inner.is_disposed() {
      return Err(Error::Disposed);
    }
    let mut parents: SmallVec<[&CancellationScope; 4]> = SmallVec::new();
    parents.push(&self.scope);
    parents.extend_from_slice(extra);
    let scope = CancellationScope::linked(&parents);
    let leases = self.transactions.iter().map(Transaction::start).collect();
    Ok((scope, leases))
  }
}

impl Dispatcher for ScopedDispatcher {
  fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()> {
    let (_, leases) = self.begin(&[])?;
    self.inner.spawn(
      async move {
        let _leases = leases;
        task.await
      }
      .boxed(),
    )
  }

  #[inline]
  fn is_current(&self) -> bool { self.inner.is_current() }

  #[inline]
  fn exception_handler(&self) -> &SharedHandler { self.inner.exception_handler() }
}

impl Disposable for ScopedDispatcher {
  /// Refuse further calls and cancel the owner's scope. The inner dispatcher
  /// is left running.
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      debug!("scoped dispatcher disposed");
    }
    self.scope.cancel();
  }

  fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire) || self.inner.is_disposed()
  }
}
