//! Lifetime scopes: the owner side of cancellation, dispatch and
//! observation.
//!
//! A [`LifetimeScope`] bundles what an owner such as a view-model needs for
//! its lifetime:
//!
//! - a [`CancellationScope`], cancelled when the owner ends;
//! - a [`Transaction`] counting calls in flight on its dispatchers;
//! - a background dispatcher (thread pool) and a main dispatcher (one
//!   dedicated thread shared by the whole tree), both scoped;
//! - an [`EventObserver`] detaching tracked observations at the end.
//!
//! Child scopes cancel with their parent, and a parent waits for its
//! children's calls as well as its own before its teardown completes.
//! Disposing a child leaves its parent and siblings alone.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::future::{self, Either};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{
  cancel::{CancellationScope, Registration},
  collab::{ActionBuffer, EventObserver},
  config::Config,
  dispatcher::{DedicatedThreadDispatcher, Dispatcher, ScopedDispatcher, ThreadPoolDispatcher},
  error::{Error, Result},
  exception::SharedHandler,
  subscription::Disposable,
  transaction::Transaction,
};

/// Something with an end that others can attach to.
pub trait Lifetime {
  /// Run `f` when the lifetime ends, immediately if it already has.
  /// Dropping the registration detaches `f`.
  fn on_end(&self, f: Box<dyn FnOnce() + Send>) -> Registration;

  fn has_ended(&self) -> bool;
}

impl Lifetime for CancellationScope {
  fn on_end(&self, f: Box<dyn FnOnce() + Send>) -> Registration { self.on_cancel(f) }

  #[inline]
  fn has_ended(&self) -> bool { self.is_cancelled() }
}

impl Lifetime for LifetimeScope {
  fn on_end(&self, f: Box<dyn FnOnce() + Send>) -> Registration { self.inner.cancel.on_cancel(f) }

  #[inline]
  fn has_ended(&self) -> bool { self.inner.cancel.is_cancelled() }
}

/// Execution contexts shared by every scope of one tree.
struct Runtime {
  cfg: Config,
  handler: SharedHandler,
  pool: Arc<dyn Dispatcher>,
  main: Arc<DedicatedThreadDispatcher>,
}

struct ScopeCore {
  name: String,
  runtime: Arc<Runtime>,
  is_root: bool,
  cancel: CancellationScope,
  /// Own transaction first, then every ancestor's.
  transactions: SmallVec<[Transaction; 2]>,
  background: Arc<ScopedDispatcher>,
  main: Arc<ScopedDispatcher>,
  observers: EventObserver,
  disposed: AtomicBool,
}

#[derive(Clone)]
pub struct LifetimeScope {
  inner: Arc<ScopeCore>,
}

impl LifetimeScope {
  /// A root scope with its own worker pool and main thread, both sized and
  /// named by `cfg`.
  pub fn root(cfg: Config, handler: SharedHandler) -> Result<Self> {
    let pool: Arc<dyn Dispatcher> =
      Arc::new(ThreadPoolDispatcher::from_config(&cfg, handler.clone())?);
    let main = Arc::new(DedicatedThreadDispatcher::from_config(&cfg, handler.clone())?);
    let runtime = Arc::new(Runtime { cfg, handler, pool, main });
    let transactions = SmallVec::from_elem(Transaction::new(), 1);
    Ok(Self::build("root".to_string(), runtime, true, CancellationScope::new(), transactions))
  }

  /// A nested scope. It ends with this one, but may end earlier on its own.
  pub fn child(&self, name: impl Into<String>) -> Self {
    let mut transactions = SmallVec::with_capacity(self.inner.transactions.len() + 1);
    transactions.push(Transaction::new());
    transactions.extend(self.inner.transactions.iter().cloned());
    Self::build(
      name.into(),
      self.inner.runtime.clone(),
      false,
      self.inner.cancel.child(),
      transactions,
    )
  }

  fn build(
    name: String,
    runtime: Arc<Runtime>,
    is_root: bool,
    cancel: CancellationScope,
    transactions: SmallVec<[Transaction; 2]>,
  ) -> Self {
    let background = ScopedDispatcher::with_transactions(
      runtime.pool.clone(),
      cancel.clone(),
      transactions.clone(),
    );
    let main_thread: Arc<dyn Dispatcher> = runtime.main.clone();
    let main =
      ScopedDispatcher::with_transactions(main_thread, cancel.clone(), transactions.clone());
    debug!(scope = %name, depth = transactions.len(), "lifetime scope created");
    LifetimeScope {
      inner: Arc::new(ScopeCore {
        name,
        runtime,
        is_root,
        observers: EventObserver::new(cancel.clone()),
        cancel,
        transactions,
        background: Arc::new(background),
        main: Arc::new(main),
        disposed: AtomicBool::new(false),
      }),
    }
  }

  pub fn name(&self) -> &str { &self.inner.name }

  pub fn cancellation(&self) -> &CancellationScope { &self.inner.cancel }

  pub fn transaction(&self) -> &Transaction { &self.inner.transactions[0] }

  /// Thread-pool work tied to this scope.
  pub fn background(&self) -> &Arc<ScopedDispatcher> { &self.inner.background }

  /// Work on the tree's main thread, tied to this scope.
  pub fn main(&self) -> &Arc<ScopedDispatcher> { &self.inner.main }

  pub fn observers(&self) -> &EventObserver { &self.inner.observers }

  /// Keyed debounce on the main thread, dropped with this scope. `post`
  /// waits the configured [`Config::debounce`].
  pub fn action_buffer<K: PartialEq + Clone + Send + 'static>(&self) -> ActionBuffer<K> {
    let main: Arc<dyn Dispatcher> = self.inner.main.clone();
    ActionBuffer::with_delay(main, self.inner.cancel.clone(), self.inner.runtime.cfg.debounce)
  }

  pub fn exception_handler(&self) -> &SharedHandler { &self.inner.runtime.handler }

  pub fn config(&self) -> &Config { &self.inner.runtime.cfg }

  pub fn is_disposed(&self) -> bool { self.inner.disposed.load(Ordering::Acquire) }

  /// End the scope and block until every call made through its dispatchers
  /// (and its children's) has returned, or until the configured grace
  /// period ran out.
  ///
  /// Called from the main thread, the wait is skipped: work queued behind
  /// the caller could never finish while it blocks.
  pub fn dispose(&self) -> Result<()> {
    if !self.begin_dispose() {
      return Ok(());
    }
    let quiesced = if self.inner.runtime.main.is_current() {
      warn!(scope = %self.inner.name, "disposed from the main thread, not waiting for work");
      !self.transaction().is_open()
    } else {
      self.transaction().wait_closed(self.inner.runtime.cfg.shutdown_grace)
    };
    self.finish_dispose(quiesced)
  }

  /// [`dispose`](Self::dispose) for async callers.
  pub async fn dispose_async(&self) -> Result<()> {
    if !self.begin_dispose() {
      return Ok(());
    }
    let quiesced = self.wait_closed().await;
    self.finish_dispose(quiesced)
  }

  fn begin_dispose(&self) -> bool {
    if self.inner.disposed.swap(true, Ordering::AcqRel) {
      return false;
    }
    let in_flight = self.transaction().lease_count();
    debug!(scope = %self.inner.name, in_flight, "disposing lifetime scope");
    self.inner.cancel.cancel();
    self.inner.observers.dispose_all();
    true
  }

  async fn wait_closed(&self) -> bool {
    let grace: Duration = self.inner.runtime.cfg.shutdown_grace;
    let timeout = Box::pin(futures_time::task::sleep(grace.into()));
    matches!(future::select(self.transaction().closed(), timeout).await, Either::Left(_))
  }

  fn finish_dispose(&self, quiesced: bool) -> Result<()> {
    if self.inner.is_root {
      self.inner.runtime.pool.dispose();
      self.inner.runtime.main.dispose();
    }
    if quiesced {
      debug!(scope = %self.inner.name, "lifetime scope disposed");
      Ok(())
    } else {
      let leases = self.transaction().lease_count();
      warn!(scope = %self.inner.name, leases, "lifetime scope disposed with work still in flight");
      Err(Error::msg(format!("scope {:?} still had {leases} call(s) in flight", self.inner.name)))
    }
  }
}

impl Drop for ScopeCore {
  fn drop(&mut self) { self.cancel.cancel() }
}

impl std::fmt::Debug for LifetimeScope {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LifetimeScope")
      .field("name", &self.inner.name)
      .field("cancelled", &self.inner.cancel.is_cancelled())
      .field("in_flight", &self.transaction().lease_count())
      .finish()
  }
}
