use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
  cancel::{CancellationScope, Registration},
  error::Result,
  event::{AsyncObservable, Observable, Payload},
  subscription::{Disposable, Registry},
};

type Tracked = Box<dyn Disposable + Send + Sync>;

struct Inner {
  scope: CancellationScope,
  tracked: Mutex<Registry<Tracked>>,
  on_scope_end: Mutex<Option<Registration>>,
}

impl Inner {
  fn dispose_all(&self) {
    let drained: Vec<Tracked> = self.tracked.lock().drain().collect();
    if !drained.is_empty() {
      debug!(observers = drained.len(), "detaching tracked observers");
    }
    for tracked in drained {
      tracked.dispose();
    }
  }
}

/// Registers callbacks on behalf of an owner and detaches them all when the
/// owner's scope is cancelled.
///
/// Observations can additionally be bound to a scope of their own with the
/// `*_until` variants; whichever ends first detaches them.
#[derive(Clone)]
pub struct EventObserver {
  inner: Arc<Inner>,
}

impl EventObserver {
  pub fn new(scope: CancellationScope) -> Self {
    let inner = Arc::new(Inner {
      scope: scope.clone(),
      tracked: Mutex::new(Registry::new()),
      on_scope_end: Mutex::new(None),
    });
    let weak = Arc::downgrade(&inner);
    let registration = scope.on_cancel(move || {
      if let Some(inner) = weak.upgrade() {
        inner.dispose_all();
      }
    });
    *inner.on_scope_end.lock() = Some(registration);
    EventObserver { inner }
  }

  /// Track `handle`; it is disposed with the owner's scope. A handle bound
  /// after the scope ended is disposed immediately.
  pub fn bind(&self, handle: impl Disposable + Send + Sync + 'static) {
    let mut tracked = self.inner.tracked.lock();
    if self.inner.scope.is_cancelled() {
      drop(tracked);
      handle.dispose();
      return;
    }
    tracked.purge_disposed();
    tracked.add(Box::new(handle));
  }

  pub fn observe<T: Payload>(
    &self,
    observable: &Observable<T>,
    f: impl Fn(T) + Send + Sync + 'static,
  ) {
    self.bind(observable.observe().on_each(move |v| f(v.clone())));
  }

  pub fn try_observe<T: Payload>(
    &self,
    observable: &Observable<T>,
    f: impl Fn(&T) -> Result<()> + Send + Sync + 'static,
  ) {
    self.bind(observable.observe().try_on_each(f));
  }

  /// Like [`observe`](Self::observe), also detached once `until` is
  /// cancelled.
  pub fn observe_until<T: Payload>(
    &self,
    observable: &Observable<T>,
    until: &CancellationScope,
    f: impl Fn(T) + Send + Sync + 'static,
  ) {
    self.bind(observable.observe().on(until).on_each(move |v| f(v.clone())));
  }

  pub fn observe_async<T, F, Fut>(&self, observable: &AsyncObservable<T>, f: F)
  where
    T: Payload,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self.bind(observable.observe().try_on_each_async(f));
  }

  /// Number of live tracked observations.
  pub fn len(&self) -> usize {
    let mut tracked = self.inner.tracked.lock();
    tracked.purge_disposed();
    tracked.len()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Detach everything tracked so far; the collaborator stays usable.
  pub fn dispose_all(&self) { self.inner.dispose_all() }
}
