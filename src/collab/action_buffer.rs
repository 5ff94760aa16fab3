use std::{
  future::Future,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
  },
  time::Duration,
};

use futures::{
  future::{self, BoxFuture},
  task::SpawnExt,
  FutureExt,
};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{
  cancel::{CancellationScope, Registration},
  config::Config,
  dispatcher::{default_pool, delay_unless_cancelled, shielded, Dispatcher},
  error::{Error, Result},
};

type Job = BoxFuture<'static, Result<()>>;

struct Pending<K> {
  key: K,
  generation: u64,
  job: Job,
  /// Cancelled when the entry is replaced, fired early or removed.
  timer: CancellationScope,
}

struct BufferInner<K> {
  dispatcher: Arc<dyn Dispatcher>,
  scope: CancellationScope,
  delay: Duration,
  pending: Mutex<Vec<Pending<K>>>,
  generation: AtomicU64,
  on_scope_end: Mutex<Option<Registration>>,
}

/// Keyed debounce of actions.
///
/// Submitting under a key that is already pending replaces the pending
/// action and restarts its delay, keeping the key's position in the queue;
/// [`flush`](Self::flush) therefore runs actions in first-submission order.
/// Actions run on the buffer's dispatcher. Cancelling the owning scope drops
/// everything still pending. [`post`](Self::post) uses the buffer's default
/// delay, [`Config::debounce`](crate::config::Config::debounce) unless set
/// with [`with_delay`](Self::with_delay).
///
/// ```rust
/// use std::{sync::Arc, time::Duration};
/// use mvvm_rx::prelude::*;
///
/// let dispatcher: Arc<dyn Dispatcher> =
///   Arc::new(ThreadPoolDispatcher::new(Arc::new(LogExceptionHandler)).unwrap());
/// let buffer = ActionBuffer::new(dispatcher, CancellationScope::new());
/// buffer.submit("save", Duration::from_secs(60), || Ok(())).unwrap();
/// buffer.submit("load", Duration::from_secs(60), || Ok(())).unwrap();
/// buffer.submit("save", Duration::from_secs(60), || Ok(())).unwrap();
/// assert_eq!(buffer.pending_keys(), vec!["save", "load"]);
/// ```
pub struct ActionBuffer<K> {
  inner: Arc<BufferInner<K>>,
}

impl<K> Clone for ActionBuffer<K> {
  fn clone(&self) -> Self { ActionBuffer { inner: self.inner.clone() } }
}

impl<K: PartialEq + Clone + Send + 'static> ActionBuffer<K> {
  pub fn new(dispatcher: Arc<dyn Dispatcher>, scope: CancellationScope) -> Self {
    Self::with_delay(dispatcher, scope, Config::default().debounce)
  }

  pub fn with_delay(
    dispatcher: Arc<dyn Dispatcher>,
    scope: CancellationScope,
    delay: Duration,
  ) -> Self {
    let inner = Arc::new(BufferInner {
      dispatcher,
      scope: scope.clone(),
      delay,
      pending: Mutex::new(Vec::new()),
      generation: AtomicU64::new(0),
      on_scope_end: Mutex::new(None),
    });
    let weak = Arc::downgrade(&inner);
    let registration = scope.on_cancel(move || {
      if let Some(inner) = weak.upgrade() {
        inner.clear();
      }
    });
    *inner.on_scope_end.lock() = Some(registration);
    ActionBuffer { inner }
  }

  /// The delay [`post`](Self::post) waits.
  pub fn delay(&self) -> Duration { self.inner.delay }

  /// [`submit`](Self::submit) with the buffer's default delay.
  pub fn post(&self, key: K, action: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
    self.submit(key, self.inner.delay, action)
  }

  /// Schedule `action` to run `delay` after the last submission for `key`.
  pub fn submit(
    &self,
    key: K,
    delay: Duration,
    action: impl FnOnce() -> Result<()> + Send + 'static,
  ) -> Result<()> {
    self.submit_async(key, delay, future::lazy(move |_| action()))
  }

  /// [`submit`](Self::submit) for asynchronous actions.
  pub fn submit_async(
    &self,
    key: K,
    delay: Duration,
    action: impl Future<Output = Result<()>> + Send + 'static,
  ) -> Result<()> {
    let inner = &self.inner;
    inner.scope.check()?;
    if inner.dispatcher.is_disposed() {
      return Err(Error::Disposed);
    }
    let generation = inner.generation.fetch_add(1, Ordering::AcqRel);
    let timer = inner.scope.child();
    let replaced = {
      let mut pending = inner.pending.lock();
      let entry =
        Pending { key: key.clone(), generation, job: action.boxed(), timer: timer.clone() };
      match pending.iter_mut().find(|p| p.key == key) {
        Some(slot) => Some(std::mem::replace(slot, entry)),
        None => {
          pending.push(entry);
          None
        }
      }
    };
    if let Some(old) = replaced {
      trace!("debounced action replaced");
      old.timer.cancel();
    }

    let weak: Weak<BufferInner<K>> = Arc::downgrade(inner);
    default_pool()?
      .spawn(async move {
        if delay_unless_cancelled(delay, &timer).await {
          if let Some(inner) = weak.upgrade() {
            inner.fire(&key, generation);
          }
        }
      })
      .map_err(|e| Error::msg(format!("unable to start debounce timer: {e}")))
  }

  /// Run every pending action now, in queue order.
  pub fn flush(&self) -> Result<()> {
    let drained = std::mem::take(&mut *self.inner.pending.lock());
    let mut first = None;
    for entry in drained {
      entry.timer.cancel();
      if let Err(err) = self.inner.dispatch(entry.job) {
        first.get_or_insert(err);
      }
    }
    first.map_or(Ok(()), Err)
  }

  /// Drop the pending action for `key`. Returns whether one was pending.
  pub fn cancel(&self, key: &K) -> bool {
    let removed = {
      let mut pending = self.inner.pending.lock();
      pending.iter().position(|p| p.key == *key).map(|at| pending.remove(at))
    };
    match removed {
      Some(entry) => {
        entry.timer.cancel();
        true
      }
      None => false,
    }
  }

  /// Drop every pending action.
  pub fn clear(&self) { self.inner.clear() }

  pub fn pending_keys(&self) -> Vec<K> {
    self.inner.pending.lock().iter().map(|p| p.key.clone()).collect()
  }

  pub fn len(&self) -> usize { self.inner.pending.lock().len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: PartialEq> BufferInner<K> {
  /// Dispatch the entry for `key` unless it was replaced since `generation`
  /// was scheduled.
  fn fire(&self, key: &K, generation: u64) {
    let due = {
      let mut pending = self.pending.lock();
      pending
        .iter()
        .position(|p| p.key == *key && p.generation == generation)
        .map(|at| pending.remove(at))
    };
    if let Some(entry) = due {
      if let Err(err) = self.dispatch(entry.job) {
        warn!(error = %err, "debounced action could not be dispatched");
      }
    }
  }

  fn dispatch(&self, job: Job) -> Result<()> {
    let handler = self.dispatcher.exception_handler().clone();
    self.dispatcher.spawn(shielded(job, None, handler))
  }

  fn clear(&self) {
    let drained = std::mem::take(&mut *self.pending.lock());
    for entry in drained {
      entry.timer.cancel();
    }
  }
}

impl<K> Drop for BufferInner<K> {
  fn drop(&mut self) {
    for entry in self.pending.get_mut().drain(..) {
      entry.timer.cancel();
    }
  }
}
