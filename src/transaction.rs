//! Reference-counted quiescence gate.
//!
//! A [`Transaction`] is open while at least one [`Lease`] is alive. The lease
//! counter is a single atomic; the `closed` callbacks fire exactly once, on
//! the first transition from one lease to zero.

use std::{
  future::Future,
  pin::Pin,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
  task::{Context, Poll},
  time::{Duration, Instant},
};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};
use pin_project_lite::pin_project;
use smallvec::SmallVec;

type ClosedCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
pub struct Transaction {
  inner: Arc<TxInner>,
}

#[derive(Default)]
struct TxInner {
  leases: AtomicUsize,
  state: Mutex<TxState>,
  idle: Condvar,
}

#[derive(Default)]
struct TxState {
  /// Set once the closed callbacks have fired.
  closed_once: bool,
  on_closed: SmallVec<[ClosedCallback; 1]>,
  /// Woken on every transition to zero, not only the first.
  waiters: Vec<oneshot::Sender<()>>,
}

impl Transaction {
  pub fn new() -> Self { Self::default() }

  /// Take a lease; the transaction stays open until it is released.
  pub fn start(&self) -> Lease {
    self.inner.leases.fetch_add(1, Ordering::AcqRel);
    Lease { inner: Some(self.inner.clone()) }
  }

  #[inline]
  pub fn is_open(&self) -> bool { self.lease_count() > 0 }

  #[inline]
  pub fn lease_count(&self) -> usize { self.inner.leases.load(Ordering::Acquire) }

  /// Register a callback for the close notification. If the transaction has
  /// already closed once, `f` runs immediately.
  pub fn on_closed(&self, f: impl FnOnce() + Send + 'static) {
    let mut state = self.inner.state.lock();
    if state.closed_once {
      drop(state);
      f();
    } else {
      state.on_closed.push(Box::new(f));
    }
  }

  /// Resolves as soon as no lease is held. Ready immediately when the
  /// transaction is not open.
  pub fn closed(&self) -> Closed {
    let (tx, rx) = oneshot::channel();
    let mut state = self.inner.state.lock();
    if self.is_open() {
      state.waiters.push(tx);
    } else {
      let _ = tx.send(());
    }
    Closed { rx }
  }

  /// Block until no lease is held or `timeout` elapsed. Returns `true` when
  /// the transaction is closed.
  ///
  /// Unlike awaiting [`closed`](Self::closed) this can be called from inside
  /// an executor.
  pub fn wait_closed(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut state = self.inner.state.lock();
    while self.is_open() {
      if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
        return !self.is_open();
      }
    }
    true
  }
}

impl TxInner {
  fn release(&self) {
    if self.leases.fetch_sub(1, Ordering::AcqRel) != 1 {
      return;
    }
    let (callbacks, waiters) = {
      let mut state = self.state.lock();
      // A new lease may have been taken between the decrement and the lock.
      let callbacks = if state.closed_once {
        SmallVec::new()
      } else {
        state.closed_once = true;
        std::mem::take(&mut state.on_closed)
      };
      let waiters = if self.leases.load(Ordering::Acquire) == 0 {
        self.idle.notify_all();
        std::mem::take(&mut state.waiters)
      } else {
        Vec::new()
      };
      (callbacks, waiters)
    };
    for callback in callbacks {
      callback();
    }
    for waiter in waiters {
      let _ = waiter.send(());
    }
  }
}

impl std::fmt::Debug for Transaction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transaction").field("leases", &self.lease_count()).finish()
  }
}

/// An opaque share in a [`Transaction`]; released on drop.
#[must_use = "dropping a Lease releases it immediately"]
pub struct Lease {
  inner: Option<Arc<TxInner>>,
}

impl Lease {
  /// Release explicitly; same as dropping.
  pub fn release(mut self) { self.release_inner() }

  fn release_inner(&mut self) {
    if let Some(inner) = self.inner.take() {
      inner.release();
    }
  }
}

impl Drop for Lease {
  fn drop(&mut self) { self.release_inner() }
}

pin_project! {
  /// Future returned by [`Transaction::closed`].
  pub struct Closed {
    #[pin]
    rx: oneshot::Receiver<()>,
  }
}

impl Future for Closed {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    self.project().rx.poll(cx).map(|_| ())
  }
}
