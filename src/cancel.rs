//! Cooperative cancellation scopes.
//!
//! A [`CancellationScope`] is a monotonic "still alive" flag arranged in a
//! tree. Children hold weak references to their parents and are listed in
//! each parent's child registry; cancelling a parent walks that registry and
//! cancels every child synchronously before `cancel` returns. Dropping the
//! last handle of a child only detaches it, it never cancels siblings or
//! parents.

use std::{
  future::Future,
  pin::Pin,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
  },
  task::{Context, Poll},
};

use futures::channel::oneshot;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use smallvec::SmallVec;
use tracing::trace;

use crate::{
  error::{Error, Result},
  subscription::Registry,
};

type CancelCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub struct CancellationScope {
  inner: Arc<ScopeInner>,
}

struct ScopeInner {
  cancelled: AtomicBool,
  state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
  children: Registry<Weak<ScopeInner>>,
  callbacks: Registry<CancelCallback>,
  /// Parents together with the id this scope holds in their child registry.
  parents: SmallVec<[(Weak<ScopeInner>, usize); 1]>,
}

impl Default for CancellationScope {
  fn default() -> Self { Self::new() }
}

impl CancellationScope {
  /// A fresh root scope.
  pub fn new() -> Self {
    CancellationScope {
      inner: Arc::new(ScopeInner {
        cancelled: AtomicBool::new(false),
        state: Mutex::new(ScopeState::default()),
      }),
    }
  }

  /// A scope that is cancelled from the start.
  pub fn cancelled_scope() -> Self {
    let scope = Self::new();
    scope.cancel();
    scope
  }

  /// A child scope, cancelled whenever `self` is.
  pub fn child(&self) -> Self { Self::linked(&[self]) }

  /// A scope cancelled as soon as any of `parents` is cancelled.
  ///
  /// Work running under the returned scope stays alive only while every input
  /// is alive. With no parents this is the same as [`CancellationScope::new`].
  pub fn linked(parents: &[&CancellationScope]) -> Self {
    let scope = Self::new();
    let mut born_cancelled = false;
    for parent in parents {
      match parent.inner.attach(&scope.inner) {
        Some(id) => scope.inner.state.lock().parents.push((Arc::downgrade(&parent.inner), id)),
        None => born_cancelled = true,
      }
    }
    if born_cancelled {
      scope.cancel();
    }
    scope
  }

  #[inline]
  pub fn is_cancelled(&self) -> bool { self.inner.cancelled.load(Ordering::Acquire) }

  /// `Err(Error::Cancelled)` once the scope has been cancelled.
  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Cancel this scope and every live descendant. Idempotent.
  pub fn cancel(&self) { self.inner.cancel() }

  /// Run `f` once the scope is cancelled. Runs immediately when it already
  /// is. Dropping the returned registration unregisters the callback.
  pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) -> Registration {
    let mut state = self.inner.state.lock();
    if self.is_cancelled() {
      drop(state);
      f();
      return Registration::empty();
    }
    let id = state.callbacks.add(Box::new(f));
    Registration { scope: Arc::downgrade(&self.inner), id: Some(id) }
  }

  /// Resolves once the scope is cancelled.
  pub fn cancelled(&self) -> Cancelled {
    let (tx, rx) = oneshot::channel();
    let registration = self.on_cancel(move || {
      let _ = tx.send(());
    });
    Cancelled { rx, _registration: registration }
  }

  /// Live children, for diagnostics and tests.
  pub fn child_count(&self) -> usize {
    self.inner.state.lock().children.iter().filter(|c| c.strong_count() > 0).count()
  }

  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.inner, &other.inner) }
}

impl ScopeInner {
  /// Registers `child`; `None` means `self` is already cancelled.
  fn attach(&self, child: &Arc<ScopeInner>) -> Option<usize> {
    let mut state = self.state.lock();
    if self.cancelled.load(Ordering::Acquire) {
      None
    } else {
      Some(state.children.add(Arc::downgrade(child)))
    }
  }

  fn cancel(&self) {
    let (children, callbacks) = {
      let mut state = self.state.lock();
      if self.cancelled.swap(true, Ordering::AcqRel) {
        return;
      }
      let children: SmallVec<[_; 4]> = state.children.drain().collect();
      let callbacks: SmallVec<[_; 4]> = state.callbacks.drain().collect();
      (children, callbacks)
    };
    trace!(children = children.len(), callbacks = callbacks.len(), "cancellation scope cancelled");
    for child in children.iter().filter_map(Weak::upgrade) {
      child.cancel();
    }
    for callback in callbacks {
      callback();
    }
  }
}

impl Drop for ScopeInner {
  fn drop(&mut self) {
    let parents = std::mem::take(&mut self.state.get_mut().parents);
    for (parent, id) in parents {
      if let Some(parent) = parent.upgrade() {
        parent.state.lock().children.remove(id);
      }
    }
  }
}

impl std::fmt::Debug for CancellationScope {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancellationScope").field("cancelled", &self.is_cancelled()).finish()
  }
}

/// A callback registered through [`CancellationScope::on_cancel`].
#[must_use = "dropping a Registration unregisters its callback"]
pub struct Registration {
  scope: Weak<ScopeInner>,
  id: Option<usize>,
}

impl Registration {
  pub(crate) fn empty() -> Self { Registration { scope: Weak::new(), id: None } }

  /// Keep the callback registered for the life of the scope.
  pub fn detach(mut self) { self.id = None; }
}

impl Drop for Registration {
  fn drop(&mut self) {
    if let (Some(id), Some(scope)) = (self.id.take(), self.scope.upgrade()) {
      scope.state.lock().callbacks.remove(id);
    }
  }
}

pin_project! {
  /// Future returned by [`CancellationScope::cancelled`].
  pub struct Cancelled {
    #[pin]
    rx: oneshot::Receiver<()>,
    _registration: Registration,
  }
}

impl Future for Cancelled {
  type Output = ();

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
    // The sender only disappears when the callback ran or the scope itself
    // was dropped; both mean nothing is left to wait for.
    self.project().rx.poll(cx).map(|_| ())
  }
}
