//! Disposal handles.
//!
//! Everything that can be detached (source registrations, observer chains,
//! tracked observations) implements [`Disposable`]. Disposal is always
//! idempotent.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc, Weak,
};

mod registry;
pub use registry::Registry;

pub trait Disposable {
  /// Detach. Calling this more than once is a no-op.
  fn dispose(&self);

  fn is_disposed(&self) -> bool;
}

impl<T: Disposable + ?Sized> Disposable for Box<T> {
  #[inline]
  fn dispose(&self) { (**self).dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { (**self).is_disposed() }
}

impl<T: Disposable + ?Sized> Disposable for Arc<T> {
  #[inline]
  fn dispose(&self) { (**self).dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { (**self).is_disposed() }
}

/// Something holding registrations addressable by id.
pub(crate) trait Unregister: Send + Sync {
  fn unregister(&self, id: usize);
}

/// Handle to a single callback registered on an event source.
///
/// Dropping the handle does not unregister; call [`Disposable::dispose`] or
/// wrap it with [`DisposeGuard`].
pub struct Subscription {
  target: Weak<dyn Unregister>,
  id: usize,
  disposed: AtomicBool,
}

impl Subscription {
  pub(crate) fn new(target: Weak<dyn Unregister>, id: usize) -> Self {
    Subscription { target, id, disposed: AtomicBool::new(false) }
  }

  /// A handle that is already disposed, returned when registering on a source
  /// that no longer accepts callbacks.
  pub(crate) fn closed() -> Self {
    let target: Weak<dyn Unregister> = Weak::<Closed>::new();
    Subscription { target, id: usize::MAX, disposed: AtomicBool::new(true) }
  }
}

struct Closed;

impl Unregister for Closed {
  fn unregister(&self, _: usize) {}
}

impl Disposable for Subscription {
  fn dispose(&self) {
    if !self.disposed.swap(true, Ordering::AcqRel) {
      if let Some(target) = self.target.upgrade() {
        target.unregister(self.id);
      }
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire) || self.target.strong_count() == 0
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("disposed", &self.is_disposed())
      .finish()
  }
}

/// An RAII implementation of a "scoped" registration: when this structure is
/// dropped (falls out of scope), the wrapped handle is disposed.
///
/// If you want to drop it immediately, wrap it in its own scope.
#[derive(Debug)]
#[must_use]
pub struct DisposeGuard<T: Disposable>(pub(crate) T);

impl<T: Disposable> DisposeGuard<T> {
  pub fn new(handle: T) -> DisposeGuard<T> { DisposeGuard(handle) }
}

impl<T: Disposable> std::ops::Deref for DisposeGuard<T> {
  type Target = T;

  fn deref(&self) -> &T { &self.0 }
}

impl<T: Disposable> Drop for DisposeGuard<T> {
  #[inline]
  fn drop(&mut self) { self.0.dispose() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[derive(Default)]
  struct Recorder(Mutex<Vec<usize>>);

  impl Unregister for Recorder {
    fn unregister(&self, id: usize) { self.0.lock().push(id); }
  }

  #[test]
  fn dispose_is_idempotent() {
    let recorder = Arc::new(Recorder::default());
    let weak: Weak<dyn Unregister> = Arc::downgrade(&(recorder.clone() as Arc<dyn Unregister>));
    let sub = Subscription::new(weak, 7);
    assert!(!sub.is_disposed());
    sub.dispose();
    sub.dispose();
    assert!(sub.is_disposed());
    assert_eq!(*recorder.0.lock(), vec![7]);
  }

  #[test]
  fn guard_disposes_on_drop() {
    let recorder = Arc::new(Recorder::default());
    let weak: Weak<dyn Unregister> = Arc::downgrade(&(recorder.clone() as Arc<dyn Unregister>));
    let kept = Subscription::new(weak.clone(), 2);
    {
      let guard = DisposeGuard::new(Subscription::new(weak, 1));
      assert!(!guard.is_disposed());
    }
    assert_eq!(*recorder.0.lock(), vec![1]);
    assert!(!kept.is_disposed());
  }

  #[test]
  fn closed_handle_starts_disposed() {
    let sub = Subscription::closed();
    assert!(sub.is_disposed());
    sub.dispose();
  }
}
