use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

pub trait RcDeref {
  type Target<'a>
  where
    Self: 'a;
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref<'a>(&'a self) -> Self::Target<'a>;
}

pub trait RcDerefMut {
  type Target<'a>
  where
    Self: 'a;
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref_mut<'a>(&'a self) -> Self::Target<'a>;
}

/// Shared, lock-protected state. Every piece of mutable state that crosses a
/// thread boundary in this crate lives behind one of these.
#[derive(Default)]
pub struct MutArc<T>(Arc<Mutex<T>>);

impl<T> MutArc<T> {
  pub fn own(t: T) -> Self { Self(Arc::new(Mutex::new(t))) }

  #[inline]
  pub fn ptr_eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }

  #[inline]
  pub fn downgrade(&self) -> WeakArc<T> { WeakArc(Arc::downgrade(&self.0)) }
}

impl<T> RcDeref for MutArc<T> {
  type Target<'a>
    = MutexGuard<'a, T>
  where
    Self: 'a;

  #[inline]
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref<'a>(&'a self) -> Self::Target<'a> { self.0.lock() }
}

impl<T> RcDerefMut for MutArc<T> {
  type Target<'a>
    = MutexGuard<'a, T>
  where
    Self: 'a;

  #[inline]
  #[allow(clippy::needless_lifetimes)]
  fn rc_deref_mut<'a>(&'a self) -> Self::Target<'a> { self.0.lock() }
}

impl<T> Clone for MutArc<T> {
  #[inline]
  fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> From<T> for MutArc<T> {
  #[inline]
  fn from(t: T) -> Self { Self::own(t) }
}

/// Non-owning counterpart of [`MutArc`].
pub struct WeakArc<T>(Weak<Mutex<T>>);

impl<T> WeakArc<T> {
  #[inline]
  pub fn upgrade(&self) -> Option<MutArc<T>> { self.0.upgrade().map(MutArc) }
}

impl<T> Clone for WeakArc<T> {
  #[inline]
  fn clone(&self) -> Self { Self(self.0.clone()) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clones_share_state() {
    let a = MutArc::own(vec![1]);
    let b = a.clone();
    b.rc_deref_mut().push(2);
    assert_eq!(*a.rc_deref(), vec![1, 2]);
    assert!(a.ptr_eq(&b));
  }

  #[test]
  fn weak_does_not_keep_alive() {
    let a = MutArc::own(1);
    let weak = a.downgrade();
    assert!(weak.upgrade().is_some());
    drop(a);
    assert!(weak.upgrade().is_none());
  }
}
