//! Event sources and their read-only observables.
//!
//! An [`EventSource`] is owned by whoever publishes; consumers only ever see
//! the [`Observable`] returned by [`EventSource::observable`], which can
//! register callbacks but cannot publish. The async flavour lives in
//! [`async_source`].
//!
//! Payload shapes:
//!
//! | Shape | Type |
//! |-------|------|
//! | no arguments | `EventSource<()>` |
//! | arguments only | `EventSource<A>` |
//! | sender and arguments | `EventSource<SenderArgs<S, A>>` |

use std::{
  any::Any,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;

use crate::{exception::SharedHandler, subscription::{Registry, Unregister}};

pub mod async_source;
mod narrow;
mod source;

pub use async_source::{AsyncEventSource, AsyncObservable};
pub use narrow::Narrow;
pub use source::{EventSource, Observable};

/// Anything that can travel through a source or an observer chain.
pub trait Payload: Clone + Send + 'static {}

impl<T: Clone + Send + 'static> Payload for T {}

/// Payload of an open event hierarchy; narrowed with `Arc::downcast`.
pub type AnyArgs = Arc<dyn Any + Send + Sync>;

/// Payload of events that carry their sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderArgs<S, A> {
  pub sender: S,
  pub args: A,
}

impl<S, A> SenderArgs<S, A> {
  pub fn new(sender: S, args: A) -> Self { SenderArgs { sender, args } }
}

/// Registration list shared by the sync and async sources.
pub(crate) struct SourceCore<C> {
  callbacks: Mutex<Registry<C>>,
  closed: AtomicBool,
  handler: Option<SharedHandler>,
}

impl<C: Clone> SourceCore<C> {
  pub(crate) fn new(handler: Option<SharedHandler>) -> Self {
    SourceCore { callbacks: Mutex::new(Registry::new()), closed: AtomicBool::new(false), handler }
  }

  /// `None` once the source has been closed.
  pub(crate) fn register(&self, callback: C) -> Option<usize> {
    let mut callbacks = self.callbacks.lock();
    if self.is_closed() {
      None
    } else {
      Some(callbacks.add(callback))
    }
  }

  pub(crate) fn snapshot(&self) -> smallvec::SmallVec<[C; 4]> { self.callbacks.lock().snapshot() }

  pub(crate) fn len(&self) -> usize { self.callbacks.lock().len() }

  pub(crate) fn clear(&self) {
    let drained: Vec<C> = self.callbacks.lock().drain().collect();
    drop(drained);
  }

  pub(crate) fn close(&self) {
    let drained: Vec<C> = {
      let mut callbacks = self.callbacks.lock();
      self.closed.store(true, Ordering::Release);
      callbacks.drain().collect()
    };
    drop(drained);
  }

  #[inline]
  pub(crate) fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

  #[inline]
  pub(crate) fn handler(&self) -> Option<&SharedHandler> { self.handler.as_ref() }
}

impl<C: Send> Unregister for SourceCore<C> {
  fn unregister(&self, id: usize) {
    // Dropped outside the lock: a callback may own the last handle to
    // something that registers again on drop.
    let removed = self.callbacks.lock().remove(id);
    drop(removed);
  }
}
