use std::sync::{Arc, Weak};

use tracing::warn;

use super::{Payload, SenderArgs, SourceCore};
use crate::{
  error::Result,
  exception::SharedHandler,
  observer::Observer,
  subscription::{Subscription, Unregister},
};

pub(crate) type Callback<T> = Arc<dyn Fn(T) -> Result<()> + Send + Sync>;

/// Publishing side of a synchronous event.
///
/// `publish` runs every registered callback on the calling thread, in
/// registration order, before it returns. The callback list is snapshotted
/// before iterating: a callback registered during a publish first sees the
/// next one, and a callback removed during a publish still receives the
/// event in flight. Observer chains additionally check their own disposed
/// flag, so a disposed chain never sees another event.
///
/// Dropping the source closes it: every registration is released and later
/// registrations are handed back already disposed.
pub struct EventSource<T = ()> {
  core: Arc<SourceCore<Callback<T>>>,
}

/// Subscribe-only view of an [`EventSource`].
pub struct Observable<T = ()> {
  core: Arc<SourceCore<Callback<T>>>,
}

impl<T> Clone for Observable<T> {
  fn clone(&self) -> Self { Observable { core: self.core.clone() } }
}

impl<T: Payload> Default for EventSource<T> {
  fn default() -> Self { Self::new() }
}

impl<T: Payload> EventSource<T> {
  /// A source whose unhandled delivery failures are returned from `publish`.
  pub fn new() -> Self { EventSource { core: Arc::new(SourceCore::new(None)) } }

  /// A source whose unhandled delivery failures go to `handler`; `publish`
  /// then only fails when the handler itself is missing.
  pub fn with_exception_handler(handler: SharedHandler) -> Self {
    EventSource { core: Arc::new(SourceCore::new(Some(handler))) }
  }

  pub fn observable(&self) -> Observable<T> { Observable { core: self.core.clone() } }

  /// Deliver `value` to every registered callback.
  ///
  /// Every callback receives the event even when an earlier one fails. The
  /// first unhandled failure is returned (or, with an exception handler,
  /// every failure is reported there and `Ok` is returned).
  pub fn publish(&self, value: T) -> Result<()> {
    let callbacks = self.core.snapshot();
    let mut first = None;
    for callback in callbacks {
      if let Err(err) = callback(value.clone()) {
        match self.core.handler() {
          Some(handler) => handler.handle(&err),
          None if first.is_none() => first = Some(err),
          None => warn!(error = %err, "additional delivery failure during publish"),
        }
      }
    }
    first.map_or(Ok(()), Err)
  }

  /// Unregister every callback; the source stays usable.
  pub fn clear(&self) { self.core.clear() }

  pub fn subscriber_count(&self) -> usize { self.core.len() }
}

impl EventSource<()> {
  /// Publish on a source without payload.
  pub fn notify(&self) -> Result<()> { self.publish(()) }
}

impl<S: Payload, A: Payload> EventSource<SenderArgs<S, A>> {
  pub fn publish_from(&self, sender: S, args: A) -> Result<()> {
    self.publish(SenderArgs::new(sender, args))
  }
}

impl<T> Drop for EventSource<T> {
  fn drop(&mut self) { self.core.close() }
}

impl<T: Payload> Observable<T> {
  /// Register a plain callback.
  pub fn subscribe(&self, f: impl Fn(T) + Send + Sync + 'static) -> Subscription {
    self.register(Arc::new(move |v| {
      f(v);
      Ok(())
    }))
  }

  /// Register a fallible callback; its errors are delivery failures.
  pub fn try_subscribe(&self, f: impl Fn(T) -> Result<()> + Send + Sync + 'static) -> Subscription {
    self.register(Arc::new(f))
  }

  /// A fresh observer chain rooted at this source.
  pub fn observe(&self) -> Observer<T> { Observer::root(self) }

  pub fn subscriber_count(&self) -> usize { self.core.len() }

  /// `true` once the owning source has been dropped.
  pub fn is_closed(&self) -> bool { self.core.is_closed() }

  pub(crate) fn exception_handler(&self) -> Option<SharedHandler> { self.core.handler().cloned() }

  pub(crate) fn register(&self, callback: Callback<T>) -> Subscription {
    match self.core.register(callback) {
      Some(id) => {
        let target: Weak<dyn Unregister> = Arc::downgrade(&self.core) as Weak<dyn Unregister>;
        Subscription::new(target, id)
      }
      None => Subscription::closed(),
    }
  }
}
