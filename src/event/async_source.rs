//! Events whose callbacks may await.

use std::{
  future::Future,
  sync::{Arc, Weak},
};

use futures::{future::BoxFuture, FutureExt};
use tracing::warn;

use super::{Payload, SenderArgs, SourceCore};
use crate::{
  error::Result,
  exception::SharedHandler,
  observer::AsyncObserver,
  subscription::{Subscription, Unregister},
};

pub(crate) type AsyncCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Publishing side of an asynchronous event.
///
/// `publish` awaits the callbacks one after another, in registration order;
/// the next callback starts only after the previous one completed, so state
/// a callback changes is visible to the ones after it. The callback list is
/// snapshotted when the publish starts, like [`EventSource`](super::EventSource).
pub struct AsyncEventSource<T = ()> {
  core: Arc<SourceCore<AsyncCallback<T>>>,
}

/// Subscribe-only view of an [`AsyncEventSource`].
pub struct AsyncObservable<T = ()> {
  core: Arc<SourceCore<AsyncCallback<T>>>,
}

impl<T> Clone for AsyncObservable<T> {
  fn clone(&self) -> Self { AsyncObservable { core: self.core.clone() } }
}

impl<T: Payload> Default for AsyncEventSource<T> {
  fn default() -> Self { Self::new() }
}

impl<T: Payload> AsyncEventSource<T> {
  pub fn new() -> Self { AsyncEventSource { core: Arc::new(SourceCore::new(None)) } }

  pub fn with_exception_handler(handler: SharedHandler) -> Self {
    AsyncEventSource { core: Arc::new(SourceCore::new(Some(handler))) }
  }

  pub fn observable(&self) -> AsyncObservable<T> { AsyncObservable { core: self.core.clone() } }

  /// Deliver `value` to every callback, one at a time. Failures are treated
  /// as in [`EventSource::publish`](super::EventSource::publish).
  pub async fn publish(&self, value: T) -> Result<()> {
    let callbacks = self.core.snapshot();
    let mut first = None;
    for callback in callbacks {
      if let Err(err) = callback(value.clone()).await {
        match self.core.handler() {
          Some(handler) => handler.handle(&err),
          None if first.is_none() => first = Some(err),
          None => warn!(error = %err, "additional delivery failure during publish"),
        }
      }
    }
    first.map_or(Ok(()), Err)
  }

  pub fn clear(&self) { self.core.clear() }

  pub fn subscriber_count(&self) -> usize { self.core.len() }
}

impl AsyncEventSource<()> {
  pub async fn notify(&self) -> Result<()> { self.publish(()).await }
}

impl<S: Payload, A: Payload> AsyncEventSource<SenderArgs<S, A>> {
  pub async fn publish_from(&self, sender: S, args: A) -> Result<()> {
    self.publish(SenderArgs::new(sender, args)).await
  }
}

impl<T> Drop for AsyncEventSource<T> {
  fn drop(&mut self) { self.core.close() }
}

impl<T: Payload> AsyncObservable<T> {
  pub fn subscribe<F, Fut>(&self, f: F) -> Subscription
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.register(Arc::new(move |v| f(v).map(Ok).boxed()))
  }

  pub fn try_subscribe<F, Fut>(&self, f: F) -> Subscription
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self.register(Arc::new(move |v| f(v).boxed()))
  }

  /// A fresh asynchronous observer chain rooted at this source.
  pub fn observe(&self) -> AsyncObserver<T> { AsyncObserver::root(self) }

  pub fn subscriber_count(&self) -> usize { self.core.len() }

  pub fn is_closed(&self) -> bool { self.core.is_closed() }

  pub(crate) fn exception_handler(&self) -> Option<SharedHandler> { self.core.handler().cloned() }

  pub(crate) fn register(&self, callback: AsyncCallback<T>) -> Subscription {
    match self.core.register(callback) {
      Some(id) => {
        let target: Weak<dyn Unregister> = Arc::downgrade(&self.core) as Weak<dyn Unregister>;
        Subscription::new(target, id)
      }
      None => Subscription::closed(),
    }
  }
}
