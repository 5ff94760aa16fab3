//! Observer chains whose stages may await.
//!
//! An [`AsyncObserver`] is obtained from an
//! [`AsyncObservable`](crate::event::AsyncObservable) or by crossing a
//! [`to_async`](super::Observer::to_async) boundary. Each stage awaits the
//! rest of the chain before its own delivery completes, so an async
//! publish returns only after every stage is done with the event.

use std::{
  future::Future,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use futures::{
  future::{self, BoxFuture},
  FutureExt,
};

use super::{ChainCore, Delivery, Failure};
use crate::{
  error::{Caught, Error, Result},
  event::{AsyncObservable, Narrow, Payload, SenderArgs},
  observer::limit::{Admission, LimitGate},
  rc::{MutArc, RcDeref, RcDerefMut},
  scope::Lifetime,
  subscription::{Disposable, DisposeGuard},
};

pub(crate) type AsyncSink<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Delivery> + Send + Sync>;
pub(crate) type AsyncSlot<T> = MutArc<Option<AsyncSink<T>>>;

pub(crate) fn emit_async<T>(slot: &AsyncSlot<T>, value: T) -> BoxFuture<'static, Delivery> {
  let sink = slot.rc_deref().clone();
  match sink {
    Some(sink) => sink(value),
    None => future::ready(Ok(())).boxed(),
  }
}

fn done(delivery: Delivery) -> BoxFuture<'static, Delivery> { future::ready(delivery).boxed() }

/// One node of an asynchronous observer chain.
pub struct AsyncObserver<T> {
  pub(crate) chain: Arc<ChainCore>,
  pub(crate) slot: AsyncSlot<T>,
}

impl<T: Payload> AsyncObserver<T> {
  pub(crate) fn root(observable: &AsyncObservable<T>) -> Self {
    let chain = ChainCore::new();
    let slot: AsyncSlot<T> = MutArc::own(None);
    let (c_chain, c_slot) = (chain.clone(), slot.clone());
    let handler = observable.exception_handler();
    let subscription = observable.register(Arc::new(move |v| {
      let (chain, slot, handler) = (c_chain.clone(), c_slot.clone(), handler.clone());
      async move {
        if chain.is_disposed() {
          return Ok(());
        }
        emit_async(&slot, v).await.or_else(|failure| failure.settle(handler.as_ref()))
      }
      .boxed()
    }));
    chain.add_teardown(Box::new(move || subscription.dispose()));
    AsyncObserver { chain, slot }
  }

  pub(crate) fn pipe<U: Payload>(
    self,
    stage: impl Fn(T, &AsyncSlot<U>, &Arc<ChainCore>) -> BoxFuture<'static, Delivery>
      + Send
      + Sync
      + 'static,
  ) -> AsyncObserver<U> {
    let AsyncObserver { chain, slot } = self;
    let out: AsyncSlot<U> = MutArc::own(None);
    let (c_out, c_chain) = (out.clone(), chain.clone());
    *slot.rc_deref_mut() = Some(Arc::new(move |v| stage(v, &c_out, &c_chain)));
    AsyncObserver { chain, slot: out }
  }

  #[doc(alias = "select")]
  pub fn map<U: Payload>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> AsyncObserver<U> {
    self.pipe(move |v, out, _| emit_async(out, f(v)))
  }

  pub fn try_map<U: Payload>(
    self,
    f: impl Fn(T) -> Result<U> + Send + Sync + 'static,
  ) -> AsyncObserver<U> {
    self.pipe(move |v, out, _| match f(v) {
      Ok(u) => emit_async(out, u),
      Err(err) => done(Err(err.into())),
    })
  }

  #[doc(alias = "where")]
  pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> AsyncObserver<T> {
    self.pipe(move |v, out, _| if predicate(&v) { emit_async(out, v) } else { done(Ok(())) })
  }

  pub fn try_filter(
    self,
    predicate: impl Fn(&T) -> Result<bool> + Send + Sync + 'static,
  ) -> AsyncObserver<T> {
    self.pipe(move |v, out, _| match predicate(&v) {
      Ok(true) => emit_async(out, v),
      Ok(false) => done(Ok(())),
      Err(err) => done(Err(err.into())),
    })
  }

  pub fn of_type<U: Payload>(self) -> AsyncObserver<U>
  where
    T: Narrow<U>,
  {
    self.pipe(|v, out, _| match v.narrow() {
      Some(u) => emit_async(out, u),
      None => done(Ok(())),
    })
  }

  pub fn on_each(self, f: impl Fn(&T) + Send + Sync + 'static) -> AsyncObserver<T> {
    self.pipe(move |v, out, _| {
      f(&v);
      emit_async(out, v)
    })
  }

  /// Await `f` for each value, then pass the value on.
  pub fn on_each_async<F, Fut>(self, f: F) -> AsyncObserver<T>
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.pipe(move |v, out, _| {
      let (work, out) = (f(v.clone()), out.clone());
      async move {
        work.await;
        emit_async(&out, v).await
      }
      .boxed()
    })
  }

  /// `on_each_async` whose errors become delivery failures; a failing value
  /// is not passed on.
  pub fn try_on_each_async<F, Fut>(self, f: F) -> AsyncObserver<T>
  where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    self.pipe(move |v, out, _| {
      let (work, out) = (f(v.clone()), out.clone());
      async move {
        work.await?;
        emit_async(&out, v).await
      }
      .boxed()
    })
  }

  pub fn once(self) -> AsyncObserver<T> {
    let fired = AtomicBool::new(false);
    self.pipe(move |v, out, chain| {
      if fired.swap(true, Ordering::AcqRel) {
        return done(Ok(()));
      }
      let (delivery, chain) = (emit_async(out, v), chain.clone());
      async move {
        let delivered = delivery.await;
        chain.dispose();
        delivered
      }
      .boxed()
    })
  }

  pub fn until(
    self,
    predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    continue_on_dispose: bool,
  ) -> AsyncObserver<T> {
    self.pipe(move |v, out, chain| {
      if !predicate(&v) {
        return emit_async(out, v);
      }
      if !continue_on_dispose {
        chain.dispose();
        return done(Ok(()));
      }
      let (delivery, chain) = (emit_async(out, v), chain.clone());
      async move {
        let delivered = delivery.await;
        chain.dispose();
        delivered
      }
      .boxed()
    })
  }

  /// Same contract as [`Observer::catch`](super::Observer::catch).
  pub fn catch(
    self,
    handler: impl Fn(&T, &mut Caught) + Send + Sync + 'static,
  ) -> AsyncObserver<T> {
    let handler = Arc::new(handler);
    self.pipe(move |v, out, _| {
      let (payload, handler) = (v.clone(), handler.clone());
      emit_async(out, v)
        .map(move |delivered| {
          delivered.map_err(|mut failure| {
            failure.defer(Box::new(move |err: &Error| {
              let mut caught = Caught::new(err.clone(), true);
              handler(&payload, &mut caught);
              caught.handled
            }));
            failure
          })
        })
        .boxed()
    })
  }

  /// At most `max_concurrent` deliveries in flight; up to `max_buffer`
  /// events wait, anything beyond is dropped.
  pub fn limit(self, max_concurrent: usize, max_buffer: usize) -> AsyncObserver<T> {
    self.limit_with(LimitGate::new(max_concurrent, max_buffer))
  }

  pub fn limit_with(self, gate: LimitGate) -> AsyncObserver<T> {
    let admission = Admission::new(gate);
    self.pipe(move |v, out, _| {
      let Some(mut turn) = admission.admit(v) else { return done(Ok(())) };
      let out = out.clone();
      async move {
        let mut failed: Option<Failure> = None;
        while let Some(value) = turn.next() {
          if let Err(failure) = emit_async(&out, value).await {
            match failed.as_mut() {
              None => failed = Some(failure),
              Some(first) => first.absorb(failure),
            }
          }
        }
        failed.map_or(Ok(()), Err)
      }
      .boxed()
    })
  }

  /// Dispose the chain when `owner` ends.
  pub fn on(self, owner: &impl Lifetime) -> AsyncObserver<T> {
    let weak = Arc::downgrade(&self.chain);
    let registration = owner.on_end(Box::new(move || {
      if let Some(chain) = weak.upgrade() {
        chain.dispose();
      }
    }));
    self.chain.add_teardown(Box::new(move || drop(registration)));
    self
  }

  pub fn into_guard(self) -> DisposeGuard<AsyncObserver<T>> { DisposeGuard::new(self) }
}

impl<S: Payload, A: Payload> AsyncObserver<SenderArgs<S, A>> {
  pub fn of_sender_type<S2: Payload, A2: Payload>(self) -> AsyncObserver<SenderArgs<S2, A2>>
  where
    S: Narrow<S2>,
    A: Narrow<A2>,
  {
    self.pipe(|e, out, _| match (e.sender.narrow(), e.args.narrow()) {
      (Some(sender), Some(args)) => emit_async(out, SenderArgs::new(sender, args)),
      _ => done(Ok(())),
    })
  }

  pub fn args(self) -> AsyncObserver<A> { self.map(|e| e.args) }
}

impl<T> Disposable for AsyncObserver<T> {
  #[inline]
  fn dispose(&self) { self.chain.dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { self.chain.is_disposed() }
}

impl<T> std::fmt::Debug for AsyncObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AsyncObserver").field("disposed", &self.chain.is_disposed()).finish()
  }
}
