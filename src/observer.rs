//! Observer chains.
//!
//! [`Observable::observe`] returns the root [`Observer`] of a new chain;
//! every operator consumes the previous node and returns the next one, so a
//! chain reads top to bottom in delivery order:
//!
//! ```rust
//! use mvvm_rx::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let source = EventSource::<i32>::new();
//! let seen = Arc::new(Mutex::new(vec![]));
//! let c_seen = seen.clone();
//! source
//!   .observable()
//!   .observe()
//!   .filter(|v| v % 2 == 0)
//!   .map(|v| v * 10)
//!   .on_each(move |v| c_seen.lock().unwrap().push(*v));
//!
//! for v in 1..=4 {
//!   source.publish(v).unwrap();
//! }
//! assert_eq!(*seen.lock().unwrap(), vec![20, 40]);
//! ```
//!
//! Each stage owns the stage before it: disposing any node (or a node
//! disposing itself, as `once` and `until` do) detaches the whole chain from
//! its source, so nothing downstream receives anything afterwards. Chains
//! created by separate `observe()` calls are independent.
//!
//! Delivery failures from `try_*` stages travel back toward the root. On the
//! way they collect the `catch` stages they pass, which are then consulted in
//! attachment order; failures no `catch` handles are returned to the
//! publisher (or the source's exception handler).

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::{
  error::{Caught, Error, Result},
  event::{Narrow, Observable, Payload, SenderArgs},
  rc::{MutArc, RcDeref, RcDerefMut},
  scope::Lifetime,
  subscription::{Disposable, DisposeGuard},
};

pub mod async_chain;
mod debounce;
mod failure;
mod limit;
mod to_async;

pub use async_chain::AsyncObserver;
pub(crate) use failure::Failure;
pub use limit::LimitGate;

pub(crate) type Delivery = std::result::Result<(), Failure>;
pub(crate) type Sink<T> = Arc<dyn Fn(T) -> Delivery + Send + Sync>;
pub(crate) type Slot<T> = MutArc<Option<Sink<T>>>;

type Teardown = Box<dyn FnOnce() + Send>;

/// Disposal state shared by every node of one chain.
pub(crate) struct ChainCore {
  disposed: AtomicBool,
  teardown: Mutex<SmallVec<[Teardown; 2]>>,
}

impl ChainCore {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(ChainCore { disposed: AtomicBool::new(false), teardown: Mutex::new(SmallVec::new()) })
  }

  #[inline]
  pub(crate) fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }

  /// Run `f` when the chain is disposed, or now if it already is.
  pub(crate) fn add_teardown(&self, f: Teardown) {
    let mut teardown = self.teardown.lock();
    if self.is_disposed() {
      drop(teardown);
      f();
    } else {
      teardown.push(f);
    }
  }

  pub(crate) fn dispose(&self) {
    let teardown = {
      let mut teardown = self.teardown.lock();
      if self.disposed.swap(true, Ordering::AcqRel) {
        return;
      }
      std::mem::take(&mut *teardown)
    };
    trace!(teardown = teardown.len(), "observer chain disposed");
    for f in teardown {
      f();
    }
  }
}

/// Forward `value` to whatever is attached after a stage.
pub(crate) fn emit<T>(slot: &Slot<T>, value: T) -> Delivery {
  let sink = slot.rc_deref().clone();
  match sink {
    Some(sink) => sink(value),
    None => Ok(()),
  }
}

/// One node of a synchronous observer chain.
pub struct Observer<T> {
  pub(crate) chain: Arc<ChainCore>,
  pub(crate) slot: Slot<T>,
}

impl<T: Payload> Observer<T> {
  pub(crate) fn root(observable: &Observable<T>) -> Self {
    let chain = ChainCore::new();
    let slot: Slot<T> = MutArc::own(None);
    let (c_chain, c_slot) = (chain.clone(), slot.clone());
    let handler = observable.exception_handler();
    let subscription = observable.register(Arc::new(move |v| {
      if c_chain.is_disposed() {
        return Ok(());
      }
      emit(&c_slot, v).or_else(|failure| failure.settle(handler.as_ref()))
    }));
    chain.add_teardown(Box::new(move || subscription.dispose()));
    Observer { chain, slot }
  }

  /// Attach the next stage. `stage` receives each value, the slot of the
  /// node it creates and the chain.
  pub(crate) fn pipe<U: Payload>(
    self,
    stage: impl Fn(T, &Slot<U>, &Arc<ChainCore>) -> Delivery + Send + Sync + 'static,
  ) -> Observer<U> {
    let Observer { chain, slot } = self;
    let out: Slot<U> = MutArc::own(None);
    let (c_out, c_chain) = (out.clone(), chain.clone());
    *slot.rc_deref_mut() = Some(Arc::new(move |v| stage(v, &c_out, &c_chain)));
    Observer { chain, slot: out }
  }

  #[doc(alias = "select")]
  pub fn map<U: Payload>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Observer<U> {
    self.pipe(move |v, out, _| emit(out, f(v)))
  }

  /// `map` whose errors become delivery failures.
  pub fn try_map<U: Payload>(
    self,
    f: impl Fn(T) -> Result<U> + Send + Sync + 'static,
  ) -> Observer<U> {
    self.pipe(move |v, out, _| emit(out, f(v)?))
  }

  #[doc(alias = "where")]
  pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Observer<T> {
    self.pipe(move |v, out, _| if predicate(&v) { emit(out, v) } else { Ok(()) })
  }

  /// `filter` whose errors become delivery failures.
  pub fn try_filter(
    self,
    predicate: impl Fn(&T) -> Result<bool> + Send + Sync + 'static,
  ) -> Observer<T> {
    self.pipe(move |v, out, _| if predicate(&v)? { emit(out, v) } else { Ok(()) })
  }

  /// Deliver only values that narrow to `U`.
  pub fn of_type<U: Payload>(self) -> Observer<U>
  where
    T: Narrow<U>,
  {
    self.pipe(|v, out, _| match v.narrow() {
      Some(u) => emit(out, u),
      None => Ok(()),
    })
  }

  /// Run `f` on each value, then pass it on unchanged.
  pub fn on_each(self, f: impl Fn(&T) + Send + Sync + 'static) -> Observer<T> {
    self.pipe(move |v, out, _| {
      f(&v);
      emit(out, v)
    })
  }

  /// `on_each` whose errors become delivery failures; a failing value is not
  /// passed on.
  pub fn try_on_each(self, f: impl Fn(&T) -> Result<()> + Send + Sync + 'static) -> Observer<T> {
    self.pipe(move |v, out, _| {
      f(&v)?;
      emit(out, v)
    })
  }

  /// Deliver the first value, then dispose the chain once everything
  /// downstream has handled it.
  pub fn once(self) -> Observer<T> {
    let fired = AtomicBool::new(false);
    self.pipe(move |v, out, chain| {
      if fired.swap(true, Ordering::AcqRel) {
        return Ok(());
      }
      let delivered = emit(out, v);
      chain.dispose();
      delivered
    })
  }

  /// Dispose the chain at the first value matching `predicate`. That value is
  /// passed on only when `continue_on_dispose` is set.
  pub fn until(
    self,
    predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    continue_on_dispose: bool,
  ) -> Observer<T> {
    self.pipe(move |v, out, chain| {
      if !predicate(&v) {
        return emit(out, v);
      }
      if continue_on_dispose {
        let delivered = emit(out, v);
        chain.dispose();
        delivered
      } else {
        chain.dispose();
        Ok(())
      }
    })
  }

  /// Intercept failures raised downstream of this stage.
  ///
  /// `handler` sees the value this stage forwarded and the failure, marked
  /// handled. Clearing `handled` passes the failure on to the `catch` stage
  /// attached after this one, and finally to the publisher. Failures of
  /// events a later `limit` stage buffered arrive with the call that
  /// delivered them, next to that call's value.
  pub fn catch(self, handler: impl Fn(&T, &mut Caught) + Send + Sync + 'static) -> Observer<T> {
    let handler = Arc::new(handler);
    self.pipe(move |v, out, _| {
      let payload = v.clone();
      emit(out, v).map_err(|mut failure| {
        let handler = handler.clone();
        failure.defer(Box::new(move |err: &Error| {
          let mut caught = Caught::new(err.clone(), true);
          handler(&payload, &mut caught);
          caught.handled
        }));
        failure
      })
    })
  }

  /// Tie the chain to `owner`: it is disposed when the owner ends.
  pub fn on(self, owner: &impl Lifetime) -> Observer<T> {
    let weak = Arc::downgrade(&self.chain);
    let registration = owner.on_end(Box::new(move || {
      if let Some(chain) = weak.upgrade() {
        chain.dispose();
      }
    }));
    self.chain.add_teardown(Box::new(move || drop(registration)));
    self
  }

  /// Dispose the chain when the guard is dropped.
  pub fn into_guard(self) -> DisposeGuard<Observer<T>> { DisposeGuard::new(self) }
}

impl<S: Payload, A: Payload> Observer<SenderArgs<S, A>> {
  /// Deliver only events whose sender and args both narrow.
  pub fn of_sender_type<S2: Payload, A2: Payload>(self) -> Observer<SenderArgs<S2, A2>>
  where
    S: Narrow<S2>,
    A: Narrow<A2>,
  {
    self.pipe(|e, out, _| match (e.sender.narrow(), e.args.narrow()) {
      (Some(sender), Some(args)) => emit(out, SenderArgs::new(sender, args)),
      _ => Ok(()),
    })
  }

  /// Drop the sender.
  pub fn args(self) -> Observer<A> { self.map(|e| e.args) }
}

impl<T> Disposable for Observer<T> {
  #[inline]
  fn dispose(&self) { self.chain.dispose() }

  #[inline]
  fn is_disposed(&self) -> bool { self.chain.is_disposed() }
}

impl<T> std::fmt::Debug for Observer<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Observer").field("disposed", &self.chain.is_disposed()).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{cancel::CancellationScope, error::Error, event::EventSource};

  fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static)
  where
    T: Clone,
  {
    let log = Arc::new(Mutex::new(vec![]));
    let c_log = log.clone();
    (log, move |v: &T| c_log.lock().push(v.clone()))
  }

  #[test]
  fn sibling_chains_are_independent() {
    let source = EventSource::<i32>::new();
    let (a, rec_a) = recorder();
    let (b, rec_b) = recorder();
    let (c, rec_c) = recorder();
    let _a = source.observable().observe().on_each(rec_a);
    let b_chain = source.observable().observe().on_each(rec_b);
    let _c = source.observable().observe().on_each(rec_c);
    b_chain.dispose();
    source.publish(1).unwrap();
    assert_eq!(*a.lock(), vec![1]);
    assert!(b.lock().is_empty());
    assert_eq!(*c.lock(), vec![1]);
  }

  #[test]
  fn once_delivers_a_single_event() {
    let source = EventSource::<i32>::new();
    let (log, rec) = recorder();
    let chain = source.observable().observe().once().on_each(rec);
    for v in 1..=3 {
      source.publish(v).unwrap();
    }
    assert_eq!(*log.lock(), vec![1]);
    assert!(chain.is_disposed());
    assert_eq!(source.subscriber_count(), 0);
  }

  #[test]
  fn until_swallows_trigger_by_default() {
    let source = EventSource::<&'static str>::new();
    let (log, rec) = recorder();
    let rec = Arc::new(rec);
    let (r1, r2) = (rec.clone(), rec);
    source
      .observable()
      .observe()
      .on_each(move |v| r1(v))
      .until(|v| *v == "stop", false)
      .on_each(move |v| r2(v));
    for v in ["Hello", "stop", "World"] {
      source.publish(v).unwrap();
    }
    assert_eq!(*log.lock(), vec!["Hello", "Hello", "stop"]);
  }

  #[test]
  fn until_can_forward_trigger() {
    let source = EventSource::<&'static str>::new();
    let (log, rec) = recorder();
    let rec = Arc::new(rec);
    let (r1, r2) = (rec.clone(), rec);
    source
      .observable()
      .observe()
      .on_each(move |v| r1(v))
      .until(|v| *v == "stop", true)
      .on_each(move |v| r2(v));
    for v in ["Hello", "stop", "World"] {
      source.publish(v).unwrap();
    }
    assert_eq!(*log.lock(), vec!["Hello", "Hello", "stop", "stop"]);
  }

  #[test]
  fn map_and_filter_failures_reach_publisher() {
    let source = EventSource::<i32>::new();
    source
      .observable()
      .observe()
      .try_map(|v| if v > 1 { Err(Error::msg("too big")) } else { Ok(v) })
      .on_each(|_| {});
    assert!(source.publish(1).is_ok());
    assert_eq!(source.publish(2).unwrap_err().to_string(), "too big");

    let source = EventSource::<i32>::new();
    source.observable().observe().try_filter(|_| Err(Error::msg("bad predicate")));
    assert!(source.publish(1).is_err());
  }

  #[test]
  fn first_catch_to_handle_wins() {
    let source = EventSource::<i32>::new();
    let order = Arc::new(Mutex::new(vec![]));
    let (o1, o2) = (order.clone(), order.clone());
    source
      .observable()
      .observe()
      .catch(move |v, _| o1.lock().push(("first", *v)))
      .catch(move |v, _| o2.lock().push(("second", *v)))
      .try_on_each(|_| Err(Error::msg("fail")));
    assert!(source.publish(5).is_ok());
    assert_eq!(*order.lock(), vec![("first", 5)]);
  }

  #[test]
  fn unhandled_failure_visits_every_catch_in_attachment_order() {
    let source = EventSource::<i32>::new();
    let order = Arc::new(Mutex::new(vec![]));
    let (o1, o2) = (order.clone(), order.clone());
    source
      .observable()
      .observe()
      .catch(move |_, c| {
        o1.lock().push(format!("first:{}", c.error()));
        c.handled = false;
      })
      .map(|v| v + 1)
      .catch(move |v, c| {
        o2.lock().push(format!("second:{v}"));
        c.handled = false;
      })
      .try_on_each(|_| Err(Error::msg("fail")));
    let err = source.publish(1).unwrap_err();
    assert_eq!(err.to_string(), "fail");
    assert_eq!(*order.lock(), vec!["first:fail".to_string(), "second:2".to_string()]);
  }

  #[test]
  fn catch_only_covers_downstream() {
    let source = EventSource::<i32>::new();
    let caught = Arc::new(AtomicBool::new(false));
    let c_caught = caught.clone();
    source
      .observable()
      .observe()
      .try_on_each(|_| Err(Error::msg("upstream")))
      .catch(move |_, _| c_caught.store(true, Ordering::SeqCst));
    assert!(source.publish(1).is_err());
    assert!(!caught.load(Ordering::SeqCst));
  }

  #[test]
  fn of_type_narrows_open_hierarchy() {
    use crate::event::AnyArgs;
    let source = EventSource::<AnyArgs>::new();
    let (log, rec) = recorder::<Arc<String>>();
    source.observable().observe().of_type::<Arc<String>>().on_each(rec);
    source.publish(Arc::new(1_u8)).unwrap();
    source.publish(Arc::new("hi".to_string())).unwrap();
    assert_eq!(log.lock().iter().map(|s| s.as_str()).collect::<Vec<_>>(), vec!["hi"]);
  }

  #[test]
  fn sender_narrowing_needs_both_parts() {
    use crate::event::AnyArgs;
    let source = EventSource::<SenderArgs<AnyArgs, AnyArgs>>::new();
    let (log, rec) = recorder::<(u32, String)>();
    source
      .observable()
      .observe()
      .of_sender_type::<Arc<u32>, Arc<String>>()
      .map(|e| (*e.sender, (*e.args).clone()))
      .on_each(rec);
    source.publish_from(Arc::new(1_u32), Arc::new("a".to_string())).unwrap();
    source.publish_from(Arc::new("nope"), Arc::new("b".to_string())).unwrap();
    source.publish_from(Arc::new(2_u32), Arc::new(3_i64)).unwrap();
    assert_eq!(*log.lock(), vec![(1, "a".to_string())]);
  }

  #[test]
  fn lifetime_binding_disposes_chain() {
    let source = EventSource::<i32>::new();
    let owner = CancellationScope::new();
    let (log, rec) = recorder();
    let chain = source.observable().observe().on_each(rec).on(&owner);
    source.publish(1).unwrap();
    owner.cancel();
    source.publish(2).unwrap();
    assert_eq!(*log.lock(), vec![1]);
    assert!(chain.is_disposed());

    let ended = CancellationScope::cancelled_scope();
    let chain = source.observable().observe().on(&ended);
    assert!(chain.is_disposed());
  }

  #[test]
  fn guard_disposes_on_drop() {
    let source = EventSource::<i32>::new();
    let (log, rec) = recorder();
    {
      let _guard = source.observable().observe().on_each(rec).into_guard();
      source.publish(1).unwrap();
    }
    source.publish(2).unwrap();
    assert_eq!(*log.lock(), vec![1]);
  }

  #[test]
  fn dispose_is_idempotent() {
    let source = EventSource::<i32>::new();
    let chain = source.observable().observe();
    chain.dispose();
    chain.dispose();
    assert!(chain.is_disposed());
    assert_eq!(source.subscriber_count(), 0);
  }
}
