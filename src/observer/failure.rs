use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::warn;

use crate::{
  error::{Error, Result},
  exception::SharedHandler,
};

type CatchFn = Box<dyn FnMut(&Error) -> bool + Send>;
type DeferredCatch = Arc<Mutex<CatchFn>>;

struct Pending {
  error: Error,
  catches: SmallVec<[DeferredCatch; 1]>,
}

/// Delivery failures on their way back to the root of a chain.
///
/// Every `catch` stage a failure passes on its way out registers a deferred
/// handler instead of handling it on the spot: stages are passed innermost
/// first, but must be consulted in attachment order. Resolving runs the
/// collected handlers outermost first and stops at the first one that
/// leaves the error handled.
///
/// A `limit` stage delivering buffered events can bring back several errors
/// from one call; they travel together and each one is offered to every
/// `catch` stage it passes.
pub(crate) struct Failure {
  pending: SmallVec<[Pending; 1]>,
}

impl Failure {
  pub(crate) fn new(error: Error) -> Self {
    Failure { pending: SmallVec::from_buf([Pending { error, catches: SmallVec::new() }]) }
  }

  pub(crate) fn defer(&mut self, catch: CatchFn) {
    let catch: DeferredCatch = Arc::new(Mutex::new(catch));
    for pending in self.pending.iter_mut() {
      pending.catches.push(catch.clone());
    }
  }

  /// Carry `other`'s errors along with this one's.
  pub(crate) fn absorb(&mut self, other: Failure) { self.pending.extend(other.pending) }

  /// Errors no `catch` stage handled, in the order they were raised.
  pub(crate) fn unhandled(self) -> SmallVec<[Error; 1]> {
    self
      .pending
      .into_iter()
      .filter_map(|Pending { error, catches }| {
        for catch in catches.iter().rev() {
          let mut catch = catch.lock();
          if (*catch)(&error) {
            return None;
          }
        }
        Some(error)
      })
      .collect()
  }

  /// Resolve every error. With a `handler`, each unhandled error is reported
  /// there; without one the first is returned and the others are logged.
  pub(crate) fn settle(self, handler: Option<&SharedHandler>) -> Result<()> {
    let errors = self.unhandled();
    if let Some(handler) = handler {
      errors.iter().for_each(|err| handler.handle(err));
      return Ok(());
    }
    let mut errors = errors.into_iter();
    let first = errors.next();
    for err in errors {
      warn!(error = %err, "additional delivery failure during publish");
    }
    first.map_or(Ok(()), Err)
  }
}

impl From<Error> for Failure {
  #[inline]
  fn from(error: Error) -> Self { Failure::new(error) }
}
