use std::{sync::Arc, time::Duration};

use tracing::warn;

use super::{emit, Observer, Slot};
use crate::{
  cancel::CancellationScope,
  collab::ActionBuffer,
  dispatcher::Dispatcher,
  event::Payload,
};

impl<T: Payload> Observer<T> {
  /// Coalesce bursts: each value replaces the one waiting, and the survivor
  /// is delivered on `dispatcher` once no new value arrived for `delay`.
  ///
  /// Failures after this stage are resolved against the `catch` stages that
  /// follow it and otherwise go to the dispatcher's exception handler.
  /// Disposing the chain drops a delivery that is still waiting.
  pub fn debounce(self, delay: Duration, dispatcher: Arc<dyn Dispatcher>) -> Observer<T> {
    let scope = CancellationScope::new();
    let handler = dispatcher.exception_handler().clone();
    let buffer = ActionBuffer::<()>::new(dispatcher, scope.clone());
    self.chain.add_teardown(Box::new(move || scope.cancel()));
    self.pipe(move |v, out: &Slot<T>, chain| {
      let (out, chain, handler) = (out.clone(), chain.clone(), handler.clone());
      let submitted = buffer.submit((), delay, move || {
        if chain.is_disposed() {
          return Ok(());
        }
        emit(&out, v).or_else(|failure| failure.settle(Some(&handler)))
      });
      if let Err(err) = submitted {
        warn!(error = %err, "debounced event discarded");
      }
      Ok(())
    })
  }
}
