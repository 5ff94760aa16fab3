use std::sync::Arc;

use futures::FutureExt;

use super::{
  async_chain::{emit_async, AsyncObserver, AsyncSlot},
  Failure, Observer,
};
use crate::{
  dispatcher::{report, Dispatcher, ErrorCallback},
  event::Payload,
  rc::{MutArc, RcDerefMut},
};

impl<T: Payload> Observer<T> {
  /// Continue the chain on `dispatcher`. Publishing only queues the
  /// delivery; failures after this stage go to the dispatcher's exception
  /// handler.
  pub fn to_async(self, dispatcher: Arc<dyn Dispatcher>) -> AsyncObserver<T> {
    self.to_async_with(dispatcher, None)
  }

  /// `to_async` offering failures to `on_error` first.
  pub fn to_async_with(
    self,
    dispatcher: Arc<dyn Dispatcher>,
    on_error: Option<ErrorCallback>,
  ) -> AsyncObserver<T> {
    let Observer { chain, slot } = self;
    let out: AsyncSlot<T> = MutArc::own(None);
    let (c_out, c_chain) = (out.clone(), chain.clone());
    let stage = move |v: T| {
      let (out, chain, on_error) = (c_out.clone(), c_chain.clone(), on_error.clone());
      let handler = dispatcher.exception_handler().clone();
      let delivery = async move {
        if chain.is_disposed() {
          return;
        }
        if let Err(failure) = emit_async(&out, v).await {
          for err in failure.unhandled() {
            report(err, on_error.as_ref(), &handler);
          }
        }
      };
      dispatcher.spawn(delivery.boxed()).map_err(Failure::from)
    };
    *slot.rc_deref_mut() = Some(Arc::new(stage));
    AsyncObserver { chain, slot: out }
  }
}
