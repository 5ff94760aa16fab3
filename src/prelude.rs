//! Prelude module for convenient imports
//!
//! This module re-exports commonly used types and traits for easy access.

// Cancellation and quiescence
pub use crate::cancel::{CancellationScope, Registration};
// Collaborators
pub use crate::collab::{ActionBuffer, EventObserver};
pub use crate::config::Config;
// Dispatchers
#[cfg(feature = "tokio-scheduler")]
pub use crate::dispatcher::TokioDispatcher;
pub use crate::dispatcher::{
  DedicatedThreadDispatcher, Dispatcher, DispatcherExt, ErrorCallback, ScopedDispatcher,
  ThreadPoolDispatcher,
};
pub use crate::error::{Caught, Error, Result};
// Sources
pub use crate::event::{
  AnyArgs, AsyncEventSource, AsyncObservable, EventSource, Narrow, Observable, Payload, SenderArgs,
};
pub use crate::exception::{ExceptionHandler, ExceptionHub, LogExceptionHandler, SharedHandler};
// Observer chains
pub use crate::observer::{AsyncObserver, LimitGate, Observer};
pub use crate::scope::{Lifetime, LifetimeScope};
// Subscription
pub use crate::subscription::{Disposable, DisposeGuard, Subscription};
pub use crate::transaction::{Lease, Transaction};
