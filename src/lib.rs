//! # mvvm-rx: reactive core for MVVM applications
//!
//! In-process publish/subscribe with chained observers, dispatchers for the
//! worker pool and a dedicated "main" thread, and cascading cancellation
//! scopes that tie both to the lifetime of an owner.
//!
//! ## Quick Start
//!
//! ```rust
//! use mvvm_rx::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let source = EventSource::<&'static str>::new();
//! let seen = Arc::new(Mutex::new(vec![]));
//! let c_seen = seen.clone();
//!
//! source
//!   .observable()
//!   .observe()
//!   .until(|v| *v == "stop", false)
//!   .on_each(move |v| c_seen.lock().unwrap().push(*v));
//!
//! for v in ["Hello", "stop", "World"] {
//!   source.publish(v).unwrap();
//! }
//! assert_eq!(*seen.lock().unwrap(), vec!["Hello"]);
//! ```
//!
//! ## Key Concepts
//!
//! | Type | Description |
//! |------|-------------|
//! | [`EventSource`] / [`Observable`] | Publishing side and its subscribe-only view |
//! | [`AsyncEventSource`] | Sources whose callbacks are awaited one by one |
//! | [`Observer`] / [`AsyncObserver`] | Nodes of an operator chain |
//! | [`Dispatcher`] | Runs work on a thread pool, a dedicated thread or tokio |
//! | [`CancellationScope`] / [`Transaction`] | Cooperative cancellation and quiescence |
//! | [`LifetimeScope`] | Everything an owner needs for its lifetime |
//!
//! ## Feature Flags
//!
//! - **`tokio-scheduler`**: adds `TokioDispatcher`
//!
//! [`EventSource`]: event::EventSource
//! [`Observable`]: event::Observable
//! [`AsyncEventSource`]: event::AsyncEventSource
//! [`Observer`]: observer::Observer
//! [`AsyncObserver`]: observer::AsyncObserver
//! [`Dispatcher`]: dispatcher::Dispatcher
//! [`CancellationScope`]: cancel::CancellationScope
//! [`Transaction`]: transaction::Transaction
//! [`LifetimeScope`]: scope::LifetimeScope

pub mod cancel;
pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod exception;
pub mod observer;
pub mod prelude;
pub mod rc;
pub mod scope;
pub mod subscription;
pub mod transaction;

pub use prelude::*;

#[cfg(all(doctest, not(target_arch = "wasm32")))]
mod __markdown_doctests {
  mod readme {
    #![doc = include_str!("../README.md")]
  }
}
