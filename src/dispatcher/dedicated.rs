use std::{
  sync::atomic::{AtomicBool, Ordering},
  thread::{self, JoinHandle, ThreadId},
};

use futures::{
  channel::mpsc::{self, UnboundedSender},
  executor::block_on,
  future::BoxFuture,
  StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{catch_panics, Dispatcher};
use crate::{
  config::Config,
  error::{Error, Result},
  exception::SharedHandler,
  subscription::Disposable,
};

type Job = BoxFuture<'static, ()>;

/// Owns one worker thread that runs submissions strictly in FIFO order.
///
/// Work submitted from the worker thread itself through
/// [`invoke`](super::DispatcherExt::invoke) or
/// [`run_async`](super::DispatcherExt::run_async) runs inline, so a task
/// may wait on more work for the same dispatcher without deadlocking.
/// Fire-and-forget submissions from the worker are queued behind the
/// current task.
pub struct DedicatedThreadDispatcher {
  queue: Mutex<Option<UnboundedSender<Job>>>,
  worker: Mutex<Option<JoinHandle<()>>>,
  thread_id: ThreadId,
  handler: SharedHandler,
  disposed: AtomicBool,
}

impl DedicatedThreadDispatcher {
  pub fn new(name: impl Into<String>, handler: SharedHandler) -> Result<Self> {
    let (tx, mut rx) = mpsc::unbounded::<Job>();
    let worker = thread::Builder::new().name(name.into()).spawn(move || {
      block_on(async move {
        while let Some(job) = rx.next().await {
          job.await;
        }
      })
    })?;
    Ok(DedicatedThreadDispatcher {
      queue: Mutex::new(Some(tx)),
      thread_id: worker.thread().id(),
      worker: Mutex::new(Some(worker)),
      handler,
      disposed: AtomicBool::new(false),
    })
  }

  /// A worker thread named after [`Config::main_thread_name`].
  pub fn from_config(cfg: &Config, handler: SharedHandler) -> Result<Self> {
    Self::new(cfg.main_thread_name.clone(), handler)
  }

  /// Identity of the worker thread.
  pub fn thread_id(&self) -> ThreadId { self.thread_id }
}

impl Dispatcher for DedicatedThreadDispatcher {
  fn spawn(&self, task: BoxFuture<'static, ()>) -> Result<()> {
    let queue = self.queue.lock();
    let tx = queue.as_ref().ok_or(Error::Disposed)?;
    tx.unbounded_send(Box::pin(catch_panics(task, self.handler.clone())))
      .map_err(|_| Error::Disposed)
  }

  #[inline]
  fn is_current(&self) -> bool { thread::current().id() == self.thread_id }

  #[inline]
  fn exception_handler(&self) -> &SharedHandler { &self.handler }
}

impl Disposable for DedicatedThreadDispatcher {
  /// Close the queue; work already queued still runs. Blocks until the
  /// worker has exited, except when called from the worker itself.
  fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    drop(self.queue.lock().take());
    let worker = self.worker.lock().take();
    match worker {
      Some(_) if self.is_current() => debug!("dedicated dispatcher disposed from its own thread"),
      Some(worker) => {
        if worker.join().is_err() {
          warn!("dedicated dispatcher worker exited by panic");
        }
        debug!("dedicated dispatcher disposed");
      }
      None => {}
    }
  }

  #[inline]
  fn is_disposed(&self) -> bool { self.disposed.load(Ordering::Acquire) }
}

impl Drop for DedicatedThreadDispatcher {
  fn drop(&mut self) { self.dispose() }
}
