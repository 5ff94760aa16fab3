use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{emit, Failure, Observer};
use crate::event::Payload;

#[derive(Default)]
struct Counters {
  in_flight: AtomicUsize,
  buffered: AtomicUsize,
  delivered: AtomicUsize,
  dropped: AtomicUsize,
}

/// Admission settings and counters of one `limit` stage.
///
/// At most `max_concurrent` deliveries run at once; further events wait in a
/// FIFO buffer of `max_buffer` entries. An event arriving while the buffer
/// is full is dropped (drop-newest) and counted in [`dropped`](Self::dropped).
#[derive(Clone)]
pub struct LimitGate {
  max_concurrent: usize,
  max_buffer: usize,
  counters: Arc<Counters>,
}

impl LimitGate {
  /// `max_concurrent` is at least one.
  pub fn new(max_concurrent: usize, max_buffer: usize) -> Self {
    LimitGate { max_concurrent: max_concurrent.max(1), max_buffer, counters: Arc::default() }
  }

  #[inline]
  pub fn max_concurrent(&self) -> usize { self.max_concurrent }

  #[inline]
  pub fn max_buffer(&self) -> usize { self.max_buffer }

  /// Deliveries running right now.
  pub fn in_flight(&self) -> usize { self.counters.in_flight.load(Ordering::Acquire) }

  /// Events waiting for a free slot.
  pub fn buffered(&self) -> usize { self.counters.buffered.load(Ordering::Acquire) }

  /// Deliveries completed so far.
  pub fn delivered(&self) -> usize { self.counters.delivered.load(Ordering::Acquire) }

  /// Events discarded because the buffer was full.
  pub fn dropped(&self) -> usize { self.counters.dropped.load(Ordering::Acquire) }
}

impl std::fmt::Debug for LimitGate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LimitGate")
      .field("max_concurrent", &self.max_concurrent)
      .field("max_buffer", &self.max_buffer)
      .field("in_flight", &self.in_flight())
      .field("buffered", &self.buffered())
      .field("dropped", &self.dropped())
      .finish()
  }
}

struct Slots<T> {
  running: usize,
  queue: VecDeque<T>,
}

/// The typed admission queue behind a [`LimitGate`].
pub(crate) struct Admission<T> {
  gate: LimitGate,
  slots: Mutex<Slots<T>>,
}

impl<T> Admission<T> {
  pub(crate) fn new(gate: LimitGate) -> Arc<Self> {
    Arc::new(Admission { gate, slots: Mutex::new(Slots { running: 0, queue: VecDeque::new() }) })
  }

  /// Take a slot for `value`, or buffer or drop it when none is free.
  ///
  /// A free slot goes to the oldest buffered value first; `value` then
  /// waits behind it.
  pub(crate) fn admit(self: &Arc<Self>, value: T) -> Option<Turn<T>> {
    let counters = &self.gate.counters;
    let mut slots = self.slots.lock();
    if slots.running < self.gate.max_concurrent {
      slots.running += 1;
      counters.in_flight.fetch_add(1, Ordering::AcqRel);
      let first = match slots.queue.pop_front() {
        Some(oldest) => {
          slots.queue.push_back(value);
          oldest
        }
        None => value,
      };
      Some(Turn { admission: self.clone(), first: Some(first), done: false })
    } else if slots.queue.len() < self.gate.max_buffer {
      slots.queue.push_back(value);
      counters.buffered.fetch_add(1, Ordering::AcqRel);
      None
    } else {
      counters.dropped.fetch_add(1, Ordering::AcqRel);
      trace!(max_buffer = self.gate.max_buffer, "limit buffer full, event dropped");
      None
    }
  }

  /// Record one finished delivery and hand out the next buffered value, or
  /// give the slot back.
  fn finish_one(&self) -> Option<T> {
    let counters = &self.gate.counters;
    let mut slots = self.slots.lock();
    counters.delivered.fetch_add(1, Ordering::AcqRel);
    match slots.queue.pop_front() {
      Some(value) => {
        counters.buffered.fetch_sub(1, Ordering::AcqRel);
        Some(value)
      }
      None => {
        Self::release(&mut *slots, counters);
        None
      }
    }
  }

  fn release(slots: &mut Slots<T>, counters: &Counters) {
    slots.running -= 1;
    counters.in_flight.fetch_sub(1, Ordering::AcqRel);
  }
}

/// A slot held in a limit stage.
///
/// [`next`](Turn::next) yields the admitted value, then buffered values
/// until the queue is empty, at which point the slot is returned. A turn
/// dropped before that (a panicking delivery, an abandoned future) returns
/// the slot on drop; its buffered values go to the next admitted event.
pub(crate) struct Turn<T> {
  admission: Arc<Admission<T>>,
  first: Option<T>,
  done: bool,
}

impl<T> Turn<T> {
  pub(crate) fn next(&mut self) -> Option<T> {
    if let Some(first) = self.first.take() {
      return Some(first);
    }
    if self.done {
      return None;
    }
    let next = self.admission.finish_one();
    self.done = next.is_none();
    next
  }
}

impl<T> Drop for Turn<T> {
  fn drop(&mut self) {
    if !self.done {
      warn!("limit slot released by an unfinished delivery");
      let mut slots = self.admission.slots.lock();
      Admission::release(&mut *slots, &self.admission.gate.counters);
    }
  }
}

impl<T: Payload> Observer<T> {
  /// Admission control for chains fed by several publishing threads.
  pub fn limit(self, max_concurrent: usize, max_buffer: usize) -> Observer<T> {
    self.limit_with(LimitGate::new(max_concurrent, max_buffer))
  }

  /// `limit` reporting through `gate`, which must not be shared with another
  /// stage.
  ///
  /// The publisher holding a slot also delivers the events buffered while it
  /// ran; their failures come back with its own.
  pub fn limit_with(self, gate: LimitGate) -> Observer<T> {
    let admission = Admission::new(gate);
    self.pipe(move |v, out, _| {
      let Some(mut turn) = admission.admit(v) else { return Ok(()) };
      let mut failed: Option<Failure> = None;
      while let Some(value) = turn.next() {
        if let Err(failure) = emit(out, value) {
          match failed.as_mut() {
            None => failed = Some(failure),
            Some(first) => first.absorb(failure),
          }
        }
      }
      failed.map_or(Ok(()), Err)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{error::Error, event::EventSource, exception::SharedHandler};
  use std::time::Duration;

  #[test]
  fn drop_newest_when_full() {
    let gate = LimitGate::new(1, 1);
    let admission = Admission::new(gate.clone());
    let mut turn = admission.admit(1).unwrap();
    assert!(admission.admit(2).is_none());
    assert!(admission.admit(3).is_none());
    assert_eq!((gate.in_flight(), gate.buffered(), gate.dropped()), (1, 1, 1));

    assert_eq!(turn.next(), Some(1));
    assert_eq!(turn.next(), Some(2));
    assert_eq!(turn.next(), None);
    assert_eq!((gate.in_flight(), gate.buffered(), gate.delivered()), (0, 0, 2));
    drop(turn);
    assert_eq!(gate.in_flight(), 0);
    assert!(admission.admit(4).is_some());
  }

  #[test]
  fn zero_concurrency_means_one() {
    let gate = LimitGate::new(0, 0);
    assert_eq!(gate.max_concurrent(), 1);
    let admission = Admission::new(gate);
    let _turn = admission.admit("a").unwrap();
    assert!(admission.admit("b").is_none());
  }

  #[test]
  fn abandoned_turn_gives_its_slot_back() {
    let gate = LimitGate::new(1, 2);
    let admission = Admission::new(gate.clone());
    let mut turn = admission.admit(1).unwrap();
    assert!(admission.admit(2).is_none());
    assert_eq!(turn.next(), Some(1));
    drop(turn);
    assert_eq!((gate.in_flight(), gate.buffered()), (0, 1));

    // The value left in the buffer is delivered before the new one.
    let mut turn = admission.admit(3).unwrap();
    assert_eq!(turn.next(), Some(2));
    assert_eq!(turn.next(), Some(3));
    assert_eq!(turn.next(), None);
    assert_eq!((gate.in_flight(), gate.buffered(), gate.dropped()), (0, 0, 0));
  }

  #[test]
  fn panicking_delivery_does_not_close_the_stage() {
    let source = EventSource::<i32>::new();
    let gate = LimitGate::new(1, 0);
    let seen = Arc::new(Mutex::new(vec![]));
    let c_seen = seen.clone();
    source.observable().observe().limit_with(gate.clone()).on_each(move |v| {
      if *v == 1 {
        panic!("delivery of 1 failed");
      }
      c_seen.lock().push(*v);
    });

    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| source.publish(1)));
    assert!(panicked.is_err());
    assert_eq!(gate.in_flight(), 0);

    source.publish(2).unwrap();
    source.publish(3).unwrap();
    assert_eq!(*seen.lock(), vec![2, 3]);
    assert_eq!(gate.dropped(), 0);
  }

  #[test]
  fn buffered_failures_reach_the_exception_handler() {
    let reported = Arc::new(Mutex::new(vec![]));
    let c_reported = reported.clone();
    let handler: SharedHandler = Arc::new(move |e: &Error| c_reported.lock().push(e.to_string()));
    let source = Arc::new(EventSource::<i32>::with_exception_handler(handler));
    let gate = LimitGate::new(1, 4);
    source.observable().observe().limit_with(gate.clone()).try_on_each(|v| {
      std::thread::sleep(Duration::from_millis(30));
      Err(Error::msg(format!("fail {v}")))
    });

    let first = {
      let source = source.clone();
      std::thread::spawn(move || source.publish(1))
    };
    while gate.in_flight() == 0 {
      std::thread::yield_now();
    }
    source.publish(2).unwrap();
    first.join().unwrap().unwrap();

    assert_eq!(*reported.lock(), vec!["fail 1".to_string(), "fail 2".to_string()]);
  }

  #[test]
  fn buffered_failures_meet_upstream_catch() {
    let source = Arc::new(EventSource::<i32>::new());
    let gate = LimitGate::new(1, 4);
    let caught = Arc::new(Mutex::new(vec![]));
    let c_caught = caught.clone();
    source
      .observable()
      .observe()
      .catch(move |_, c| c_caught.lock().push(c.error().to_string()))
      .limit_with(gate.clone())
      .try_on_each(|v| {
        std::thread::sleep(Duration::from_millis(30));
        Err(Error::msg(format!("fail {v}")))
      });

    let first = {
      let source = source.clone();
      std::thread::spawn(move || source.publish(1))
    };
    while gate.in_flight() == 0 {
      std::thread::yield_now();
    }
    source.publish(2).unwrap();
    first.join().unwrap().unwrap();

    assert_eq!(*caught.lock(), vec!["fail 1".to_string(), "fail 2".to_string()]);
  }

  #[test]
  fn concurrent_publishers_share_one_slot() {
    let source = Arc::new(EventSource::<i32>::new());
    let gate = LimitGate::new(1, 0);
    let seen = Arc::new(Mutex::new(vec![]));
    let c_seen = seen.clone();
    source.observable().observe().limit_with(gate.clone()).on_each(move |v| {
      std::thread::sleep(Duration::from_millis(100));
      c_seen.lock().push(*v);
    });

    let first = {
      let source = source.clone();
      std::thread::spawn(move || source.publish(1))
    };
    while gate.in_flight() == 0 {
      std::thread::yield_now();
    }
    source.publish(2).unwrap();
    first.join().unwrap().unwrap();

    assert_eq!(*seen.lock(), vec![1]);
    assert_eq!((gate.delivered(), gate.dropped()), (1, 1));
  }

  #[test]
  fn buffered_events_run_on_the_admitted_thread() {
    let source = Arc::new(EventSource::<i32>::new());
    let gate = LimitGate::new(1, 4);
    let seen = Arc::new(Mutex::new(vec![]));
    let c_seen = seen.clone();
    source.observable().observe().limit_with(gate.clone()).try_on_each(move |v| {
      std::thread::sleep(Duration::from_millis(30));
      c_seen.lock().push((*v, std::thread::current().id()));
      if *v == 1 { Err(Error::msg("first fails")) } else { Ok(()) }
    });

    let first = {
      let source = source.clone();
      std::thread::spawn(move || (source.publish(1), std::thread::current().id()))
    };
    while gate.in_flight() == 0 {
      std::thread::yield_now();
    }
    source.publish(2).unwrap();
    source.publish(3).unwrap();
    let (result, publisher) = first.join().unwrap();

    assert!(result.is_err());
    let seen = seen.lock();
    assert_eq!(seen.iter().map(|(v, _)| *v).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(seen.iter().all(|(_, id)| *id == publisher));
    assert_eq!(gate.dropped(), 0);
  }
}
