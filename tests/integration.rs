//! Integration tests for mvvm-rx
//!
//! Exercises sources, observer chains, dispatchers and scopes together the
//! way a view-model layer uses them.

use std::{
  collections::HashSet,
  sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  },
  thread,
  time::{Duration, Instant},
};

use mvvm_rx::prelude::*;
use parking_lot::Mutex;

fn log<T>() -> Arc<Mutex<Vec<T>>> { Arc::new(Mutex::new(Vec::new())) }

fn quiet() -> SharedHandler { Arc::new(LogExceptionHandler) }

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

#[test]
fn publish_reaches_every_callback_in_order() {
  let source = EventSource::<usize>::new();
  let calls = log();
  for i in 0..10 {
    let calls = calls.clone();
    source.observable().subscribe(move |v| calls.lock().push((i, v)));
  }
  source.publish(7).unwrap();
  assert_eq!(*calls.lock(), (0..10).map(|i| (i, 7)).collect::<Vec<_>>());
}

#[test]
fn publish_survives_concurrent_subscribe_and_dispose() {
  const EVENTS: usize = 2_000;
  const CHURNERS: usize = 4;

  let source = Arc::new(EventSource::<usize>::new());
  let stable: Vec<_> = (0..4)
    .map(|_| {
      let seen = log();
      let c_seen = seen.clone();
      source.observable().observe().on_each(move |v| c_seen.lock().push(*v));
      seen
    })
    .collect();

  let stop = Arc::new(AtomicBool::new(false));
  let started = Arc::new(AtomicUsize::new(0));
  let churners: Vec<_> = (0..CHURNERS)
    .map(|_| {
      let (observable, stop, started) = (source.observable(), stop.clone(), started.clone());
      thread::spawn(move || {
        let mut first = true;
        while !stop.load(Ordering::Acquire) {
          let chain = observable.observe().on_each(|_| {});
          let sub = observable.subscribe(|_| {});
          sub.dispose();
          chain.dispose();
          if first {
            started.fetch_add(1, Ordering::AcqRel);
            first = false;
          }
        }
      })
    })
    .collect();

  while started.load(Ordering::Acquire) < CHURNERS {
    thread::yield_now();
  }
  let publisher = {
    let source = source.clone();
    thread::spawn(move || {
      for v in 0..EVENTS {
        source.publish(v).unwrap();
      }
    })
  };
  publisher.join().unwrap();
  stop.store(true, Ordering::Release);
  for churner in churners {
    churner.join().unwrap();
  }

  let expected: Vec<usize> = (0..EVENTS).collect();
  for seen in stable {
    assert_eq!(*seen.lock(), expected);
  }
  assert_eq!(source.subscriber_count(), 4);
}

#[test]
fn disposing_one_observer_leaves_siblings() {
  // Test: A, B, C on one source; dispose B; publish once.
  let source = EventSource::<&'static str>::new();
  let (a, b, c) = (log(), log(), log());
  let (ca, cb, cc) = (a.clone(), b.clone(), c.clone());
  let _a = source.observable().observe().on_each(move |v| ca.lock().push(*v));
  let b_chain = source.observable().observe().on_each(move |v| cb.lock().push(*v));
  let _c = source.observable().observe().on_each(move |v| cc.lock().push(*v));

  b_chain.dispose();
  b_chain.dispose();
  source.publish("event").unwrap();

  assert_eq!(a.lock().len(), 1);
  assert_eq!(b.lock().len(), 0);
  assert_eq!(c.lock().len(), 1);
}

#[test]
fn once_then_on_each() {
  let source = EventSource::<i32>::new();
  let list = log();
  let c_list = list.clone();
  source.observable().observe().once().on_each(move |v| c_list.lock().push(*v));
  for v in [1, 2, 3] {
    source.publish(v).unwrap();
  }
  assert_eq!(*list.lock(), vec![1]);
}

#[test]
fn until_with_and_without_continue() {
  for (continue_on_dispose, expected) in [
    (false, vec!["Hello", "Hello", "stop"]),
    (true, vec!["Hello", "Hello", "stop", "stop"]),
  ] {
    let source = EventSource::<&'static str>::new();
    let seen = log();
    let (before, after) = (seen.clone(), seen.clone());
    source
      .observable()
      .observe()
      .on_each(move |v| before.lock().push(*v))
      .until(|v| *v == "stop", continue_on_dispose)
      .on_each(move |v| after.lock().push(*v));
    for v in ["Hello", "stop", "World"] {
      source.publish(v).unwrap();
    }
    assert_eq!(*seen.lock(), expected);
  }
}

#[test]
fn unhandled_catch_chain_reaches_exception_hub() {
  // Test: every catch passes, so the hub sees the failure.
  let hub = ExceptionHub::new();
  let hub_seen = log();
  let c_hub_seen = hub_seen.clone();
  hub.observable().subscribe(move |e: Error| c_hub_seen.lock().push(e.to_string()));

  let source = EventSource::<i32>::with_exception_handler(hub.as_handler());
  let order = log();
  let (first, second) = (order.clone(), order.clone());
  source
    .observable()
    .observe()
    .catch(move |_, c| {
      first.lock().push("first");
      c.handled = false;
    })
    .catch(move |_, c| {
      second.lock().push("second");
      c.handled = false;
    })
    .try_map(|v| if v < 0 { Err(Error::msg("negative")) } else { Ok(v) })
    .on_each(|_| {});

  source.publish(1).unwrap();
  source.publish(-1).unwrap();

  assert_eq!(*order.lock(), vec!["first", "second"]);
  assert_eq!(*hub_seen.lock(), vec!["negative".to_string()]);
  assert_eq!(hub.unhandled_count(), 1);
}

#[test]
fn debounce_delivers_last_of_burst_after_delay() {
  init_tracing();
  let main = Arc::new(DedicatedThreadDispatcher::new("debounce-main", quiet()).unwrap());
  let source = EventSource::<u32>::new();
  let delivered = log();
  let c_delivered = delivered.clone();
  let delay = Duration::from_secs(1);
  source
    .observable()
    .observe()
    .debounce(delay, main.clone())
    .on_each(move |v| c_delivered.lock().push((*v, Instant::now())));

  let mut last = Instant::now();
  for v in 0..10 {
    last = Instant::now();
    source.publish(v).unwrap();
    thread::sleep(Duration::from_millis(10));
  }
  thread::sleep(Duration::from_millis(1500));
  main.invoke(|| Ok(())).unwrap();

  let delivered = delivered.lock();
  assert_eq!(delivered.len(), 1);
  assert_eq!(delivered[0].0, 9);
  assert!(delivered[0].1.duration_since(last) + Duration::from_millis(5) >= delay);
}

#[test]
fn limit_one_without_buffer_drops_the_second_event() {
  // Test: two events raised concurrently, each delivery takes 500ms.
  let pool: Arc<dyn Dispatcher> = Arc::new(ThreadPoolDispatcher::new(quiet()).unwrap());
  let source = EventSource::<i32>::new();
  let gate = LimitGate::new(1, 0);
  let delivered = log();
  let c_delivered = delivered.clone();
  source.observable().observe().to_async(pool).limit_with(gate.clone()).on_each_async(move |v| {
    let delivered = c_delivered.clone();
    async move {
      futures_time::task::sleep(Duration::from_millis(500).into()).await;
      delivered.lock().push(v);
    }
  });

  source.publish(1).unwrap();
  source.publish(2).unwrap();
  thread::sleep(Duration::from_millis(800));

  assert_eq!(delivered.lock().len(), 1);
  assert_eq!(gate.dropped(), 1);
  assert_eq!(gate.in_flight(), 0);
}

#[test]
fn limit_recovers_after_a_panicking_delivery() {
  let pool: Arc<dyn Dispatcher> = Arc::new(ThreadPoolDispatcher::new(quiet()).unwrap());
  let source = EventSource::<i32>::new();
  let gate = LimitGate::new(1, 0);
  let seen = log();
  let c_seen = seen.clone();
  source.observable().observe().to_async(pool).limit_with(gate.clone()).on_each(move |v| {
    if *v == 1 {
      panic!("delivery of 1 failed");
    }
    c_seen.lock().push(*v);
  });

  for v in 1..=4 {
    source.publish(v).unwrap();
    thread::sleep(Duration::from_millis(100));
  }

  assert_eq!(*seen.lock(), vec![2, 3, 4]);
  assert_eq!(gate.in_flight(), 0);
  assert_eq!(gate.dropped(), 0);
}

#[test]
fn disposed_scope_dispatcher_fails_as_disposed() {
  let root = LifetimeScope::root(Config::default(), quiet()).unwrap();
  let vm = root.child("vm");
  vm.main().dispose();
  assert!(matches!(vm.main().run(|_| Ok(())), Err(Error::Disposed)));
  assert!(matches!(vm.background().run(|_| Ok(())), Err(Error::Cancelled)));
  assert!(root.background().run(|_| Ok(())).is_ok());
  root.dispose().unwrap();
}

#[test]
fn transaction_open_close_cycle() {
  let tx = Transaction::new();
  let closed = Arc::new(AtomicUsize::new(0));
  let c_closed = closed.clone();
  tx.on_closed(move || {
    c_closed.fetch_add(1, Ordering::SeqCst);
  });
  assert!(!tx.is_open());

  let a = tx.start();
  let b = tx.start();
  assert!(tx.is_open());
  drop(a);
  assert_eq!(closed.load(Ordering::SeqCst), 0);
  b.release();
  assert!(!tx.is_open());
  assert_eq!(closed.load(Ordering::SeqCst), 1);

  drop(tx.start());
  assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn dedicated_thread_serves_every_submitter() {
  let main = Arc::new(DedicatedThreadDispatcher::new("dedicated-main", quiet()).unwrap());
  let ids = Arc::new(Mutex::new(HashSet::new()));
  let handles: Vec<_> = (0..8)
    .map(|_| {
      let (main, ids) = (main.clone(), ids.clone());
      thread::spawn(move || {
        for _ in 0..10 {
          let id = main.invoke(|| Ok(thread::current().id())).unwrap();
          ids.lock().insert(id);
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }
  let ids = ids.lock();
  assert_eq!(ids.len(), 1);
  assert!(ids.contains(&main.thread_id()));
}

#[test]
fn dedicated_thread_reentrancy_does_not_deadlock() {
  let main = Arc::new(DedicatedThreadDispatcher::new("reentrant-main", quiet()).unwrap());
  let inner = main.clone();
  let result = main
    .invoke(move || {
      let nested = inner.clone();
      let depth_two = inner.invoke(move || nested.invoke(|| Ok(2)))?;
      Ok(depth_two + 1)
    })
    .unwrap();
  assert_eq!(result, 3);
}

#[test]
fn view_model_lifecycle() {
  // Test: a view-model scope publishing lifecycle events, doing background
  // work and tearing down.
  #[derive(Clone, Debug, PartialEq)]
  enum Lifecycle {
    Activated,
    Deactivated,
  }

  let root = LifetimeScope::root(Config::default(), quiet()).unwrap();
  let vm = root.child("vm");
  let lifecycle = EventSource::<SenderArgs<String, Lifecycle>>::new();
  let seen = log();
  let c_seen = seen.clone();
  vm.observers().observe(&lifecycle.observable(), move |e: SenderArgs<String, Lifecycle>| {
    c_seen.lock().push(e.args)
  });

  let loaded = Arc::new(AtomicUsize::new(0));
  let c_loaded = loaded.clone();
  let value = futures::executor::block_on(vm.background().run_async(move |scope| {
    scope.check()?;
    c_loaded.fetch_add(1, Ordering::SeqCst);
    Ok("data")
  }))
  .unwrap();
  assert_eq!(value, "data");

  lifecycle.publish_from("vm".to_string(), Lifecycle::Activated).unwrap();
  vm.dispose().unwrap();
  lifecycle.publish_from("vm".to_string(), Lifecycle::Deactivated).unwrap();

  assert_eq!(*seen.lock(), vec![Lifecycle::Activated]);
  assert_eq!(loaded.load(Ordering::SeqCst), 1);
  assert!(!root.has_ended());
  root.dispose().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_source_awaits_each_observer_in_turn() {
  let source = AsyncEventSource::<i32>::new();
  let order = log();
  for tag in ["a", "b"] {
    let order = order.clone();
    source.observable().observe().on_each_async(move |v| {
      let order = order.clone();
      async move {
        order.lock().push(format!("{tag}{v} start"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().push(format!("{tag}{v} end"));
      }
    });
  }
  source.publish(1).await.unwrap();
  assert_eq!(*order.lock(), vec!["a1 start", "a1 end", "b1 start", "b1 end"]);
}
