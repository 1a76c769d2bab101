//! Cross-thread scenarios: many producers, one looper thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use looper_bridge::{
    poll_once, EventLoopHandle, ExecutorConfig, MainThread, PollError, PrepareOptions,
    SerialExecutor,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn executor(label: &str) -> Arc<SerialExecutor> {
    init_tracing();
    let looper = EventLoopHandle::prepare(PrepareOptions::default()).unwrap();
    SerialExecutor::with_config(looper, ExecutorConfig::labeled(label)).unwrap()
}

fn drive_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "looper never reached the expected state");
        match poll_once(Some(Duration::from_millis(10))) {
            Ok(_) | Err(PollError::Timeout) => {}
            Err(err) => panic!("poll failed: {err}"),
        }
    }
}

#[test]
fn concurrent_producers_drain_in_one_pass() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 50;

    let executor = executor("producers");
    let log = Arc::new(Mutex::new(Vec::new()));

    std::thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let executor = Arc::clone(&executor);
            let log = Arc::clone(&log);
            scope.spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let log = Arc::clone(&log);
                    executor
                        .enqueue(move || log.lock().unwrap().push((producer, seq)))
                        .unwrap();
                }
            });
        }
    });

    // Every producer has finished, so a single drain sees the full count.
    poll_once(Some(Duration::from_secs(1))).unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), PRODUCERS * PER_PRODUCER);

    let mut next: HashMap<usize, usize> = HashMap::new();
    for &(producer, seq) in log.iter() {
        let expected = next.entry(producer).or_insert(0);
        assert_eq!(seq, *expected, "producer {producer} ran out of order");
        *expected += 1;
    }
}

#[test]
fn jobs_never_overlap() {
    let executor = executor("overlap");
    let running = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let executor = Arc::clone(&executor);
            let running = Arc::clone(&running);
            let completed = Arc::clone(&completed);
            scope.spawn(move || {
                for _ in 0..25 {
                    let running = Arc::clone(&running);
                    let completed = Arc::clone(&completed);
                    executor
                        .enqueue(move || {
                            assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                            std::thread::yield_now();
                            running.fetch_sub(1, Ordering::SeqCst);
                            completed.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            });
        }
    });

    drive_until(|| completed.load(Ordering::SeqCst) == 100);
}

#[test]
fn producers_keep_enqueuing_while_loop_drains() {
    let executor = executor("streaming");
    let done = Arc::new(AtomicUsize::new(0));

    let producer = {
        let executor = Arc::clone(&executor);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            for _ in 0..200 {
                let done = Arc::clone(&done);
                executor
                    .enqueue(move || {
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                std::thread::sleep(Duration::from_micros(50));
            }
        })
    };

    drive_until(|| done.load(Ordering::SeqCst) == 200);
    producer.join().unwrap();
}

#[test]
fn spawned_tasks_chain_through_the_executor() {
    let executor = executor("tasks");
    let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();

    let consumer = executor.spawn(async move {
        use futures::StreamExt;
        rx.fold(0u32, |acc, n| async move { acc + n }).await
    });

    std::thread::spawn(move || {
        for n in 1..=10 {
            tx.unbounded_send(n).unwrap();
        }
    })
    .join()
    .unwrap();

    drive_until(|| consumer.is_finished());
    assert_eq!(futures::executor::block_on(consumer), 55);
}

#[test]
fn main_thread_executor_shared_and_serves_workers() {
    init_tracing();
    let _looper = EventLoopHandle::prepare(PrepareOptions::default()).unwrap();
    let main = MainThread::new();
    main.initialize().unwrap();

    let served = Arc::new(AtomicUsize::new(0));
    let executors: Vec<Arc<SerialExecutor>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let main = &main;
                let served = Arc::clone(&served);
                scope.spawn(move || {
                    let executor = main.executor().unwrap();
                    executor
                        .enqueue(move || {
                            served.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    executor
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(executors.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    drive_until(|| served.load(Ordering::SeqCst) == 3);

    drop(executors);
    main.deinitialize();
    assert!(main.executor().is_err());
}
