//! Execution-engine invariants: ordering, exclusion, interruption and the
//! promise/future contract.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fedlink::exec::{
    self, offload, promise, Dock, Mutex, Pool, PoolOpts, Queue, Runtime, SharedMutex, SpawnOpts,
    View,
};
use fedlink::Config;

fn run<T: 'static>(main: impl Future<Output = T> + 'static) -> T {
    Runtime::new(Config::default()).expect("runtime").run(main)
}

#[test]
fn future_value_retrieved_exactly_once() {
    run(async {
        let (p, f) = promise::<u32>();
        p.set_value(42).unwrap();
        assert_eq!(f.get().await.unwrap(), 42);
        let err = f.get().await.unwrap_err();
        assert!(!err.is_broken_promise());
        assert!(format!("{}", err).contains("already retrieved"));
    });
}

#[test]
fn future_get_waits_for_setter() {
    run(async {
        let (p, f) = promise::<&'static str>();
        let task = exec::spawn(SpawnOpts::default(), async move {
            exec::sleep(Duration::from_millis(20)).await.unwrap();
            p.set_value("ready").unwrap();
        });
        assert_eq!(f.get().await.unwrap(), "ready");
        task.join().await.unwrap();
    });
}

#[test]
fn dropping_last_promise_breaks_the_future() {
    run(async {
        let (p, f) = promise::<u32>();
        let p2 = p.clone();
        drop(p);
        assert!(!f.is_ready(), "a live co-promise must keep it pending");
        drop(p2);
        let err = f.get().await.unwrap_err();
        assert!(err.is_broken_promise());
    });
}

#[test]
fn second_set_value_is_rejected() {
    run(async {
        let (p, f) = promise::<u32>();
        p.set_value(1).unwrap();
        assert!(p.set_value(2).is_err());
        assert_eq!(f.get().await.unwrap(), 1);
    });
}

#[test]
fn dock_wakes_waiters_in_fifo_order() {
    run(async {
        let dock = Rc::new(Dock::new());
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..5 {
            let dock = dock.clone();
            let order = order.clone();
            tasks.push(exec::spawn(SpawnOpts::default(), async move {
                dock.wait().await.unwrap();
                order.borrow_mut().push(i);
            }));
        }
        // let every waiter park
        while dock.waiting() < 5 {
            exec::yield_now().await.unwrap();
        }
        for _ in 0..5 {
            dock.notify_one();
        }
        for task in tasks {
            task.join().await.unwrap();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    });
}

#[test]
fn dock_timed_wait_reports_timeout_and_leaves_no_waiter() {
    run(async {
        let dock = Dock::new();
        let notified = dock.wait_for(Duration::from_millis(20)).await.unwrap();
        assert!(!notified);
        assert_eq!(dock.waiting(), 0);
    });
}

#[test]
fn interrupted_wait_leaves_no_waiter() {
    run(async {
        let dock = Rc::new(Dock::new());
        let waiter = {
            let dock = dock.clone();
            exec::spawn(SpawnOpts::default(), async move {
                let err = dock.wait().await.unwrap_err();
                assert!(err.is_interrupted());
            })
        };
        while dock.waiting() < 1 {
            exec::yield_now().await.unwrap();
        }
        waiter.interrupt();
        waiter.join().await.unwrap();
        assert_eq!(dock.waiting(), 0);
    });
}

#[test]
fn interrupted_waiter_passes_a_delivered_notify_along() {
    run(async {
        let dock = Rc::new(Dock::new());
        let hits = Rc::new(Cell::new(0));
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let dock = dock.clone();
            let hits = hits.clone();
            tasks.push(exec::spawn(SpawnOpts::default(), async move {
                if dock.wait().await.is_ok() {
                    hits.set(hits.get() + 1);
                }
            }));
        }
        while dock.waiting() < 2 {
            exec::yield_now().await.unwrap();
        }
        // notify the head, then interrupt it before it can run: the wake
        // must be handed to the second waiter
        dock.notify_one();
        tasks[0].interrupt();
        for task in tasks {
            task.join().await.unwrap();
        }
        assert_eq!(hits.get(), 1);
        assert_eq!(dock.waiting(), 0);
    });
}

#[test]
fn mutex_is_exclusive_and_fifo() {
    run(async {
        let mutex = Rc::new(Mutex::new());
        let active = Rc::new(Cell::new(0usize));
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..4 {
            let mutex = mutex.clone();
            let active = active.clone();
            let order = order.clone();
            tasks.push(exec::spawn(SpawnOpts::default(), async move {
                let _guard = mutex.lock().await.unwrap();
                order.borrow_mut().push(i);
                active.set(active.get() + 1);
                assert_eq!(active.get(), 1, "two tasks inside the mutex");
                exec::yield_now().await.unwrap();
                exec::yield_now().await.unwrap();
                active.set(active.get() - 1);
            }));
        }
        for task in tasks {
            task.join().await.unwrap();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
        assert!(!mutex.locked());
        assert_eq!(mutex.waiting(), 0);
    });
}

#[test]
fn mutex_try_lock_and_timeout() {
    run(async {
        let mutex = Rc::new(Mutex::new());
        let guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
        let err = mutex
            .try_lock_for(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mutex.waiting(), 0);
        drop(guard);
        assert!(mutex.try_lock().is_some());
    });
}

#[test]
fn shared_mutex_readers_exclude_writer() {
    run(async {
        let sm = Rc::new(SharedMutex::new());
        let r1 = sm.lock_shared().await.unwrap();
        let r2 = sm.lock_shared().await.unwrap();
        assert_eq!(sm.shares(), 2);
        assert!(sm.try_lock().is_none());

        let writer = {
            let sm = sm.clone();
            exec::spawn(SpawnOpts::default(), async move {
                let _w = sm.lock().await.unwrap();
                assert_eq!(sm.shares(), 0);
            })
        };
        exec::yield_now().await.unwrap();
        drop(r1);
        drop(r2);
        writer.join().await.unwrap();
        assert!(!sm.unique());
    });
}

#[test]
fn shared_mutex_upgrade_path() {
    run(async {
        let sm = Rc::new(SharedMutex::new());
        let reader = sm.lock_shared().await.unwrap();
        let upgrade = sm.lock_upgrade().await.unwrap();
        assert!(sm.try_lock_upgrade().is_none(), "one upgrader at a time");

        let release = exec::spawn(SpawnOpts::default(), async move {
            exec::sleep(Duration::from_millis(10)).await.unwrap();
            drop(reader);
        });
        let writer = upgrade.upgrade().await.unwrap();
        assert!(sm.unique());
        let reader = writer.downgrade();
        assert_eq!(sm.shares(), 1);
        drop(reader);
        release.join().await.unwrap();
    });
}

#[test]
fn queue_fifo_and_timeout() {
    run(async {
        let queue: Rc<Queue<u32>> = Rc::new(Queue::unbounded());
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        assert_eq!(queue.pop().await.unwrap(), 1);
        assert_eq!(queue.pop().await.unwrap(), 2);
        let err = queue.pop_for(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is_timeout());
    });
}

#[test]
fn bounded_queue_push_waits_for_room() {
    run(async {
        let queue: Rc<Queue<u32>> = Rc::new(Queue::bounded(1));
        queue.push(1).await.unwrap();
        assert!(queue.try_push(2).is_err());

        let producer = {
            let queue = queue.clone();
            exec::spawn(SpawnOpts::default(), async move {
                queue.push(2).await.unwrap();
            })
        };
        exec::yield_now().await.unwrap();
        assert_eq!(queue.len(), 1, "producer must be parked on the bound");
        assert_eq!(queue.pop().await.unwrap(), 1);
        producer.join().await.unwrap();
        assert_eq!(queue.pop().await.unwrap(), 2);
    });
}

#[test]
fn pool_runs_work_and_reports_counters() {
    run(async {
        let pool = Pool::new(PoolOpts {
            name: "test".into(),
            size: 2,
            queue_max: None,
        });
        let fut = pool.async_(|| 6 * 7).await.unwrap();
        assert_eq!(fut.get().await.unwrap(), 42);

        let seen = Rc::new(Cell::new(0));
        for _ in 0..8 {
            let seen = seen.clone();
            pool.push(move || seen.set(seen.get() + 1)).await.unwrap();
        }
        while seen.get() < 8 {
            exec::yield_now().await.unwrap();
        }
        assert_eq!(pool.running(), 2);
        pool.terminate();
        pool.join().await.unwrap();
        assert_eq!(pool.running(), 0);
    });
}

#[test]
fn offload_runs_on_another_thread() {
    run(async {
        let main_thread = std::thread::current().id();
        let thread = offload(move || std::thread::current().id()).await.unwrap();
        assert_ne!(thread, main_thread);

        let sum = offload(|| (1..=100).sum::<u32>()).await.unwrap();
        assert_eq!(sum, 5050);
    });
}

#[test]
fn view_posts_to_current_waiters_only() {
    run(async {
        let view: Rc<View<u32>> = Rc::new(View::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let view = view.clone();
            let seen = seen.clone();
            tasks.push(exec::spawn(SpawnOpts::default(), async move {
                let value = view.wait().await.unwrap();
                seen.borrow_mut().push(*value);
            }));
        }
        while view.waiting() < 3 {
            exec::yield_now().await.unwrap();
        }
        let observers = view.post(7).await.unwrap();
        assert_eq!(observers, 3);
        for task in tasks {
            task.join().await.unwrap();
        }
        assert_eq!(*seen.borrow(), vec![7, 7, 7]);
        // nobody waiting now
        assert_eq!(view.post(8).await.unwrap(), 0);
    });
}

#[test]
fn sleep_and_timers() {
    run(async {
        let start = Instant::now();
        exec::sleep(Duration::from_millis(30)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    });
}

#[test]
fn interrupt_cuts_a_sleep_short() {
    run(async {
        let start = Instant::now();
        let sleeper = exec::spawn(SpawnOpts::default(), async {
            let err = exec::sleep(Duration::from_secs(30)).await.unwrap_err();
            assert!(err.is_interrupted());
        });
        exec::yield_now().await.unwrap();
        sleeper.interrupt();
        sleeper.join().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn interrupt_self_raises_at_the_next_point() {
    run(async {
        exec::interrupt_self();
        assert!(exec::interruption_requested());
        let err = exec::interruption_point().unwrap_err();
        assert!(err.is_interrupted());
        // the request was consumed
        exec::interruption_point().unwrap();
    });
}

#[test]
fn uninterruptible_defers_delivery() {
    run(async {
        let entered = Rc::new(Cell::new(false));
        let flag = entered.clone();
        let task = exec::spawn(SpawnOpts::default(), async move {
            let guard = exec::Uninterruptible::enter();
            flag.set(true);
            // interruption must not fire inside the scope
            exec::sleep(Duration::from_millis(30)).await.unwrap();
            let err = guard.end().unwrap_err();
            assert!(err.is_interrupted());
        });
        while !entered.get() {
            exec::yield_now().await.unwrap();
        }
        task.interrupt();
        task.join().await.unwrap();
    });
}

#[test]
fn uninterruptible_nothrow_swallows_the_request() {
    run(async {
        let task = exec::spawn(SpawnOpts::default(), async move {
            {
                let _quiet = exec::UninterruptibleNothrow::enter();
                exec::sleep(Duration::from_millis(30)).await.unwrap();
            }
            // the request from inside the scope was swallowed
            exec::interruption_point().unwrap();
        });
        exec::yield_now().await.unwrap();
        task.interrupt();
        task.join().await.unwrap();
    });
}

#[test]
fn yield_now_is_fair() {
    run(async {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            tasks.push(exec::spawn(SpawnOpts::default(), async move {
                for round in 0..3 {
                    order.borrow_mut().push((round, i));
                    exec::yield_now().await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.join().await.unwrap();
        }
        // rounds interleave: all first entries precede all second entries
        let order = order.borrow();
        let first_of_round_1 = order.iter().position(|(round, _)| *round == 1).unwrap();
        assert!(order[..first_of_round_1]
            .iter()
            .all(|(round, _)| *round == 0));
    });
}
