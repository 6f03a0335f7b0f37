//! Worker-task pool draining a closure queue.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::Result;

use super::promise::{promise, Future};
use super::queue::Queue;
use super::task::{spawn, SpawnOpts, TaskHandle};

enum Work {
    Run(Box<dyn FnOnce()>),
    Exit,
}

#[derive(Clone)]
pub struct PoolOpts {
    pub name: String,
    /// Workers spawned at construction.
    pub size: usize,
    /// Submission queue bound; `None` leaves submissions unbounded.
    pub queue_max: Option<usize>,
}

impl Default for PoolOpts {
    fn default() -> PoolOpts {
        PoolOpts {
            name: "pool".into(),
            size: 0,
            queue_max: None,
        }
    }
}

/// A set of worker tasks pulling closures off an internal queue.
pub struct Pool {
    inner: Rc<Inner>,
    workers: RefCell<Vec<TaskHandle>>,
}

struct Inner {
    name: String,
    queue: Queue<Work>,
    running: Cell<usize>,
    working: Cell<usize>,
    terminated: Cell<bool>,
}

impl Pool {
    pub fn new(opts: PoolOpts) -> Pool {
        let queue = match opts.queue_max {
            Some(bound) => Queue::bounded(bound),
            None => Queue::unbounded(),
        };
        let pool = Pool {
            inner: Rc::new(Inner {
                name: opts.name,
                queue,
                running: Cell::new(0),
                working: Cell::new(0),
                terminated: Cell::new(false),
            }),
            workers: RefCell::new(Vec::new()),
        };
        pool.add(opts.size);
        pool
    }

    /// Spawn `count` additional workers.
    pub fn add(&self, count: usize) {
        for _ in 0..count {
            let inner = self.inner.clone();
            let seq = self.workers.borrow().len();
            let name = format!("{}[{}]", inner.name, seq);
            let handle = spawn(SpawnOpts::default().name(name), async move {
                inner.running.set(inner.running.get() + 1);
                loop {
                    if inner.terminated.get() {
                        break;
                    }
                    let work = match inner.queue.pop().await {
                        Ok(work) => work,
                        Err(err) => {
                            trace!("pool {} worker leaving: {}", inner.name, err);
                            break;
                        }
                    };
                    match work {
                        Work::Run(f) => {
                            inner.working.set(inner.working.get() + 1);
                            f();
                            inner.working.set(inner.working.get() - 1);
                        }
                        Work::Exit => break,
                    }
                }
                inner.running.set(inner.running.get() - 1);
            });
            self.workers.borrow_mut().push(handle);
        }
    }

    /// Ask `count` workers to exit once they reach the queue.
    pub async fn del(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.inner.queue.push(Work::Exit).await?;
        }
        Ok(())
    }

    /// Grow or shrink to exactly `count` workers.
    pub async fn set(&self, count: usize) -> Result<()> {
        let running = self.workers.borrow().len();
        if count > running {
            self.add(count - running);
        } else {
            self.del(running - count).await?;
        }
        Ok(())
    }

    /// Ensure at least `count` workers exist.
    pub fn min(&self, count: usize) {
        let running = self.workers.borrow().len();
        if count > running {
            self.add(count - running);
        }
    }

    /// Post fire-and-forget work. An interruption point when the queue is
    /// bounded and full.
    pub async fn push(&self, f: impl FnOnce() + 'static) -> Result<()> {
        self.inner.queue.push(Work::Run(Box::new(f))).await
    }

    /// Post work returning a value through a future.
    pub async fn async_<R: 'static>(&self, f: impl FnOnce() -> R + 'static) -> Result<Future<R>> {
        let (p, fut) = promise();
        self.inner
            .queue
            .push(Work::Run(Box::new(move || {
                let _ = p.set_value(f());
            })))
            .await?;
        Ok(fut)
    }

    /// Request all workers exit; queued work is abandoned.
    pub fn terminate(&self) {
        debug!("pool {} terminate", self.inner.name);
        self.inner.terminated.set(true);
        self.interrupt();
    }

    /// Interrupt every worker at its next interruption point.
    pub fn interrupt(&self) {
        for worker in self.workers.borrow().iter() {
            worker.interrupt();
        }
    }

    /// Wait for every worker to exit.
    pub async fn join(&self) -> Result<()> {
        let workers: Vec<_> = self.workers.borrow_mut().drain(..).collect();
        for worker in workers {
            worker.join().await?;
        }
        Ok(())
    }

    pub fn running(&self) -> usize {
        self.inner.running.get()
    }

    pub fn working(&self) -> usize {
        self.inner.working.get()
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // TaskHandle drop interrupts any worker still running; queued work
        // that never ran is dropped with the queue.
        self.inner.terminated.set(true);
        while self.inner.queue.try_pop().is_some() {}
    }
}
