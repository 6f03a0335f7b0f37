//! The single-threaded scheduler.
//!
//! All tasks and the reactor share one OS thread. The ready queue is a
//! strict FIFO; wakes from foreign threads (offload completions, the mio
//! waker) land in a mutex-protected injection queue that drains into the
//! FIFO at the top of every scheduler turn.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::task::{waker, ArcWake};
use slab::Slab;
use tracing::trace;

use crate::config::Config;
use crate::net::reactor::Reactor;

use super::task::TaskCtl;
use super::timer::Timers;

thread_local! {
    static HANDLE: RefCell<Option<Rc<Handle>>> = RefCell::new(None);
}

/// The runtime driving the execution engine, the reactor and the timers.
pub struct Runtime {
    handle: Rc<Handle>,
}

pub(crate) struct Handle {
    pub(crate) config: Config,
    pub(crate) timers: Timers,
    pub(crate) reactor: Reactor,
    tasks: RefCell<Slab<TaskEntry>>,
    ready: RefCell<VecDeque<usize>>,
    injector: Arc<Injector>,
    current: RefCell<Option<Rc<TaskCtl>>>,
    seq: Cell<u64>,
}

struct TaskEntry {
    fut: Option<Pin<Box<dyn StdFuture<Output = ()>>>>,
    ctl: Rc<TaskCtl>,
    queued: bool,
    polling: bool,
}

/// Cross-thread wake queue. Pushes record (slot, generation) so a waker that
/// outlives its task cannot resume an unrelated task reusing the slot.
pub(crate) struct Injector {
    queue: StdMutex<Vec<(usize, u64)>>,
    kick: StdMutex<Option<mio::Waker>>,
}

impl Injector {
    pub(crate) fn push(&self, id: usize, gen: u64) {
        self.queue.lock().unwrap().push((id, gen));
        if let Some(waker) = &*self.kick.lock().unwrap() {
            let _ = waker.wake();
        }
    }
}

pub(crate) struct WakeHeader {
    id: usize,
    gen: u64,
    injector: Arc<Injector>,
}

impl ArcWake for WakeHeader {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.injector.push(arc_self.id, arc_self.gen);
    }
}

impl Runtime {
    pub fn new(config: Config) -> crate::Result<Runtime> {
        let reactor = Reactor::new()?;
        let injector = Arc::new(Injector {
            queue: StdMutex::new(Vec::new()),
            kick: StdMutex::new(None),
        });
        *injector.kick.lock().unwrap() = Some(reactor.make_waker()?);
        Ok(Runtime {
            handle: Rc::new(Handle {
                config,
                timers: Timers::new(),
                reactor,
                tasks: RefCell::new(Slab::new()),
                ready: RefCell::new(VecDeque::new()),
                injector,
                current: RefCell::new(None),
                seq: Cell::new(0),
            }),
        })
    }

    /// Drive `main` and every task it spawns until `main` returns. Tasks
    /// still pending at that point are dropped.
    pub fn run<T, F>(&self, main: F) -> T
    where
        T: 'static,
        F: StdFuture<Output = T> + 'static,
    {
        let _enter = Enter::new(self.handle.clone());
        let out: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let out2 = out.clone();
        self.handle.spawn(Some("main".into()), async move {
            let value = main.await;
            *out2.borrow_mut() = Some(value);
        });

        loop {
            self.handle.timers.fire_due(Instant::now());
            self.handle.drain_injector();
            loop {
                let id = self.handle.ready.borrow_mut().pop_front();
                let Some(id) = id else { break };
                self.handle.poll_task(id);
                self.handle.drain_injector();
            }
            if let Some(value) = out.borrow_mut().take() {
                return value;
            }
            let timeout = self
                .handle
                .timers
                .next_deadline()
                .map(|dl| dl.saturating_duration_since(Instant::now()));
            self.handle
                .reactor
                .turn(timeout)
                .expect("reactor poll failed");
        }
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &Config {
        &self.handle.config
    }
}

struct Enter;

impl Enter {
    fn new(handle: Rc<Handle>) -> Enter {
        HANDLE.with(|slot| {
            let mut slot = slot.borrow_mut();
            assert!(slot.is_none(), "nested fedlink runtime on one thread");
            *slot = Some(handle);
        });
        Enter
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        HANDLE.with(|slot| slot.borrow_mut().take());
    }
}

impl Handle {
    pub(crate) fn spawn(
        &self,
        name: Option<String>,
        fut: impl StdFuture<Output = ()> + 'static,
    ) -> Rc<TaskCtl> {
        let gen = self.seq.get().wrapping_add(1);
        self.seq.set(gen);
        let mut tasks = self.tasks.borrow_mut();
        let entry = tasks.vacant_entry();
        let id = entry.key();
        let header = Arc::new(WakeHeader {
            id,
            gen,
            injector: self.injector.clone(),
        });
        let ctl = Rc::new(TaskCtl::new(id, gen, name, header));
        trace!("spawn task id={} name={:?}", id, ctl.name);
        entry.insert(TaskEntry {
            fut: Some(Box::pin(fut)),
            ctl: ctl.clone(),
            queued: true,
            polling: false,
        });
        drop(tasks);
        self.ready.borrow_mut().push_back(id);
        ctl
    }

    pub(crate) fn current(&self) -> Option<Rc<TaskCtl>> {
        self.current.borrow().clone()
    }

    fn drain_injector(&self) {
        let drained = {
            let mut queue = self.injector.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        if drained.is_empty() {
            return;
        }
        let mut runnable = Vec::with_capacity(drained.len());
        {
            let mut tasks = self.tasks.borrow_mut();
            for (id, gen) in drained {
                let Some(entry) = tasks.get_mut(id) else {
                    continue;
                };
                if entry.ctl.gen != gen || entry.queued {
                    continue;
                }
                entry.queued = true;
                if entry.polling {
                    // re-queued by poll_task once the poll returns
                    continue;
                }
                runnable.push(id);
            }
        }
        let mut ready = self.ready.borrow_mut();
        for id in runnable {
            ready.push_back(id);
        }
    }

    fn poll_task(&self, id: usize) {
        let (mut fut, ctl) = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(entry) = tasks.get_mut(id) else {
                return;
            };
            let Some(fut) = entry.fut.take() else {
                return;
            };
            entry.queued = false;
            entry.polling = true;
            (fut, entry.ctl.clone())
        };

        let prev = self.current.replace(Some(ctl.clone()));
        let w = waker(ctl.header.clone());
        let mut cx = Context::from_waker(&w);
        let done = fut.as_mut().poll(&mut cx).is_ready();
        self.current.replace(prev);

        if done {
            trace!("task id={} name={:?} finished", id, ctl.name);
            ctl.finished.set(true);
            self.tasks.borrow_mut().remove(id);
            ctl.join_dock.notify_all();
        } else {
            let requeue = {
                let mut tasks = self.tasks.borrow_mut();
                match tasks.get_mut(id) {
                    Some(entry) => {
                        entry.polling = false;
                        entry.fut = Some(fut);
                        entry.queued
                    }
                    None => false,
                }
            };
            if requeue {
                self.ready.borrow_mut().push_back(id);
            }
        }
    }
}

/// Run `f` against the runtime handle installed on this thread.
///
/// Panics when no runtime is running; every suspension point sits inside
/// `Runtime::run` so this only trips on API misuse.
pub(crate) fn with<R>(f: impl FnOnce(&Handle) -> R) -> R {
    HANDLE.with(|slot| {
        let slot = slot.borrow();
        let handle = slot
            .as_ref()
            .expect("no fedlink runtime is running on this thread");
        f(handle)
    })
}

/// Like [`with`], but a no-op outside the runtime. Drop impls use this so
/// unwinding after `run` returned cannot panic again.
pub(crate) fn try_with<R>(f: impl FnOnce(&Handle) -> R) -> Option<R> {
    HANDLE.with(|slot| {
        let slot = slot.borrow();
        slot.as_ref().map(|handle| f(handle))
    })
}

pub(crate) fn current_ctl() -> Option<Rc<TaskCtl>> {
    try_with(|handle| handle.current()).flatten()
}
