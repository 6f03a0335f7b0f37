//! Non-recursive cooperative mutex with direct ownership handoff.
//!
//! `unlock` transfers the lock to the head waiter before waking it, so the
//! waiter dequeued by `unlock` is the one that acquires; later arrivals
//! cannot barge past a parked task.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::{Error, Result};

use super::runtime;
use super::task;
use super::timer::TimerKey;

#[derive(Default)]
pub struct Mutex {
    owner: Cell<Option<usize>>,
    waiters: RefCell<VecDeque<Rc<LockWaiter>>>,
}

struct LockWaiter {
    task: usize,
    granted: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex::default()
    }

    /// Acquire the lock. An interruption point.
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            node: None,
            deadline: None,
            timer: None,
            done: false,
        }
    }

    /// Acquire with a deadline; `Err(timeout)` on expiry.
    pub fn try_lock_until(&self, deadline: Instant) -> Lock<'_> {
        Lock {
            mutex: self,
            node: None,
            deadline: Some(deadline),
            timer: None,
            done: false,
        }
    }

    /// Acquire within `dur`; `Err(timeout)` on expiry.
    pub fn try_lock_for(&self, dur: Duration) -> Lock<'_> {
        self.try_lock_until(Instant::now() + dur)
    }

    /// Immediate acquisition attempt.
    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        if self.owner.get().is_none() && self.waiters.borrow().is_empty() {
            self.owner.set(Some(current_task()));
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn locked(&self) -> bool {
        self.owner.get().is_some()
    }

    pub fn waiting(&self) -> usize {
        self.waiters.borrow().len()
    }

    /// Hand the lock to the head waiter, or free it.
    fn release(&self) {
        let next = self.waiters.borrow_mut().pop_front();
        match next {
            Some(node) => {
                self.owner.set(Some(node.task));
                node.granted.set(true);
                if let Some(waker) = node.waker.borrow_mut().take() {
                    waker.wake();
                }
            }
            None => self.owner.set(None),
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        debug_assert!(self.owner.get().is_none(), "mutex dropped while held");
        debug_assert!(
            self.waiters.borrow().is_empty(),
            "mutex dropped with waiters"
        );
    }
}

fn current_task() -> usize {
    runtime::current_ctl()
        .expect("mutex used outside a fedlink task")
        .id
}

pub struct Lock<'a> {
    mutex: &'a Mutex,
    node: Option<Rc<LockWaiter>>,
    deadline: Option<Instant>,
    timer: Option<TimerKey>,
    done: bool,
}

impl<'a> StdFuture for Lock<'a> {
    type Output = Result<MutexGuard<'a>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(err) = task::check_interrupt() {
            self.abandon();
            return Poll::Ready(Err(err));
        }

        if let Some(node) = &self.node {
            if node.granted.get() {
                debug_assert_eq!(self.mutex.owner.get(), Some(node.task));
                self.finish();
                return Poll::Ready(Ok(MutexGuard { mutex: self.mutex }));
            }
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.abandon();
                return Poll::Ready(Err(Error::new_timeout()));
            }
        }

        match &self.node {
            None => {
                if let Some(guard) = self.mutex.try_lock() {
                    self.finish();
                    return Poll::Ready(Ok(guard));
                }
                let node = Rc::new(LockWaiter {
                    task: current_task(),
                    granted: Cell::new(false),
                    waker: RefCell::new(Some(cx.waker().clone())),
                });
                self.mutex.waiters.borrow_mut().push_back(node.clone());
                self.node = Some(node);
                if let Some(deadline) = self.deadline {
                    let key = runtime::with(|handle| {
                        handle.timers.register(deadline, cx.waker().clone())
                    });
                    self.timer = Some(key);
                }
            }
            Some(node) => {
                *node.waker.borrow_mut() = Some(cx.waker().clone());
                if let Some(key) = &self.timer {
                    runtime::with(|handle| handle.timers.update_waker(key, cx.waker()));
                }
            }
        }
        Poll::Pending
    }
}

impl Lock<'_> {
    fn finish(&mut self) {
        self.done = true;
        self.node = None;
        self.clear_timer();
    }

    fn abandon(&mut self) {
        if let Some(node) = self.node.take() {
            if node.granted.get() {
                // the lock was handed to us while we were leaving
                self.mutex.release();
            } else {
                self.mutex
                    .waiters
                    .borrow_mut()
                    .retain(|other| !Rc::ptr_eq(other, &node));
            }
        }
        self.done = true;
        self.clear_timer();
    }

    fn clear_timer(&mut self) {
        if let Some(key) = self.timer.take() {
            runtime::try_with(|handle| handle.timers.cancel(key));
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abandon();
        }
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl std::fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").finish()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        debug_assert!(self.mutex.owner.get().is_some(), "unlock without owner");
        self.mutex.release();
    }
}
