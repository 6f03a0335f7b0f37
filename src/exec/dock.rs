//! The dock: an ordered waiter list for tasks.
//!
//! Notifications wake waiters in FIFO insertion order. A wait future that
//! unwinds after having been notified passes the notification to the next
//! waiter, so a wake can never be lost to an exception path; a wait future
//! that unwinds while still queued unlinks itself, so no waiter is leaked.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::Result;

use super::runtime;
use super::task;
use super::timer::TimerKey;

#[derive(Default)]
pub struct Dock {
    waiters: RefCell<VecDeque<Rc<Waiter>>>,
}

struct Waiter {
    notified: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Dock {
    pub fn new() -> Dock {
        Dock::default()
    }

    /// Park until notified. An interruption point.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            dock: self,
            node: None,
            deadline: None,
            timer: None,
            done: false,
        }
    }

    /// Park until notified or `deadline`; `Ok(true)` means notified.
    pub fn wait_until(&self, deadline: Instant) -> Wait<'_> {
        Wait {
            dock: self,
            node: None,
            deadline: Some(deadline),
            timer: None,
            done: false,
        }
    }

    /// Park until notified or `dur` elapses; `Ok(true)` means notified.
    pub fn wait_for(&self, dur: Duration) -> Wait<'_> {
        self.wait_until(Instant::now() + dur)
    }

    /// Park until `ready()` holds, rechecking after every wake.
    pub async fn wait_when(&self, mut ready: impl FnMut() -> bool) -> Result<()> {
        while !ready() {
            self.wait().await?;
        }
        Ok(())
    }

    /// Predicate form of [`Dock::wait_until`]; `Ok(false)` means the
    /// deadline passed with the predicate still false.
    pub async fn wait_until_when(
        &self,
        deadline: Instant,
        mut ready: impl FnMut() -> bool,
    ) -> Result<bool> {
        while !ready() {
            if !self.wait_until(deadline).await? {
                return Ok(ready());
            }
        }
        Ok(true)
    }

    /// Predicate form of [`Dock::wait_for`].
    pub async fn wait_for_when(
        &self,
        dur: Duration,
        ready: impl FnMut() -> bool,
    ) -> Result<bool> {
        self.wait_until_when(Instant::now() + dur, ready).await
    }

    /// Wake the head waiter.
    pub fn notify_one(&self) {
        let node = self.waiters.borrow_mut().pop_front();
        if let Some(node) = node {
            node.notified.set(true);
            if let Some(waker) = node.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// Wake every current waiter, preserving their order in the ready queue.
    pub fn notify_all(&self) {
        let drained: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        for node in drained {
            node.notified.set(true);
            if let Some(waker) = node.waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// Wake the head waiter without yielding the notifier. With stackless
    /// tasks the notifier never yields on notify, so this is [`notify_one`];
    /// both names are kept for the two call sites' intent.
    ///
    /// [`notify_one`]: Dock::notify_one
    pub fn notify(&self) {
        self.notify_one()
    }

    /// Number of parked tasks.
    pub fn waiting(&self) -> usize {
        self.waiters.borrow().len()
    }

    fn unlink(&self, node: &Rc<Waiter>) {
        self.waiters
            .borrow_mut()
            .retain(|other| !Rc::ptr_eq(other, node));
    }
}

pub struct Wait<'a> {
    dock: &'a Dock,
    node: Option<Rc<Waiter>>,
    deadline: Option<Instant>,
    timer: Option<TimerKey>,
    done: bool,
}

impl StdFuture for Wait<'_> {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Interruption outranks a delivered notification; passing the wake
        // along keeps peers from starving.
        if let Err(err) = task::check_interrupt() {
            self.abandon();
            return Poll::Ready(Err(err));
        }

        if let Some(node) = &self.node {
            if node.notified.get() {
                self.finish();
                return Poll::Ready(Ok(true));
            }
        }

        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.abandon();
                return Poll::Ready(Ok(false));
            }
        }

        match &self.node {
            None => {
                let node = Rc::new(Waiter {
                    notified: Cell::new(false),
                    waker: RefCell::new(Some(cx.waker().clone())),
                });
                self.dock.waiters.borrow_mut().push_back(node.clone());
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
                if let (Some(key), Some(_)) = (&self.timer, self.deadline) {
                    runtime::with(|handle| handle.timers.update_waker(key, cx.waker()));
                }
            }
        }
        Poll::Pending
    }
}

impl Wait<'_> {
    fn finish(&mut self) {
        self.done = true;
        self.node = None;
        self.clear_timer();
    }

    /// Leave the waiter list on a non-notified exit; forward the wake if one
    /// was already delivered.
    fn abandon(&mut self) {
        if let Some(node) = self.node.take() {
            if node.notified.get() {
                self.dock.notify_one();
            } else {
                self.dock.unlink(&node);
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

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.abandon();
        }
    }
}
