//! Task spawning, identity, interruption and sleeping.

use std::cell::Cell;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::{Error, Result};

use super::dock::Dock;
use super::runtime::{self, WakeHeader};
use super::timer::TimerKey;

/// Per-task control block, shared by the scheduler, the task's handle and
/// the wait futures that need the interruption flag.
pub(crate) struct TaskCtl {
    pub(crate) id: usize,
    pub(crate) gen: u64,
    pub(crate) name: Option<String>,
    pub(crate) header: Arc<WakeHeader>,
    pub(crate) finished: Cell<bool>,
    pub(crate) join_dock: Dock,
    interrupted: Cell<bool>,
    defer: Cell<u32>,
}

impl TaskCtl {
    pub(crate) fn new(
        id: usize,
        gen: u64,
        name: Option<String>,
        header: Arc<WakeHeader>,
    ) -> TaskCtl {
        TaskCtl {
            id,
            gen,
            name,
            header,
            finished: Cell::new(false),
            join_dock: Dock::new(),
            interrupted: Cell::new(false),
            defer: Cell::new(0),
        }
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.set(true);
        futures_util::task::ArcWake::wake_by_ref(&self.header);
    }

    /// Consume a pending interruption request if delivery is allowed.
    pub(crate) fn take_interrupt(&self) -> bool {
        if self.defer.get() == 0 && self.interrupted.get() {
            self.interrupted.set(false);
            return true;
        }
        false
    }
}

/// Options accepted by [`spawn`].
///
/// `stack_size` exists for parity with stackful realizations of this engine
/// and is ignored here; tasks are stackless.
#[derive(Default)]
pub struct SpawnOpts {
    pub name: Option<String>,
    pub stack_size: Option<usize>,
    pub detached: bool,
}

impl SpawnOpts {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

/// Handle to a spawned task.
///
/// Dropping the handle of a task that has not finished interrupts the task
/// and detaches it; use [`TaskHandle::join`] for the joining contract.
pub struct TaskHandle {
    ctl: Rc<TaskCtl>,
    detached: bool,
}

impl TaskHandle {
    /// Request interruption; delivered at the task's next interruption
    /// point.
    pub fn interrupt(&self) {
        trace!("interrupt task id={} name={:?}", self.ctl.id, self.ctl.name);
        self.ctl.interrupt();
    }

    pub fn finished(&self) -> bool {
        self.ctl.finished.get()
    }

    pub fn name(&self) -> Option<&str> {
        self.ctl.name.as_deref()
    }

    /// Wait until the task's future has returned.
    pub async fn join(mut self) -> Result<()> {
        self.detached = true;
        while !self.ctl.finished.get() {
            self.ctl.join_dock.wait().await?;
        }
        Ok(())
    }

    /// Give the task up; it keeps running unobserved.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if !self.detached && !self.ctl.finished.get() {
            self.ctl.interrupt();
        }
    }
}

/// Spawn a task onto the runtime of the calling thread.
pub fn spawn<F>(opts: SpawnOpts, fut: F) -> TaskHandle
where
    F: StdFuture<Output = ()> + 'static,
{
    let ctl = runtime::with(|handle| handle.spawn(opts.name, fut));
    TaskHandle {
        ctl,
        detached: opts.detached,
    }
}

/// Raise `interrupted` if a request is pending for the current task.
pub fn interruption_point() -> Result<()> {
    check_interrupt()
}

/// Request interruption of the current task; delivered at its next
/// interruption point.
pub fn interrupt_self() {
    if let Some(ctl) = runtime::current_ctl() {
        ctl.interrupt();
    }
}

/// Whether an interruption request is pending (without consuming it).
pub fn interruption_requested() -> bool {
    matches!(runtime::current_ctl(), Some(ctl) if ctl.peek_interrupt())
}

impl TaskCtl {
    fn peek_interrupt(&self) -> bool {
        self.interrupted.get()
    }
}

pub(crate) fn check_interrupt() -> Result<()> {
    match runtime::current_ctl() {
        Some(ctl) if ctl.take_interrupt() => Err(Error::new_interrupted()),
        _ => Ok(()),
    }
}

/// The name of the current task, for log decoration.
pub fn current_name() -> Option<String> {
    runtime::current_ctl().and_then(|ctl| ctl.name.clone())
}

/// Suppress interruption delivery for the guard's lifetime. A request that
/// arrives in scope is raised at the next interruption point after the
/// guard drops; [`Uninterruptible::end`] checks immediately.
pub struct Uninterruptible {
    ctl: Option<Rc<TaskCtl>>,
}

impl Uninterruptible {
    pub fn enter() -> Uninterruptible {
        let ctl = runtime::current_ctl();
        if let Some(ctl) = &ctl {
            ctl.defer.set(ctl.defer.get() + 1);
        }
        Uninterruptible { ctl }
    }

    /// Leave the scope and deliver any request that arrived inside it.
    pub fn end(mut self) -> Result<()> {
        self.pop();
        check_interrupt()
    }

    fn pop(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            ctl.defer.set(ctl.defer.get() - 1);
        }
    }
}

impl Drop for Uninterruptible {
    fn drop(&mut self) {
        self.pop();
    }
}

/// Like [`Uninterruptible`], but a request that arrived in scope is
/// swallowed instead of raised.
pub struct UninterruptibleNothrow {
    ctl: Option<Rc<TaskCtl>>,
}

impl UninterruptibleNothrow {
    pub fn enter() -> UninterruptibleNothrow {
        let ctl = runtime::current_ctl();
        if let Some(ctl) = &ctl {
            ctl.defer.set(ctl.defer.get() + 1);
        }
        UninterruptibleNothrow { ctl }
    }
}

impl Drop for UninterruptibleNothrow {
    fn drop(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            ctl.defer.set(ctl.defer.get() - 1);
            ctl.interrupted.set(false);
        }
    }
}

/// Cooperative fairness: requeue the current task at the back of the ready
/// FIFO. An interruption point.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

pub struct YieldNow {
    polled: bool,
}

impl StdFuture for YieldNow {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.polled {
            self.polled = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        Poll::Ready(check_interrupt())
    }
}

/// Sleep until `deadline`. An interruption point.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        timer: None,
    }
}

/// Sleep for `duration`. An interruption point.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

pub struct Sleep {
    deadline: Instant,
    timer: Option<TimerKey>,
}

impl StdFuture for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(err) = check_interrupt() {
            self.clear_timer();
            return Poll::Ready(Err(err));
        }
        if Instant::now() >= self.deadline {
            self.clear_timer();
            return Poll::Ready(Ok(()));
        }
        match &self.timer {
            Some(key) => runtime::with(|handle| handle.timers.update_waker(key, cx.waker())),
            None => {
                let key = runtime::with(|handle| {
                    handle.timers.register(self.deadline, cx.waker().clone())
                });
                self.timer = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Sleep {
    fn clear_timer(&mut self) {
        if let Some(key) = self.timer.take() {
            runtime::try_with(|handle| handle.timers.cancel(key));
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.clear_timer();
    }
}
