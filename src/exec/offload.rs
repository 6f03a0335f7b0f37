//! Run a blocking closure on a temporary OS thread.
//!
//! The calling task parks while the thread runs; completion crosses back
//! through the runtime's injection queue via the task's waker. The park is
//! not an interruption point (the thread cannot be unwound from outside);
//! a request that arrives meanwhile is raised once the call returns.

use std::future::Future as StdFuture;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll, Waker};
use std::thread;

use crate::Result;

use super::task;

struct Relay<R> {
    done: StdMutex<Option<thread::Result<R>>>,
    waker: StdMutex<Option<Waker>>,
}

/// Execute `f` on a separate OS thread, suspending the calling task until
/// it returns.
pub async fn offload<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let relay = Arc::new(Relay {
        done: StdMutex::new(None),
        waker: StdMutex::new(None),
    });
    let remote = relay.clone();
    thread::Builder::new()
        .name("fedlink-offload".into())
        .spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            *remote.done.lock().unwrap() = Some(result);
            if let Some(waker) = remote.waker.lock().unwrap().take() {
                waker.wake();
            }
        })?;

    let result = Join { relay }.await;
    // deliver an interrupt that arrived while the thread ran
    task::check_interrupt()?;
    match result {
        Ok(value) => Ok(value),
        Err(panic) => resume_unwind(panic),
    }
}

struct Join<R> {
    relay: Arc<Relay<R>>,
}

impl<R> StdFuture for Join<R> {
    type Output = thread::Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.relay.done.lock().unwrap().take() {
            return Poll::Ready(result);
        }
        *self.relay.waker.lock().unwrap() = Some(cx.waker().clone());
        // recheck: the thread may have finished between the first check and
        // the waker store
        match self.relay.done.lock().unwrap().take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}
