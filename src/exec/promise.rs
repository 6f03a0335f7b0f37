//! Single-shot value channel with copyable promises.
//!
//! The shared state carries a value slot, an error slot, a dock for future
//! waiters, and a count of live co-promises. Cloning a promise links
//! another producer; when the count reaches zero with no value set, the
//! future observes `broken_promise`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::{Error, Result};

use super::dock::Dock;

#[derive(Clone, Copy, PartialEq)]
enum State {
    Pending,
    Ready,
    Retrieved,
}

struct Shared<T> {
    state: Cell<State>,
    value: RefCell<Option<Result<T>>>,
    dock: Dock,
    promises: Cell<usize>,
}

impl<T> Shared<T> {
    fn fulfill(&self, value: Result<T>) -> Result<()> {
        if self.state.get() != State::Pending {
            return Err(Error::new_promise_already_satisfied());
        }
        *self.value.borrow_mut() = Some(value);
        self.state.set(State::Ready);
        self.dock.notify_all();
        Ok(())
    }
}

/// Create a connected promise/future pair.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let shared = Rc::new(Shared {
        state: Cell::new(State::Pending),
        value: RefCell::new(None),
        dock: Dock::new(),
        promises: Cell::new(1),
    });
    (
        Promise {
            shared: shared.clone(),
        },
        Future { shared },
    )
}

pub struct Promise<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Promise<T> {
    pub fn set_value(&self, value: T) -> Result<()> {
        self.shared.fulfill(Ok(value))
    }

    pub fn set_error(&self, error: Error) -> Result<()> {
        self.shared.fulfill(Err(error))
    }

    /// Whether a value or error has been set.
    pub fn satisfied(&self) -> bool {
        self.shared.state.get() != State::Pending
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        self.shared.promises.set(self.shared.promises.get() + 1);
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let remaining = self.shared.promises.get() - 1;
        self.shared.promises.set(remaining);
        if remaining == 0 && self.shared.state.get() == State::Pending {
            let _ = self.shared.fulfill(Err(Error::new_broken_promise()));
        }
    }
}

pub struct Future<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Future<T> {
    /// Wait for the value and take it. A second call observes
    /// `future_already_retrieved`. An interruption point.
    pub async fn get(&self) -> Result<T> {
        loop {
            match self.shared.state.get() {
                State::Ready => {
                    self.shared.state.set(State::Retrieved);
                    let value = self.shared.value.borrow_mut().take();
                    return value.expect("ready future without value");
                }
                State::Retrieved => return Err(Error::new_future_already_retrieved()),
                State::Pending => {
                    self.shared.dock.wait().await?;
                }
            }
        }
    }

    /// Wait for readiness without retrieving; `Ok(false)` on deadline.
    pub async fn wait_until(&self, deadline: std::time::Instant) -> Result<bool> {
        self.shared
            .dock
            .wait_until_when(deadline, || self.shared.state.get() != State::Pending)
            .await
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.get() != State::Pending
    }

    /// Whether `get` has already consumed the value.
    pub fn retrieved(&self) -> bool {
        self.shared.state.get() == State::Retrieved
    }
}
