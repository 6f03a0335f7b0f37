//! Single-producer/multi-consumer view.
//!
//! The producer posts a value and parks until every consumer that was
//! already waiting has observed it; consumers see each posted value at most
//! once. Used to fan one event out to a set of tasks without queueing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::Result;

use super::dock::Dock;

pub struct View<T> {
    slot: RefCell<Option<Rc<T>>>,
    generation: Cell<u64>,
    pending: Cell<usize>,
    consumers: Dock,
    producer: Dock,
}

impl<T> View<T> {
    pub fn new() -> View<T> {
        View {
            slot: RefCell::new(None),
            generation: Cell::new(0),
            pending: Cell::new(0),
            consumers: Dock::new(),
            producer: Dock::new(),
        }
    }

    /// Publish `value` to every currently waiting consumer and park until
    /// all of them have observed it. Returns how many observed.
    pub async fn post(&self, value: T) -> Result<usize> {
        let observers = self.consumers.waiting();
        if observers == 0 {
            return Ok(0);
        }
        *self.slot.borrow_mut() = Some(Rc::new(value));
        self.generation.set(self.generation.get() + 1);
        self.pending.set(observers);
        self.consumers.notify_all();
        self.producer
            .wait_when(|| self.pending.get() == 0)
            .await?;
        *self.slot.borrow_mut() = None;
        Ok(observers)
    }

    /// Park until the next post and observe its value.
    pub async fn wait(&self) -> Result<Rc<T>> {
        let seen = self.generation.get();
        loop {
            if self.generation.get() != seen {
                break;
            }
            match self.consumers.wait().await {
                Ok(_) => {}
                Err(err) => {
                    // we were counted into the post underway; release the
                    // producer before leaving
                    if self.generation.get() != seen {
                        self.observed();
                    }
                    return Err(err);
                }
            }
        }
        let value = self
            .slot
            .borrow()
            .clone()
            .expect("view posted without value");
        self.observed();
        Ok(value)
    }

    pub fn waiting(&self) -> usize {
        self.consumers.waiting()
    }

    fn observed(&self) {
        let left = self.pending.get().saturating_sub(1);
        self.pending.set(left);
        if left == 0 {
            self.producer.notify_one();
        }
    }
}

impl<T> Default for View<T> {
    fn default() -> Self {
        View::new()
    }
}
