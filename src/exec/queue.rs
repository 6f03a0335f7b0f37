//! Single-producer/multi-consumer FIFO over a pair of docks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::{Error, Result};

use super::dock::Dock;

pub struct Queue<T> {
    items: RefCell<VecDeque<T>>,
    bound: Option<usize>,
    nonempty: Dock,
    nonfull: Dock,
}

impl<T> Queue<T> {
    pub fn unbounded() -> Queue<T> {
        Queue {
            items: RefCell::new(VecDeque::new()),
            bound: None,
            nonempty: Dock::new(),
            nonfull: Dock::new(),
        }
    }

    pub fn bounded(bound: usize) -> Queue<T> {
        assert!(bound > 0);
        Queue {
            items: RefCell::new(VecDeque::with_capacity(bound)),
            bound: Some(bound),
            nonempty: Dock::new(),
            nonfull: Dock::new(),
        }
    }

    /// Enqueue, waiting for room when bounded. An interruption point.
    pub async fn push(&self, value: T) -> Result<()> {
        if let Some(bound) = self.bound {
            self.nonfull
                .wait_when(|| self.items.borrow().len() < bound)
                .await?;
        }
        self.items.borrow_mut().push_back(value);
        self.nonempty.notify_one();
        Ok(())
    }

    /// Enqueue if there is room right now.
    pub fn try_push(&self, value: T) -> std::result::Result<(), T> {
        if let Some(bound) = self.bound {
            if self.items.borrow().len() >= bound {
                return Err(value);
            }
        }
        self.items.borrow_mut().push_back(value);
        self.nonempty.notify_one();
        Ok(())
    }

    /// Dequeue, waiting for an item. An interruption point.
    pub async fn pop(&self) -> Result<T> {
        loop {
            if let Some(value) = self.try_pop() {
                return Ok(value);
            }
            self.nonempty.wait().await?;
        }
    }

    /// Dequeue before `deadline` or fail with `timeout`.
    pub async fn pop_until(&self, deadline: Instant) -> Result<T> {
        loop {
            if let Some(value) = self.try_pop() {
                return Ok(value);
            }
            if !self.nonempty.wait_until(deadline).await? {
                return match self.try_pop() {
                    Some(value) => Ok(value),
                    None => Err(Error::new_timeout()),
                };
            }
        }
    }

    /// Dequeue within `dur` or fail with `timeout`.
    pub async fn pop_for(&self, dur: Duration) -> Result<T> {
        self.pop_until(Instant::now() + dur).await
    }

    pub fn try_pop(&self) -> Option<T> {
        let value = self.items.borrow_mut().pop_front();
        if value.is_some() {
            self.nonfull.notify_one();
        }
        value
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        debug_assert!(self.items.borrow().is_empty(), "queue dropped non-empty");
    }
}
