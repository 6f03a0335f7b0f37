//! Cooperative execution engine.
//!
//! One OS thread runs the reactor and every task. Tasks are stackless
//! futures driven by a FIFO ready queue; they suspend only at documented
//! points: an explicit [`yield_now`], a wait on a [`Dock`]/[`Mutex`]/
//! [`Queue`]/[`Future`], a timed sleep, or a socket readiness wait in the
//! network layer. Interruption and timeouts are first-class: every blocking
//! operation in this module is an interruption point and the timed forms
//! either report or raise expiry.

pub(crate) mod runtime;

mod dock;
mod mutex;
mod offload;
mod pool;
mod promise;
mod queue;
mod shared_mutex;
mod task;
mod timer;
mod view;

pub use self::dock::Dock;
pub use self::mutex::{Mutex, MutexGuard};
pub use self::offload::offload;
pub use self::pool::{Pool, PoolOpts};
pub use self::promise::{promise, Future, Promise};
pub use self::queue::Queue;
pub use self::runtime::Runtime;
pub use self::shared_mutex::{ReadGuard, SharedMutex, UpgradeGuard, WriteGuard};
pub use self::task::{
    current_name, interrupt_self, interruption_point, interruption_requested, sleep,
    sleep_until, spawn, yield_now, SpawnOpts, TaskHandle, Uninterruptible,
    UninterruptibleNothrow,
};
pub use self::view::View;

pub(crate) use self::task::check_interrupt;
pub(crate) use self::timer::TimerKey;
