//! Cooperative shared mutex with an upgrade slot.
//!
//! State is a signed count `s` and an upgrade flag `u`:
//! `s == isize::MIN` while the unique lock is held, `s >= 0` counts shared
//! holders, and `u` marks the single upgradeable holder. Transitions happen
//! under the internal dock with no suspension between the predicate check
//! and the state write, so each is atomic with respect to other tasks.

use std::cell::Cell;

use crate::Result;

use super::dock::Dock;

#[derive(Default)]
pub struct SharedMutex {
    s: Cell<isize>,
    u: Cell<bool>,
    dock: Dock,
}

impl SharedMutex {
    pub fn new() -> SharedMutex {
        SharedMutex::default()
    }

    /// Acquire the unique lock.
    pub async fn lock(&self) -> Result<WriteGuard<'_>> {
        loop {
            if self.s.get() == 0 && !self.u.get() {
                self.s.set(isize::MIN);
                return Ok(WriteGuard { m: self });
            }
            self.dock.wait().await?;
        }
    }

    /// Acquire a shared lock.
    pub async fn lock_shared(&self) -> Result<ReadGuard<'_>> {
        loop {
            if self.s.get() >= 0 {
                self.s.set(self.s.get() + 1);
                return Ok(ReadGuard { m: self });
            }
            self.dock.wait().await?;
        }
    }

    /// Acquire the upgrade lock: coexists with shared holders, excludes the
    /// unique lock and other upgraders.
    pub async fn lock_upgrade(&self) -> Result<UpgradeGuard<'_>> {
        loop {
            if self.s.get() >= 0 && !self.u.get() {
                self.u.set(true);
                return Ok(UpgradeGuard { m: self });
            }
            self.dock.wait().await?;
        }
    }

    pub fn try_lock(&self) -> Option<WriteGuard<'_>> {
        if self.s.get() == 0 && !self.u.get() {
            self.s.set(isize::MIN);
            Some(WriteGuard { m: self })
        } else {
            None
        }
    }

    pub fn try_lock_shared(&self) -> Option<ReadGuard<'_>> {
        if self.s.get() >= 0 {
            self.s.set(self.s.get() + 1);
            Some(ReadGuard { m: self })
        } else {
            None
        }
    }

    pub fn try_lock_upgrade(&self) -> Option<UpgradeGuard<'_>> {
        if self.s.get() >= 0 && !self.u.get() {
            self.u.set(true);
            Some(UpgradeGuard { m: self })
        } else {
            None
        }
    }

    pub fn unique(&self) -> bool {
        self.s.get() < 0
    }

    pub fn shares(&self) -> usize {
        self.s.get().max(0) as usize
    }

    pub fn upgrading(&self) -> bool {
        self.u.get()
    }

    fn unlock(&self) {
        debug_assert_eq!(self.s.get(), isize::MIN);
        self.s.set(0);
        self.dock.notify_all();
    }

    fn unlock_shared(&self) {
        debug_assert!(self.s.get() > 0);
        self.s.set(self.s.get() - 1);
        if self.s.get() == 0 {
            self.dock.notify_all();
        }
    }

    fn unlock_upgrade(&self) {
        debug_assert!(self.u.get());
        self.u.set(false);
        self.dock.notify_all();
    }
}

impl Drop for SharedMutex {
    fn drop(&mut self) {
        debug_assert_eq!(self.s.get(), 0, "shared mutex dropped while held");
        debug_assert!(!self.u.get(), "shared mutex dropped while upgrading");
        debug_assert_eq!(self.dock.waiting(), 0, "shared mutex dropped with waiters");
    }
}

pub struct WriteGuard<'a> {
    m: &'a SharedMutex,
}

impl<'a> WriteGuard<'a> {
    /// `unlock_and_lock_shared`.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let m = self.m;
        std::mem::forget(self);
        debug_assert_eq!(m.s.get(), isize::MIN);
        m.s.set(1);
        m.dock.notify_all();
        ReadGuard { m }
    }

    /// `unlock_and_lock_upgrade`.
    pub fn downgrade_to_upgrade(self) -> UpgradeGuard<'a> {
        let m = self.m;
        std::mem::forget(self);
        debug_assert_eq!(m.s.get(), isize::MIN);
        m.s.set(0);
        m.u.set(true);
        m.dock.notify_all();
        UpgradeGuard { m }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.m.unlock();
    }
}

pub struct ReadGuard<'a> {
    m: &'a SharedMutex,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.m.unlock_shared();
    }
}

pub struct UpgradeGuard<'a> {
    m: &'a SharedMutex,
}

impl<'a> UpgradeGuard<'a> {
    /// `unlock_upgrade_and_lock`: wait out the shared holders, then take the
    /// unique lock. The upgrade flag stays held while waiting so no new
    /// upgrader or unique holder can slip in.
    pub async fn upgrade(self) -> Result<WriteGuard<'a>> {
        let m = self.m;
        loop {
            if m.s.get() == 0 {
                std::mem::forget(self);
                m.u.set(false);
                m.s.set(isize::MIN);
                return Ok(WriteGuard { m });
            }
            m.dock.wait().await?;
        }
    }

    /// `unlock_upgrade_and_lock_shared`.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let m = self.m;
        std::mem::forget(self);
        m.u.set(false);
        m.s.set(m.s.get() + 1);
        m.dock.notify_all();
        ReadGuard { m }
    }
}

impl Drop for UpgradeGuard<'_> {
    fn drop(&mut self) {
        self.m.unlock_upgrade();
    }
}
