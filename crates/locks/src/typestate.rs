/* Copyright (c) 2023 Jeremy Davis (jeremydavis519@gmail.com)
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy of this software
 * and associated documentation files (the "Software"), to deal in the Software without restriction,
 * including without limitation the rights to use, copy, modify, merge, publish, distribute,
 * sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all copies or
 * substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT
 * NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
 * NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
 * DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
 */

//! Compile-time enforcement of the kernel's global lock order.
//!
//! Taking two locks out of order is the classic way to deadlock a kernel, and today that
//! discipline (`tasks_lock -> task.lock -> as.lock -> area.lock -> pt.lock -> zone.lock`) lives
//! only in a comment. This module turns each level of the order into its own type, wrapping
//! [`Mutex`] so that a lock can only be acquired if the caller can already produce a guard for
//! the level above it: [`TaskLock::lock`] takes a `&TasksLockGuard` as proof, [`AsLock::lock`]
//! takes a `&TaskLockGuard`, and so on down to [`ZoneLock`]. There is no way to call any of these
//! `lock` methods without the right guard already in scope, so acquiring the order backwards is a
//! borrow-checker error instead of a 3am page.
//!
//! The first level, [`TasksLock`], needs no proof -- it's the root of the order, the lock a
//! kernel entry point takes before anything else.

use core::ops::{Deref, DerefMut};

use crate::mutex::{Mutex, MutexGuard};

macro_rules! lock_level {
    ($lock:ident, $guard:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug)]
        pub struct $lock<T>(Mutex<T>);

        impl<T> $lock<T> {
            /// Wraps `value` behind this lock level.
            pub const fn new(value: T) -> Self {
                $lock(Mutex::new(value))
            }

            /// Spins until the lock is acquired.
            pub fn try_lock(&self) -> Result<$guard<T>, ()> {
                self.0.try_lock().map($guard)
            }
        }

        /// An RAII guard proving this lock level is held.
        pub struct $guard<'a, T>(MutexGuard<'a, T>);

        impl<'a, T> Deref for $guard<'a, T> {
            type Target = T;
            fn deref(&self) -> &T { &self.0 }
        }

        impl<'a, T> DerefMut for $guard<'a, T> {
            fn deref_mut(&mut self) -> &mut T { &mut self.0 }
        }
    };
}

lock_level!(TasksLock, TasksLockGuard, "The outermost lock: the kernel's whole task list.");
lock_level!(TaskLock, TaskLockGuard, "A single task's fields (its thread list, among others).");
lock_level!(AsLock, AsLockGuard, "An address space's area list and ASID.");
lock_level!(AreaLock, AreaLockGuard, "A single address-space area's backend and mapping state.");
lock_level!(PtLock, PtLockGuard, "The page table a `pt_map`/`pt_unmap` pair touches.");
lock_level!(ZoneLock, ZoneLockGuard, "A single frame zone's buddy free lists.");

impl<T> TasksLock<T> {
    /// Acquires the root lock. Needs no proof: every kernel entry point is free to start here.
    pub fn lock(&self) -> TasksLockGuard<T> {
        TasksLockGuard(self.0.lock())
    }
}

impl<T> TaskLock<T> {
    /// Acquires this task's lock. `_tasks` proves the caller already holds [`TasksLock`].
    pub fn lock<'a, U>(&self, _tasks: &TasksLockGuard<'a, U>) -> TaskLockGuard<T> {
        TaskLockGuard(self.0.lock())
    }
}

impl<T> AsLock<T> {
    /// Acquires this address space's lock. `_task` proves the caller already holds [`TaskLock`].
    pub fn lock<'a, U>(&self, _task: &TaskLockGuard<'a, U>) -> AsLockGuard<T> {
        AsLockGuard(self.0.lock())
    }
}

impl<T> AreaLock<T> {
    /// Acquires this area's lock. `_as` proves the caller already holds [`AsLock`].
    pub fn lock<'a, U>(&self, _as: &AsLockGuard<'a, U>) -> AreaLockGuard<T> {
        AreaLockGuard(self.0.lock())
    }
}

impl<T> PtLock<T> {
    /// Acquires the page table lock. `_area` proves the caller already holds [`AreaLock`].
    pub fn lock<'a, U>(&self, _area: &AreaLockGuard<'a, U>) -> PtLockGuard<T> {
        PtLockGuard(self.0.lock())
    }
}

impl<T> ZoneLock<T> {
    /// Acquires a frame zone's lock. `_pt` proves the caller already holds [`PtLock`].
    pub fn lock<'a, U>(&self, _pt: &PtLockGuard<'a, U>) -> ZoneLockGuard<T> {
        ZoneLockGuard(self.0.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_acquisition_follows_the_global_order() {
        let tasks = TasksLock::new(alloc::vec::Vec::<u32>::new());
        let task = TaskLock::new(0u32);
        let as_ = AsLock::new(0u32);

        let mut tasks_guard = tasks.lock();
        tasks_guard.push(1);
        let task_guard = task.lock(&tasks_guard);
        let as_guard = as_.lock(&task_guard);
        assert_eq!(*as_guard, 0);
    }

    #[test]
    fn each_level_unlocks_on_drop() {
        let lock = TasksLock::new(5);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 5);
        }
        assert!(lock.try_lock().is_ok());
    }
}
