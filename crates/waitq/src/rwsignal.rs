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

//! A readers/writer signal: any number of readers, or exactly one writer, built the same way
//! `WaitqMutex` is -- a `kernel-locks::Semaphore` for the non-blocking bookkeeping, a `Waitq` to
//! put a losing thread to sleep instead of spinning.
//!
//! A writer is just a reader that has acquired every one of the semaphore's tickets, the same
//! trick `kernel-locks::Semaphore::force_access` documents as unsafe in general but which is
//! sound here because holding all tickets is, by construction, holding them all.

use core::ops::{Deref, DerefMut};
use alloc::vec::Vec;

use locks::Semaphore;

use crate::{Waitq, WakeMode, WaitqFlags, waitq_sleep_timeout, waitq_wakeup};

/// A readers/writer lock whose `read()`/`write()` block (via `waitq_sleep_timeout`) instead of
/// spinning when contended.
pub struct WaitqRwSignal<T> {
    sem: Semaphore<T>,
    max_readers: usize,
    wq: Waitq
}

/// An RAII read guard. Wakes one blocked waiter, if any, when dropped.
pub struct ReadGuard<'a, T> {
    guard: Option<locks::SemaphoreGuard<'a, T>>,
    wq: &'a Waitq
}

/// An RAII write guard, holding every reader ticket so no reader can be concurrently active.
pub struct WriteGuard<'a, T> {
    guards: Vec<locks::SemaphoreGuard<'a, T>>,
    wq: &'a Waitq
}

impl<T> WaitqRwSignal<T> {
    /// Constructs a new signal around `value`, allowing up to `max_readers` concurrent readers
    /// (or, equivalently, the number of tickets a writer must collect to get exclusive access).
    pub const fn new(value: T, max_readers: usize) -> WaitqRwSignal<T> {
        WaitqRwSignal {
            sem: Semaphore::new(value, max_readers),
            max_readers,
            wq: Waitq::new(false)
        }
    }

    /// Acquires shared (read) access, blocking while every ticket is held by others.
    pub fn read(&self) -> ReadGuard<T> {
        loop {
            match self.sem.try_access() {
                Ok(guard) => return ReadGuard { guard: Some(guard), wq: &self.wq },
                Err(()) => { waitq_sleep_timeout(&self.wq, 0, WaitqFlags::empty()); }
            }
        }
    }

    /// Acquires exclusive (write) access, blocking until every outstanding reader has released
    /// its ticket.
    pub fn write(&self) -> WriteGuard<T> {
        let mut guards = Vec::with_capacity(self.max_readers);
        while guards.len() < self.max_readers {
            match self.sem.try_access_weak() {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    // Give back what we're holding before blocking, so we can't deadlock against
                    // another writer also collecting tickets one at a time.
                    guards.clear();
                    waitq_sleep_timeout(&self.wq, 0, WaitqFlags::empty());
                }
            }
        }
        WriteGuard { guards, wq: &self.wq }
    }
}

unsafe impl<T> Sync for WaitqRwSignal<T> where T: Send {}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard dropped twice")
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        waitq_wakeup(self.wq, WakeMode::First);
    }
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guards[0]
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: this guard holds every one of the semaphore's tickets, so no `ReadGuard` can
        // exist concurrently; exclusive access is therefore sound despite `Semaphore` only ever
        // handing out shared references.
        unsafe { &mut *(&*self.guards[0] as *const T as *mut T) }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        let woken_for = self.guards.len();
        self.guards.clear();
        for _ in 0 .. woken_for {
            waitq_wakeup(self.wq, WakeMode::First);
        }
    }
}
