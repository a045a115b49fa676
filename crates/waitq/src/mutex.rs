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

//! A mutex that actually puts a losing thread to sleep, built by wrapping `kernel-locks::Mutex`
//! (which only ever spins or fails) with a `Waitq` that wakes one waiter per unlock.

use core::ops::{Deref, DerefMut};

use locks::Mutex as SpinMutex;

use crate::{Waitq, WakeMode, WaitqFlags, waitq_sleep_timeout, waitq_wakeup};

/// A mutual-exclusion lock whose `lock()` blocks the calling thread (via `waitq_sleep_timeout`)
/// instead of spinning when contended.
pub struct WaitqMutex<T> {
    inner: SpinMutex<T>,
    wq: Waitq
}

/// An RAII guard for a `WaitqMutex`. Wakes one blocked waiter, if any, when dropped.
pub struct WaitqMutexGuard<'a, T> {
    // Only `None` during the brief window inside `Drop::drop`.
    guard: Option<locks::MutexGuard<'a, T>>,
    wq: &'a Waitq
}

impl<T> WaitqMutex<T> {
    /// Constructs a new, unlocked mutex around `value`.
    pub const fn new(value: T) -> WaitqMutex<T> {
        WaitqMutex { inner: SpinMutex::new(value), wq: Waitq::new(false) }
    }

    /// Locks the mutex, blocking the calling thread for as long as it's held elsewhere.
    pub fn lock(&self) -> WaitqMutexGuard<T> {
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return WaitqMutexGuard { guard: Some(guard), wq: &self.wq },
                Err(()) => { waitq_sleep_timeout(&self.wq, 0, WaitqFlags::empty()); }
            }
        }
    }

    /// Attempts to lock the mutex without blocking.
    pub fn try_lock(&self) -> Result<WaitqMutexGuard<T>, ()> {
        self.inner.try_lock().map(|guard| WaitqMutexGuard { guard: Some(guard), wq: &self.wq })
    }
}

unsafe impl<T> Sync for WaitqMutex<T> where T: Send {}

impl<'a, T> Deref for WaitqMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard dropped twice")
    }
}

impl<'a, T> DerefMut for WaitqMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard dropped twice")
    }
}

impl<'a, T> Drop for WaitqMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.guard.take();
        waitq_wakeup(self.wq, WakeMode::First);
    }
}
