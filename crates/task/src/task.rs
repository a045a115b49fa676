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

//! A task: an address space, an answerbox, a capability table, and the threads running inside it.

use {
    alloc::{sync::Arc, vec::Vec},

    arch::Arch,
    address_space::AddressSpace,
    cap::CapTable,
    ipc::{Answerbox, TaskId},
    locks::Mutex,

    crate::thread::Thread
};

/// One task: the unit `kernel-as`'s address space, `kernel-ipc`'s answerbox, and `kernel-cap`'s
/// capability table are scoped to. Threads are owned here, not the other way around, so that the
/// last thread exiting can tear the rest of this down.
pub struct Task<A: Arch> {
    id: TaskId,
    as_: Arc<AddressSpace<A>>,
    answerbox: Arc<Answerbox>,
    captable: CapTable,
    threads: Mutex<Vec<Arc<Thread<A>>>>
}

// Safety: every field is reached only through its own internal locking (or, for `as_`/`answerbox`,
// types that already guarantee this themselves); nothing here is touched by raw field access
// across threads.
unsafe impl<A: Arch> Sync for Task<A> {}
unsafe impl<A: Arch> Send for Task<A> {}

impl<A: Arch> Task<A> {
    /// Creates a new task rooted at a freshly allocated page table (or, if `inherit` is given, one
    /// sharing that address space instead -- used for spawning a second thread into an existing
    /// task rather than a whole new process).
    pub(crate) fn new(id: TaskId, as_: Arc<AddressSpace<A>>) -> Arc<Task<A>> {
        Arc::new(Task {
            id,
            as_,
            answerbox: Arc::new(Answerbox::new()),
            captable: CapTable::new(),
            threads: Mutex::new(Vec::new())
        })
    }

    /// This task's identity, as seen by `kernel-ipc`.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// This task's address space.
    pub fn address_space(&self) -> &Arc<AddressSpace<A>> {
        &self.as_
    }

    /// The answerbox every IPC call addressed to this task passes through.
    pub fn answerbox(&self) -> &Arc<Answerbox> {
        &self.answerbox
    }

    /// This task's capability table.
    pub fn captable(&self) -> &CapTable {
        &self.captable
    }

    pub(crate) fn add_thread(&self, thread: Arc<Thread<A>>) {
        loop {
            if let Ok(mut threads) = self.threads.try_lock() {
                threads.push(thread);
                return;
            }
        }
    }

    /// Removes `thread` from this task's thread list (called once the thread has fully exited),
    /// and reports whether this was the task's last thread.
    pub(crate) fn remove_thread(&self, id: crate::thread::ThreadId) -> bool {
        loop {
            if let Ok(mut threads) = self.threads.try_lock() {
                threads.retain(|t| t.id() != id);
                return threads.is_empty();
            }
        }
    }

    /// The number of threads currently belonging to this task.
    pub fn thread_count(&self) -> usize {
        loop {
            if let Ok(threads) = self.threads.try_lock() {
                return threads.len();
            }
        }
    }
}
