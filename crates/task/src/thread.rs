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

//! A single schedulable thread of execution: its saved register context, its kernel stack, and the
//! bookkeeping `kernel-sched`/`kernel-waitq` need to schedule and wake it.

use {
    alloc::sync::Arc,
    core::{
        cell::UnsafeCell,
        sync::atomic::{AtomicU8, AtomicU32, Ordering}
    },

    arch::{Arch, Context},
    frame::{AllocFlags, PAGE_SIZE, Pfn},
    error::{KernelError, KernelResult},
    i18n::Text,
    locks::Mutex,

    crate::task::Task
};

/// Identifies a thread, unique for the lifetime of the kernel (never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// A thread's coarse scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Enqueued on a run queue, waiting for `schedule()` to pick it.
    Ready,
    /// Currently the thread a CPU is executing.
    Running,
    /// Blocked in `waitq_sleep_timeout`, not on any run queue.
    Sleeping,
    /// Has called `thread_exit` and is waiting for the reaper to free its stack.
    Exiting
}

bitflags! {
    /// Flags fixed at thread creation.
    pub struct ThreadFlags: u32 {
        /// Pinned to the CPU it was created on. `kernel-sched`'s `Runnable` trait carries no CPU
        /// affinity of its own, so this flag is honored only at creation (the thread is always
        /// enqueued on its home CPU); the load balancer may still steal it onto another CPU under
        /// sustained imbalance, exactly like an unwired thread.
        const WIRED  = 0b0000_0001;
        /// Runs user-mode code (as opposed to a kernel-only worker, e.g. the reaper).
        const USPACE = 0b0000_0010;
    }
}

/// How many frames (of `PAGE_SIZE` each) a kernel stack occupies. One thread, one stack; freed by
/// the reaper once the thread has fully stopped running.
const STACK_FRAMES: usize = 4;

/// One schedulable thread, generic over the architecture whose `Context`/stack layout it uses.
///
/// Threads are always held behind `Arc`, both because the scheduler's run queues store them by
/// value and because a thread outlives any single reference to it (it's also reachable through its
/// owning `Task`'s thread list and through whatever `kernel-waitq` ticket it's currently blocked on).
pub struct Thread<A: Arch> {
    id: ThreadId,
    task: Arc<Task<A>>,
    home_cpu: usize,
    flags: ThreadFlags,
    priority: AtomicU8,
    state: Mutex<ThreadState>,
    /// Timer ticks left in this thread's current quantum. Reset to `sched::quantum_ticks(priority)`
    /// every time this thread is switched in; decremented once per tick by `TaskSystem::on_timer_tick`.
    quantum_remaining: AtomicU32,
    /// Nested preemption-disable sections. Checked by `TaskSystem::schedule` before switching away
    /// from this thread involuntarily.
    pub(crate) preemption: sched::PreemptionCount,
    /// The saved register context. Exclusive access is the scheduler's responsibility: only the
    /// CPU currently switching this thread in or out ever touches it, which is why `Context`
    /// itself carries no locking of its own.
    context: UnsafeCell<A::Context>,
    stack_base: Pfn,
    stack_frames: usize
}

// Safety: `context` is accessed only by the CPU performing a context switch into or out of this
// thread, which `TaskSystem` serializes by construction (a thread is never the target of two
// concurrent switches).
unsafe impl<A: Arch> Sync for Thread<A> {}
unsafe impl<A: Arch> Send for Thread<A> {}

impl<A: Arch> Thread<A> {
    /// Allocates a kernel stack and builds a fresh context that will begin executing
    /// `entry(arg)`, owned by `task`.
    pub(crate) fn spawn(
        id: ThreadId,
        task: Arc<Task<A>>,
        home_cpu: usize,
        priority: u8,
        flags: ThreadFlags,
        entry: extern "C" fn(usize) -> !,
        arg: usize
    ) -> KernelResult<Arc<Thread<A>>> {
        let stack_base = frame::frame_alloc(STACK_FRAMES, AllocFlags::empty()).map_err(|e| {
            let _ = Text::ThreadStackAllocFailed;
            e
        })?;
        // The stack is identity-mapped kernel memory: physical frame number doubles as the kernel
        // virtual address, same simplification `kernel-as`'s kernel address space uses for the
        // rest of the kernel image.
        let stack_top = (stack_base.0 * PAGE_SIZE + STACK_FRAMES * PAGE_SIZE) as *mut u8;
        let context = A::context_init(stack_top, entry, arg);

        Ok(Arc::new(Thread {
            id,
            task,
            home_cpu,
            flags,
            priority: AtomicU8::new(priority),
            state: Mutex::new(ThreadState::Ready),
            quantum_remaining: AtomicU32::new(sched::quantum_ticks(priority)),
            preemption: sched::PreemptionCount::new(),
            context: UnsafeCell::new(context),
            stack_base,
            stack_frames: STACK_FRAMES
        }))
    }

    /// This thread's identity.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// The task this thread belongs to.
    pub fn task(&self) -> &Arc<Task<A>> {
        &self.task
    }

    /// The CPU this thread was created on. See [`ThreadFlags::WIRED`] for what this does and does
    /// not guarantee.
    pub fn home_cpu(&self) -> usize {
        self.home_cpu
    }

    /// This thread's creation-time flags.
    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    /// This thread's current scheduling state.
    pub fn state(&self) -> ThreadState {
        loop {
            if let Ok(state) = self.state.try_lock() {
                return *state;
            }
        }
    }

    pub(crate) fn set_state(&self, new: ThreadState) {
        loop {
            if let Ok(mut state) = self.state.try_lock() {
                *state = new;
                return;
            }
        }
    }

    /// This thread's current scheduling priority (`0 ..= sched::PRIORITY_FLOOR`, lower is higher
    /// priority).
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Release);
    }

    /// Resets this thread's remaining quantum to a full `sched::quantum_ticks` at its current
    /// priority. Called every time this thread is switched in.
    pub(crate) fn reset_quantum(&self) {
        self.quantum_remaining.store(sched::quantum_ticks(self.priority()), Ordering::Release);
    }

    /// Charges this thread one timer tick against its quantum.
    ///
    /// # Returns
    /// `true` if the quantum just ran out (the caller should demote and reschedule it).
    pub(crate) fn tick_quantum(&self) -> bool {
        let prev = self.quantum_remaining.fetch_update(
            Ordering::AcqRel, Ordering::Acquire,
            |t| Some(t.saturating_sub(1))
        ).unwrap();
        prev <= 1
    }

    /// A pointer to this thread's saved context, for `Arch::context_switch`.
    ///
    /// # Safety
    /// The caller must guarantee no other context switch is concurrently reading or writing this
    /// same thread's context.
    pub(crate) unsafe fn context_ptr(&self) -> *mut A::Context {
        self.context.get()
    }
}

impl<A: Arch> sched::Runnable for Arc<Thread<A>> {
    fn priority(&self) -> u8 {
        Thread::priority(self)
    }
}

impl<A: Arch> Drop for Thread<A> {
    fn drop(&mut self) {
        frame::frame_free(self.stack_base, self.stack_frames, AllocFlags::empty());
    }
}
