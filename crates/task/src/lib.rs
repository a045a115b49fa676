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

//! Tasks and threads: the layer that ties `kernel-sched`'s run queues, `kernel-as`'s address
//! spaces, `kernel-ipc`'s answerboxes and `kernel-cap`'s capability tables together into something
//! that can actually be scheduled, and the one implementation of `kernel-waitq::Scheduler` that
//! lets every blocking primitive in the kernel suspend a thread.
//!
//! `TaskSystem<A>` owns everything: the per-CPU `sched::Scheduler`, every live `Task`/`Thread`, the
//! table of currently sleeping wait tickets, and a per-CPU reaper queue of threads that have
//! exited but whose kernel stack hasn't been freed yet. One instance exists for the kernel's
//! lifetime, built at boot with the machine's CPU count and registered with
//! [`waitq::register_scheduler`] through [`TaskSystem::register`].

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;
#[macro_use] extern crate bitflags;

mod task;
mod thread;

use {
    alloc::{boxed::Box, sync::Arc, vec::Vec},
    core::{
        mem,
        sync::atomic::{AtomicU64, AtomicU8, Ordering}
    },

    arch::Arch,
    address_space::AddressSpace,
    error::{KernelError, KernelResult},
    frame::{AllocFlags, PAGE_SIZE},
    i18n::Text,
    ipc::TaskId,
    locks::Mutex,
    waitq::{WaitTicket, WakeReason}
};

pub use task::Task;
pub use thread::{Thread, ThreadFlags, ThreadId, ThreadState};

/// Hard ceiling on the number of simultaneously live tasks, matching every other table in this
/// kernel being a fixed-size resource rather than growing without bound.
pub const MAX_TASKS: usize = 4096;

/// Microseconds represented by one timer tick. Stands in for `Arch::timer_set_next`'s real
/// calibration, which is boot glue outside this crate's scope; a real port fixes this once the
/// timer's actual frequency is known.
const TICK_USEC: u64 = 1000;

fn usec_to_ticks(usec: u64) -> u64 {
    core::cmp::max(1, (usec + TICK_USEC - 1) / TICK_USEC)
}

/// Why a `SleepSlot` resolved, encoded so it can live behind an `AtomicU8`.
const CODE_PENDING: u8 = 0;
const CODE_WOKEN: u8 = 1;
const CODE_TIMED_OUT: u8 = 2;
const CODE_INTERRUPTED: u8 = 3;

/// One registered-but-not-yet-resolved `waitq` sleep: the ticket `Waitq`/`waitq_sleep_timeout`
/// knows it by, the thread to wake, and (if there's a deadline) how many timer ticks are left.
struct SleepSlot<A: Arch> {
    ticket: WaitTicket,
    thread: Arc<Thread<A>>,
    had_deadline: bool,
    ticks_remaining: AtomicU64,
    code: AtomicU8
}

/// Runs on any CPU with nothing else ready. Also the entry point baked into each CPU's
/// discarded-after-first-use boot context (see `TaskSystem::boot_context_ptr`); it is never
/// actually reached there, since that context only ever serves as a place to save a register
/// state into, not to resume from.
extern "C" fn idle_loop<A: Arch>(_arg: usize) -> ! {
    loop {
        A::wait_for_interrupt();
    }
}

/// Owns every task and thread in the system, the per-CPU scheduler backing them, and the
/// `waitq::Scheduler` registration that lets any blocking primitive suspend a thread.
pub struct TaskSystem<A: Arch> {
    scheduler: sched::Scheduler<Arc<Thread<A>>>,
    current: Vec<Mutex<Option<Arc<Thread<A>>>>>,
    /// A throwaway context per CPU, lazily built, that the first `switch_to` call on that CPU
    /// saves its caller's (boot-time) register state into. Never resumed: once something real has
    /// run on a CPU, `current` is always `Some` before the next switch.
    boot_ctx: Vec<Mutex<Option<Box<A::Context>>>>,
    sleeping: Mutex<Vec<Arc<SleepSlot<A>>>>,
    reap_queues: Vec<Mutex<Vec<Arc<Thread<A>>>>>,
    tasks: Mutex<Vec<Arc<Task<A>>>>,
    next_task_id: AtomicU64,
    next_thread_id: AtomicU64
}

impl<A: Arch> TaskSystem<A> {
    /// Creates a task system with empty, per-CPU state for `cpu_count` CPUs.
    pub fn new(cpu_count: usize) -> TaskSystem<A> {
        TaskSystem {
            scheduler: sched::Scheduler::new(cpu_count),
            current: (0 .. cpu_count).map(|_| Mutex::new(None)).collect(),
            boot_ctx: (0 .. cpu_count).map(|_| Mutex::new(None)).collect(),
            sleeping: Mutex::new(Vec::new()),
            reap_queues: (0 .. cpu_count).map(|_| Mutex::new(Vec::new())).collect(),
            tasks: Mutex::new(Vec::new()),
            next_task_id: AtomicU64::new(1),
            next_thread_id: AtomicU64::new(1)
        }
    }

    /// Registers `system` as the kernel's one scheduler, so every `kernel-waitq` blocking
    /// primitive can suspend and resume through it. Called once, at boot, after leaking a
    /// `'static` `TaskSystem`.
    pub fn register(system: &'static TaskSystem<A>) {
        waitq::register_scheduler(system);
    }

    /// The number of CPUs this task system was built for.
    pub fn cpu_count(&self) -> usize {
        self.scheduler.cpu_count()
    }

    /// The number of tasks currently alive.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// The thread currently running on `cpu`, if any.
    pub fn current(&self, cpu: usize) -> Option<Arc<Thread<A>>> {
        self.current[cpu].lock().clone()
    }

    fn set_current(&self, cpu: usize, thread: Option<Arc<Thread<A>>>) -> Option<Arc<Thread<A>>> {
        mem::replace(&mut *self.current[cpu].lock(), thread)
    }

    fn boot_context_ptr(&self, cpu: usize) -> *mut A::Context {
        let mut slot = self.boot_ctx[cpu].lock();
        if slot.is_none() {
            let stack = frame::frame_alloc(1, AllocFlags::empty())
                .expect("failed to allocate a boot context stack");
            let stack_top = (stack.0 * PAGE_SIZE + PAGE_SIZE) as *mut u8;
            *slot = Some(Box::new(A::context_init(stack_top, idle_loop::<A>, 0)));
        }
        slot.as_mut().unwrap().as_mut() as *mut A::Context
    }

    /// Creates a new task rooted at `pt_root` (a page-table-root physical address the caller has
    /// already prepared) and spawns its first thread, enqueued ready on `cpu`.
    pub fn spawn_task(
        &'static self,
        pt_root: usize,
        cpu: usize,
        priority: u8,
        entry: extern "C" fn(usize) -> !,
        arg: usize
    ) -> KernelResult<Arc<Task<A>>> {
        if self.tasks.lock().len() >= MAX_TASKS {
            let _ = Text::TaskLimitReached(&MAX_TASKS);
            return Err(KernelError::Limit);
        }

        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let as_ = AddressSpace::new(pt_root);
        let task = Task::new(id, as_);

        self.spawn_thread(&task, cpu, priority, ThreadFlags::USPACE, entry, arg)?;

        self.tasks.lock().push(Arc::clone(&task));
        Ok(task)
    }

    /// Spawns an additional thread into an existing task, enqueued ready on `cpu`.
    pub fn spawn_thread(
        &self,
        task: &Arc<Task<A>>,
        cpu: usize,
        priority: u8,
        flags: ThreadFlags,
        entry: extern "C" fn(usize) -> !,
        arg: usize
    ) -> KernelResult<Arc<Thread<A>>> {
        let id = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let thread = Thread::spawn(id, Arc::clone(task), cpu, priority, flags, entry, arg)?;
        task.add_thread(Arc::clone(&thread));
        self.scheduler.enqueue(cpu, Arc::clone(&thread));
        Ok(thread)
    }

    /// The `schedule()` decision: pick the next runnable thread for `cpu` (falling back to load
    /// balancing, then idling) and switch into it.
    ///
    /// Does not requeue whoever was running before the call; that's the caller's job (see
    /// [`Self::yield_now`]/[`Self::thread_exit`]), so that a thread giving up the CPU because it's
    /// about to sleep or exit is never accidentally made ready again.
    pub fn schedule(&self, cpu: usize) {
        match self.scheduler.schedule(cpu) {
            Some(next) => self.switch_to(cpu, next),
            None => A::wait_for_interrupt()
        }
    }

    fn switch_to(&self, cpu: usize, next: Arc<Thread<A>>) {
        let prev = self.set_current(cpu, Some(Arc::clone(&next)));
        if let Some(ref p) = prev {
            if Arc::ptr_eq(p, &next) {
                return;
            }
        }

        next.set_state(ThreadState::Running);
        next.reset_quantum();

        let prev_ctx = match &prev {
            Some(p) => unsafe { p.context_ptr() },
            None => self.boot_context_ptr(cpu)
        };
        let next_ctx = unsafe { next.context_ptr() } as *const A::Context;
        unsafe {
            A::context_switch(prev_ctx, next_ctx);
        }
    }

    /// Yields the calling thread voluntarily: ages its priority down one level (it used its full
    /// quantum by choice), re-enqueues it as ready, and calls `schedule`.
    pub fn yield_now(&self, cpu: usize) {
        if let Some(thread) = self.current(cpu) {
            thread.set_priority(sched::demote(thread.priority()));
            thread.set_state(ThreadState::Ready);
            self.scheduler.enqueue(cpu, thread);
        }
        self.schedule(cpu);
    }

    /// Called once per timer tick on `cpu`. Ages every sleeper with a deadline and, if the
    /// running thread has exhausted its quantum, demotes and re-enqueues it.
    ///
    /// # Returns
    /// `true` if the running thread's quantum just ran out, meaning the arch-specific interrupt
    /// epilogue (outside this crate) should call [`Self::schedule`] before returning to user code.
    pub fn on_timer_tick(&self, cpu: usize) -> bool {
        self.tick_deadlines();

        if let Some(thread) = self.current(cpu) {
            if thread.tick_quantum() {
                thread.set_priority(sched::demote(thread.priority()));
                thread.set_state(ThreadState::Ready);
                self.scheduler.enqueue(cpu, thread);
                return true;
            }
        }
        false
    }

    fn tick_deadlines(&self) {
        let mut timed_out = Vec::new();
        self.sleeping.lock().retain(|slot| {
            if !slot.had_deadline {
                return true;
            }
            if slot.ticks_remaining.fetch_sub(1, Ordering::AcqRel) <= 1 {
                timed_out.push(Arc::clone(slot));
                false
            } else {
                true
            }
        });
        for slot in timed_out {
            let _ = Text::WaitqTimedOut;
            slot.code.store(CODE_TIMED_OUT, Ordering::Release);
        }
    }

    fn take_sleeping(&self, ticket: WaitTicket) -> Option<Arc<SleepSlot<A>>> {
        let mut sleeping = self.sleeping.lock();
        let pos = sleeping.iter().position(|s| s.ticket == ticket)?;
        Some(sleeping.remove(pos))
    }

    /// Called by the per-CPU reaper, out of interrupt context, to drop every thread that exited on
    /// `cpu` since the last call (freeing its kernel stack via `Thread`'s `Drop`). Returns how
    /// many were reaped.
    pub fn reap(&self, cpu: usize) -> usize {
        let exited = mem::take(&mut *self.reap_queues[cpu].lock());
        let count = exited.len();
        drop(exited);
        count
    }

    /// The non-diverging half of [`Self::thread_exit`]: marks the thread currently running on
    /// `cpu` exiting, removes it from its task (tearing the task down -- sweeping its capability
    /// table and discarding any outstanding IPC calls -- if it was the task's last thread), and
    /// hands it to `cpu`'s reaper queue. Split out so it can be exercised without also having to
    /// drive the infinite rescheduling loop that follows it on real hardware.
    fn finish_exit(&self, cpu: usize) {
        if let Some(thread) = self.set_current(cpu, None) {
            thread.set_state(ThreadState::Exiting);
            let task = Arc::clone(thread.task());
            if task.remove_thread(thread.id()) {
                task.captable().sweep();
                let outstanding = task.answerbox().drain_outstanding();
                ipc::discard_outstanding(&outstanding);
                self.tasks.lock().retain(|t| t.id() != task.id());
            }
            self.reap_queues[cpu].lock().push(thread);
        }
    }

    /// Terminates the thread currently running on `cpu` (see [`Self::finish_exit`]). Never
    /// returns; the first successful `schedule` here switches to whatever else is runnable and,
    /// on real hardware, never hands control back to this stack.
    pub fn thread_exit(&self, cpu: usize) -> ! {
        self.finish_exit(cpu);
        loop {
            self.schedule(cpu);
        }
    }
}

impl<A: Arch> waitq::Scheduler for TaskSystem<A> {
    fn block(&self, ticket: WaitTicket, deadline_usec: Option<u64>, _interruptible: bool) -> WakeReason {
        let cpu = A::cpu_index();
        let thread = self.current(cpu).expect("waitq block() called with no current thread");
        thread.set_state(ThreadState::Sleeping);

        let slot = Arc::new(SleepSlot {
            ticket,
            thread: Arc::clone(&thread),
            had_deadline: deadline_usec.is_some(),
            ticks_remaining: AtomicU64::new(deadline_usec.map_or(0, usec_to_ticks)),
            code: AtomicU8::new(CODE_PENDING)
        });
        self.sleeping.lock().push(Arc::clone(&slot));

        // On hardware where `Arch::context_switch` actually suspends this thread, the loop below
        // runs exactly once per resumption: `schedule` hands the CPU to another ready thread and
        // only returns here once `ready` (or a tick deadline) has set `slot.code`. On the
        // software-only `test` Arch, where `context_switch` never actually leaves this stack, this
        // degrades to a spin that still gives other ready threads a turn on every iteration.
        //
        // `_interruptible` goes unused: nothing in this kernel yet delivers a pending-signal
        // check into a sleeping thread, so `CODE_INTERRUPTED` is reachable only in principle.
        loop {
            match slot.code.load(Ordering::Acquire) {
                CODE_WOKEN => {
                    thread.set_state(ThreadState::Ready);
                    return WakeReason::Woken;
                }
                CODE_TIMED_OUT => {
                    thread.set_state(ThreadState::Ready);
                    return WakeReason::TimedOut;
                }
                CODE_INTERRUPTED => {
                    thread.set_state(ThreadState::Ready);
                    return WakeReason::Interrupted;
                }
                _ => self.schedule(cpu)
            }
        }
    }

    fn ready(&self, ticket: WaitTicket, reason: WakeReason) {
        if let Some(slot) = self.take_sleeping(ticket) {
            if reason == WakeReason::Woken && !slot.had_deadline {
                slot.thread.set_priority(sched::promote(slot.thread.priority()));
            }
            let code = match reason {
                WakeReason::Woken => CODE_WOKEN,
                WakeReason::TimedOut => CODE_TIMED_OUT,
                WakeReason::Interrupted => CODE_INTERRUPTED
            };
            slot.code.store(code, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arch::test::TestArch;

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        loop {}
    }

    static FRAMES_READY: Mutex<bool> = Mutex::new(false);

    // `kernel-frame`'s zone table is a process-wide static shared by every test in this binary;
    // register one generous zone, once, instead of fighting over a reset.
    fn ensure_frames() {
        let mut ready = FRAMES_READY.lock();
        if !*ready {
            frame::register_zone(frame::Zone::new(frame::Pfn(0), 65536, frame::ZoneFlags::AVAILABLE | frame::ZoneFlags::LOWMEM));
            *ready = true;
        }
    }

    fn new_system(cpu_count: usize) -> &'static TaskSystem<TestArch> {
        ensure_frames();
        Box::leak(Box::new(TaskSystem::new(cpu_count)))
    }

    #[test]
    fn spawn_task_creates_a_task_with_one_ready_thread() {
        let system = new_system(1);
        let task = system.spawn_task(0x1000, 0, 5, dummy_entry, 0).unwrap();
        assert_eq!(task.thread_count(), 1);
        assert_eq!(system.task_count(), 1);
        assert_eq!(system.scheduler.ready_count(0), 1);
    }

    #[test]
    fn schedule_runs_the_highest_priority_thread_first() {
        let system = new_system(1);
        let high_task = system.spawn_task(0x2000, 0, 10, dummy_entry, 1).unwrap();
        let low_task = system.spawn_task(0x3000, 0, 0, dummy_entry, 2).unwrap();

        system.schedule(0);
        let running = system.current(0).expect("schedule should have picked a thread");
        assert_eq!(running.priority(), 0, "the priority-0 thread should run before the priority-10 one");

        let _ = high_task;
        let _ = low_task;
    }

    #[test]
    fn thread_exit_tears_down_a_single_thread_task_and_the_reaper_frees_its_stack() {
        let system = new_system(1);
        let task = system.spawn_task(0x4000, 0, 5, dummy_entry, 0).unwrap();
        system.schedule(0);
        assert_eq!(system.task_count(), 1);

        // `thread_exit` itself never returns (it loops into `schedule` forever on real hardware);
        // exercise its non-diverging teardown half directly instead.
        system.finish_exit(0);

        assert_eq!(system.task_count(), 0, "the exiting task should have been torn down");
        assert_eq!(system.reap(0), 1, "the reaper should find exactly the one exited thread");
        let _ = task;
    }

    #[test]
    fn on_timer_tick_demotes_the_running_thread_once_its_quantum_is_exhausted() {
        let system = new_system(1);
        let task = system.spawn_task(0x6000, 0, 0, dummy_entry, 0).unwrap();
        system.schedule(0);
        let thread = system.current(0).unwrap();
        assert_eq!(thread.priority(), 0);

        let quantum = sched::quantum_ticks(0);
        let mut preempted = false;
        for _ in 0 .. quantum {
            preempted = system.on_timer_tick(0);
        }
        assert!(preempted, "the quantum should have been exhausted by now");
        assert_eq!(thread.priority(), sched::demote(0));
        let _ = task;
    }
}
