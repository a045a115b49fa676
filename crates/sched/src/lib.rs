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

//! Per-CPU run queues and the `schedule()` decision: which runnable thing runs next, and what to
//! do when this CPU's own queues are empty.
//!
//! This crate has no idea what a thread or a task is -- it schedules anything implementing
//! [`Runnable`], identified to the caller only by the value it gave us back. That keeps the
//! dependency graph acyclic: `kernel-task` depends on this crate (a thread is a runnable thing),
//! not the other way around. Preemption scoping ([`PreemptionCount`]) lives here too, since it's
//! inseparable from the scheduling decisions this crate makes.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;

use {
    alloc::{collections::VecDeque, vec::Vec},
    core::sync::atomic::{AtomicU64, AtomicUsize, Ordering},

    i18n::Text,
    locks::Mutex,
};

/// Number of priority levels (run queues) per CPU. Priority 0 is highest.
pub const NUM_PRIORITIES: usize = 16;
/// The lowest priority a thread can be demoted to by aging.
pub const PRIORITY_FLOOR: u8 = (NUM_PRIORITIES - 1) as u8;

fn priority_level(priority: u8) -> usize {
    core::cmp::min(priority as usize, NUM_PRIORITIES - 1)
}

/// Demotes a priority by one level after a thread runs a full quantum and voluntarily yields,
/// never past [`PRIORITY_FLOOR`].
pub fn demote(priority: u8) -> u8 {
    core::cmp::min(priority.saturating_add(1), PRIORITY_FLOOR)
}

/// Promotes a priority by one level, e.g. on wakeup from a long sleep. Never past 0.
pub fn promote(priority: u8) -> u8 {
    priority.saturating_sub(1)
}

/// How many timer ticks a thread at the given priority gets before `schedule()` should look for
/// something else to run. Linear in priority, the same shape as the quantum the teacher's
/// scheduler computed from a thread's priority.
pub fn quantum_ticks(priority: u8) -> u32 {
    priority as u32 + 1
}

/// Anything this crate can place on a run queue. `kernel-task`'s `Arc<Thread<A>>` is the only
/// real implementor; `priority()` must agree with whichever queue the item is currently enqueued
/// on (the scheduler trusts it when re-deriving a queue index, e.g. while stealing).
pub trait Runnable {
    /// This item's current scheduling priority, `0 ..= PRIORITY_FLOOR`.
    fn priority(&self) -> u8;
}

/// A per-thread counter of nested preemption-disable sections. While nonzero, timer-driven
/// rescheduling on this thread is deferred; the IPC fast paths and context switches this kernel
/// takes all run with preemption disabled.
pub struct PreemptionCount(AtomicUsize);

impl PreemptionCount {
    /// A freshly created counter, with preemption enabled.
    pub const fn new() -> PreemptionCount {
        PreemptionCount(AtomicUsize::new(0))
    }

    /// Disables preemption, returning a guard that re-enables it (decrementing, so nested
    /// sections nest correctly) on every exit path -- including an early return or an unwind --
    /// when dropped.
    pub fn disable(&self) -> PreemptionGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        PreemptionGuard(self)
    }

    /// Whether any `disable` guard for this counter is currently outstanding.
    pub fn is_disabled(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

impl Default for PreemptionCount {
    fn default() -> PreemptionCount { PreemptionCount::new() }
}

/// RAII guard returned by [`PreemptionCount::disable`].
pub struct PreemptionGuard<'a>(&'a PreemptionCount);

impl<'a> Drop for PreemptionGuard<'a> {
    fn drop(&mut self) {
        self.0.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pseudorandom step sizes for the load balancer's two jitter streams (picking which peer queue
/// to start scanning from, and fuzzing the steal budget). Taken from the teacher's scheduler,
/// which in turn pulled the state from PCG output and chose steps coprime with 2^64 and each
/// other so the two streams never correlate.
const RAND_STEP: [u64; 2] = [1223, 2731];
const RAND_PICK_PEER: usize = 0;
const RAND_FUZZ_BUDGET: usize = 1;

struct PerCpu<T> {
    queues: Vec<Mutex<VecDeque<T>>>,
    ready_count: AtomicUsize,
    /// Ticks since this CPU's queues were last found non-empty; unused by the algorithm itself
    /// beyond bookkeeping callers may want for diagnostics.
    needs_relink: AtomicUsize,
    rand_state: [AtomicU64; 2],
}

impl<T> PerCpu<T> {
    fn new(cpu: u64) -> PerCpu<T> {
        let mut queues = Vec::with_capacity(NUM_PRIORITIES);
        for _ in 0 .. NUM_PRIORITIES {
            queues.push(Mutex::new(VecDeque::new()));
        }
        PerCpu {
            queues,
            ready_count: AtomicUsize::new(0),
            needs_relink: AtomicUsize::new(0),
            rand_state: [
                AtomicU64::new(cpu.wrapping_mul(0x7e1c)),
                AtomicU64::new(cpu.wrapping_mul(0x0330)),
            ],
        }
    }

    fn rand(&self, stream: usize) -> u64 {
        self.rand_state[stream].fetch_add(RAND_STEP[stream], Ordering::Relaxed).wrapping_add(RAND_STEP[stream])
    }
}

/// Per-CPU multi-level run queues plus the load-balancing pass between them.
///
/// Generic over `T: Runnable`; owns no information about what `T` actually is beyond its
/// priority. One `Scheduler` exists for the lifetime of the kernel, sized to the machine's CPU
/// count at construction.
pub struct Scheduler<T> {
    percpu: Vec<PerCpu<T>>,
}

impl<T> Scheduler<T> {
    /// Creates a scheduler with empty run queues for `cpu_count` CPUs.
    pub fn new(cpu_count: usize) -> Scheduler<T> {
        Scheduler {
            percpu: (0 .. cpu_count as u64).map(PerCpu::new).collect(),
        }
    }

    /// The number of CPUs this scheduler was built for.
    pub fn cpu_count(&self) -> usize {
        self.percpu.len()
    }

    /// The number of ready (enqueued, not running) items on `cpu`'s run queues.
    pub fn ready_count(&self, cpu: usize) -> usize {
        self.percpu[cpu].ready_count.load(Ordering::Acquire)
    }

    /// How many consecutive `schedule()` calls on `cpu` have found every queue empty, reset to 0
    /// the moment one doesn't. A rising count is this scheduler's signal that `cpu` is a good
    /// target to steal work onto, independent of the load balancer's own peer scan.
    pub fn needs_relink(&self, cpu: usize) -> usize {
        self.percpu[cpu].needs_relink.load(Ordering::Relaxed)
    }
}

impl<T: Runnable> Scheduler<T> {
    /// Places `item` onto `cpu`'s run queue at its current priority. Called both for a thread
    /// becoming ready on its own CPU and, internally, when the load balancer steals one from a
    /// peer.
    pub fn enqueue(&self, cpu: usize, item: T) {
        let level = priority_level(item.priority());
        let pc = &self.percpu[cpu];
        loop {
            if let Ok(mut q) = pc.queues[level].try_lock() {
                q.push_back(item);
                break;
            }
        }
        pc.ready_count.fetch_add(1, Ordering::AcqRel);
    }

    /// The `schedule()` decision: walk `cpu`'s run queues from priority 0 upward and return the
    /// first one's head; if every queue is empty, attempt load balancing; if that also finds
    /// nothing, return `None` (the caller should idle, e.g. `Arch::wait_for_interrupt`).
    pub fn schedule(&self, cpu: usize) -> Option<T> {
        let pc = &self.percpu[cpu];
        for level in 0 .. NUM_PRIORITIES {
            if let Some(item) = pop_front(&pc.queues[level]) {
                pc.ready_count.fetch_sub(1, Ordering::AcqRel);
                pc.needs_relink.store(0, Ordering::Relaxed);
                return Some(item);
            }
        }

        pc.needs_relink.fetch_add(1, Ordering::Relaxed);
        if let Some(item) = self.load_balance(cpu) {
            return Some(item);
        }

        let _ = Text::SchedAllQueuesEmpty;
        None
    }

    /// Iterates peer CPUs in round-robin (starting from a pseudorandom offset so repeated calls
    /// don't always probe the same CPU first), stealing up to `average_ready / 4` threads from
    /// the first overloaded peer's lowest-priority (highest-numbered) non-empty queues, then
    /// returns one of the stolen items to run immediately.
    fn load_balance(&self, cpu: usize) -> Option<T> {
        let n = self.percpu.len();
        if n <= 1 {
            return None;
        }

        let total_ready: usize = self.percpu.iter().map(|p| p.ready_count.load(Ordering::Acquire)).sum();
        let average_ready = total_ready / n;
        let me = &self.percpu[cpu];
        let jitter = (me.rand(RAND_FUZZ_BUDGET) % 2) as usize;
        let budget = (average_ready / 4).saturating_sub(jitter);
        if budget == 0 {
            return None;
        }

        let start = (me.rand(RAND_PICK_PEER) as usize) % n;
        for step in 1 .. n {
            let peer_idx = (start + step) % n;
            if peer_idx == cpu {
                continue;
            }
            let peer = &self.percpu[peer_idx];
            if peer.ready_count.load(Ordering::Acquire) == 0 {
                continue;
            }

            let mut stolen = 0usize;
            for level in (0 .. NUM_PRIORITIES).rev() {
                while stolen < budget {
                    match pop_back(&peer.queues[level]) {
                        Some(item) => {
                            peer.ready_count.fetch_sub(1, Ordering::AcqRel);
                            self.enqueue(cpu, item);
                            stolen += 1;
                        }
                        None => break
                    }
                }
                if stolen >= budget {
                    break;
                }
            }

            if stolen > 0 {
                for level in 0 .. NUM_PRIORITIES {
                    if let Some(item) = pop_front(&me.queues[level]) {
                        me.ready_count.fetch_sub(1, Ordering::AcqRel);
                        return Some(item);
                    }
                }
            }
        }
        None
    }
}

fn pop_front<T>(q: &Mutex<VecDeque<T>>) -> Option<T> {
    loop {
        if let Ok(mut q) = q.try_lock() {
            return q.pop_front();
        }
    }
}

fn pop_back<T>(q: &Mutex<VecDeque<T>>) -> Option<T> {
    loop {
        if let Ok(mut q) = q.try_lock() {
            return q.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU8;

    #[derive(Clone)]
    struct TestThread(Arc<AtomicU8>);

    impl TestThread {
        fn new(priority: u8) -> TestThread {
            TestThread(Arc::new(AtomicU8::new(priority)))
        }
    }

    impl Runnable for TestThread {
        fn priority(&self) -> u8 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn schedule_picks_highest_priority_first() {
        let sched: Scheduler<TestThread> = Scheduler::new(1);
        let low = TestThread::new(10);
        let high = TestThread::new(0);
        sched.enqueue(0, low.clone());
        sched.enqueue(0, high.clone());

        let picked = sched.schedule(0).unwrap();
        assert!(Arc::ptr_eq(&picked.0, &high.0));
        let picked = sched.schedule(0).unwrap();
        assert!(Arc::ptr_eq(&picked.0, &low.0));
    }

    #[test]
    fn schedule_returns_none_when_every_queue_on_every_cpu_is_empty() {
        let sched: Scheduler<TestThread> = Scheduler::new(2);
        assert!(sched.schedule(0).is_none());
        assert!(sched.schedule(1).is_none());
    }

    #[test]
    fn load_balancing_steals_from_an_overloaded_peer() {
        let sched: Scheduler<TestThread> = Scheduler::new(2);
        for _ in 0 .. 16 {
            sched.enqueue(1, TestThread::new(15));
        }

        // CPU 0's own queues are empty, so schedule() must fall through to load balancing and
        // come back with something instead of None.
        let picked = sched.schedule(0);
        assert!(picked.is_some());
        assert!(sched.ready_count(1) < 16, "load balancing should have moved at least one thread");
    }

    #[test]
    fn priority_aging_demotes_and_promotes_within_bounds() {
        assert_eq!(demote(0), 1);
        assert_eq!(demote(PRIORITY_FLOOR), PRIORITY_FLOOR);
        assert_eq!(promote(0), 0);
        assert_eq!(promote(5), 4);
    }

    #[test]
    fn preemption_guard_nests_and_restores_on_every_exit_path() {
        let count = PreemptionCount::new();
        assert!(!count.is_disabled());
        {
            let _outer = count.disable();
            assert!(count.is_disabled());
            {
                let _inner = count.disable();
                assert!(count.is_disabled());
            }
            assert!(count.is_disabled(), "dropping the inner guard must not re-enable preemption early");
        }
        assert!(!count.is_disabled());
    }
}
