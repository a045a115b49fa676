/* Copyright (c) 2018-2023 Jeremy Davis (jeremydavis519@gmail.com)
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

//! The kernel's one blocking primitive. Every other lock in the system that can put a thread to
//! sleep -- `kernel-as`'s page table locks, `kernel-ipc`'s answerbox condition, `kernel-task`'s
//! join/exit handshake -- is built on a `Waitq`, so that the scheduler only ever has to know how
//! to suspend and resume a thread once.
//!
//! This crate sits below `kernel-sched`/`kernel-task` in the dependency order, so it cannot call
//! into the scheduler directly. Instead it takes the same shape as `kernel-frame`'s `Reclaimer`:
//! the scheduler registers itself once, at boot, as the single implementation of [`Scheduler`],
//! and `waitq_sleep_timeout` calls back through that registration.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;
#[macro_use] extern crate bitflags;

mod rwsignal;
mod mutex;

use {
    alloc::vec::Vec,
    core::sync::atomic::{AtomicU64, Ordering},

    i18n::Text,
    locks::Mutex,
};

pub use mutex::{WaitqMutex, WaitqMutexGuard};
pub use rwsignal::{WaitqRwSignal, ReadGuard, WriteGuard};

bitflags! {
    /// Flags accepted by `waitq_sleep_timeout`.
    pub struct WaitqFlags: u32 {
        /// If a wakeup already arrived before this call (the waitq's missed-wakeup counter is
        /// nonzero), consume it and return immediately instead of actually blocking.
        const NON_BLOCKING  = 0b0000_0001;
        /// Return early with `WakeReason::Interrupted` if a pending signal is observed while
        /// blocked, rather than only on an explicit wakeup or timeout.
        const INTERRUPTIBLE = 0b0000_0010;
    }
}

/// Why `waitq_sleep_timeout` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// `waitq_wakeup` (or a missed wakeup consumed non-blockingly) woke this sleeper.
    Woken,
    /// The deadline passed before any wakeup arrived.
    TimedOut,
    /// `INTERRUPTIBLE` was set and a pending signal was observed.
    Interrupted
}

/// Which sleepers `waitq_wakeup` resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMode {
    /// Wake exactly one sleeper (the one that has been waiting longest), if any.
    First,
    /// Wake every current sleeper.
    All
}

/// A handle identifying one registered sleeper, opaque outside this crate. Passed to
/// [`Scheduler::block`] so the scheduler can later tell this crate which sleeper is asking to be
/// suspended, and returned to [`Scheduler::ready`] so the scheduler knows which one to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTicket(u64);

/// Implemented once, by `kernel-task`, and registered with [`register_scheduler`] at boot. Lets
/// `waitq_sleep_timeout` actually suspend the calling thread without this crate depending on
/// `kernel-sched`/`kernel-task`.
pub trait Scheduler: Sync {
    /// Suspends the calling thread, which has been recorded under `ticket`, until a call to
    /// `Waitq::wakeup` (or `waitq`'s internal cancellation on timeout/interrupt) resolves it.
    /// `deadline_usec`, if given, is the number of microseconds from now after which this call
    /// must return `WakeReason::TimedOut` on its own, without waiting for `ready`.
    fn block(&self, ticket: WaitTicket, deadline_usec: Option<u64>, interruptible: bool) -> WakeReason;

    /// Called by `Waitq::wakeup` under the waitq's own lock to mark the thread behind `ticket`
    /// ready to run again. Must be safe to call even if `ticket`'s `block` call already returned
    /// on its own (timeout/interrupt); `Waitq` only calls this for tickets it still holds, which
    /// `cancel` guarantees happens at most once per ticket.
    fn ready(&self, ticket: WaitTicket, reason: WakeReason);
}

static SCHEDULER: Mutex<Option<&'static dyn Scheduler>> = Mutex::new(None);

/// Registers the system's single scheduler implementation. Called once, at boot, by
/// `kernel-task`.
pub fn register_scheduler(scheduler: &'static dyn Scheduler) {
    loop {
        if let Ok(mut slot) = SCHEDULER.try_lock() {
            *slot = Some(scheduler);
            return;
        }
    }
}

fn scheduler() -> &'static dyn Scheduler {
    loop {
        if let Ok(slot) = SCHEDULER.try_lock() {
            return slot.expect("waitq_sleep_timeout called before kernel-task registered a Scheduler");
        }
    }
}

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

struct State {
    /// Tickets of currently sleeping waiters, in arrival order (so `First` wakes the oldest).
    waiters: Vec<WaitTicket>,
    /// Wakeups that arrived with nobody asleep to receive them. Only meaningful for "permanent"
    /// waitqs (see `Waitq::new`); consumed by a later `NON_BLOCKING` sleep.
    missed: usize
}

/// A queue of blocked threads plus a non-negative "missed wakeups" counter, so that a `wakeup`
/// landing just before the matching `sleep` is never lost.
pub struct Waitq {
    state: Mutex<State>,
    permanent: bool
}

impl Waitq {
    /// Creates an empty waitq. `permanent` waitqs accumulate missed wakeups for later
    /// `NON_BLOCKING` sleeps to consume (used for condition-style signaling that may be raised
    /// before anyone is listening); non-permanent waitqs silently drop a wakeup that finds nobody
    /// asleep.
    pub const fn new(permanent: bool) -> Waitq {
        Waitq {
            state: Mutex::new(State { waiters: Vec::new(), missed: 0 }),
            permanent
        }
    }

    /// The number of missed wakeups currently banked (only ever nonzero for a permanent waitq).
    pub fn missed(&self) -> usize {
        loop {
            if let Ok(state) = self.state.try_lock() {
                return state.missed;
            }
        }
    }

    fn try_consume_missed(&self) -> bool {
        loop {
            if let Ok(mut state) = self.state.try_lock() {
                if state.missed > 0 {
                    state.missed -= 1;
                    return true;
                }
                return false;
            }
        }
    }

    fn enqueue(&self) -> WaitTicket {
        let ticket = WaitTicket(NEXT_TICKET.fetch_add(1, Ordering::Relaxed));
        loop {
            if let Ok(mut state) = self.state.try_lock() {
                state.waiters.push(ticket);
                return ticket;
            }
        }
    }

    /// Removes `ticket` from the wait list if it's still there (i.e. it hasn't already been
    /// resolved by `wakeup`). Called by `waitq_sleep_timeout` after a timeout or interruption, so
    /// a ticket is never both timed out and later woken.
    fn cancel(&self, ticket: WaitTicket) -> bool {
        loop {
            if let Ok(mut state) = self.state.try_lock() {
                if let Some(pos) = state.waiters.iter().position(|&t| t == ticket) {
                    state.waiters.remove(pos);
                    return true;
                }
                return false;
            }
        }
    }

    /// Wakes one or all sleepers, per `mode`. If nobody is asleep and this is a permanent waitq,
    /// records a missed wakeup instead.
    ///
    /// # Returns
    /// The number of sleepers actually woken.
    pub fn wakeup(&self, mode: WakeMode) -> usize {
        let woken = loop {
            if let Ok(mut state) = self.state.try_lock() {
                if state.waiters.is_empty() {
                    if self.permanent {
                        state.missed += 1;
                    }
                    break Vec::new();
                }
                break match mode {
                    WakeMode::First => alloc::vec![state.waiters.remove(0)],
                    WakeMode::All => core::mem::take(&mut state.waiters)
                };
            }
        };

        let count = woken.len();
        for ticket in woken {
            scheduler().ready(ticket, WakeReason::Woken);
        }
        if count == 0 && self.permanent {
            let _ = Text::WaitqMissedWakeup(&self.missed());
        }
        count
    }
}

/// Blocks the calling thread on `wq` until woken, timed out, or (if `INTERRUPTIBLE` is set)
/// interrupted.
///
/// `usec` is the sleep's timeout in microseconds, or `0` for no timeout (sleep until explicitly
/// woken). If `NON_BLOCKING` is set and a wakeup is already banked on `wq`, it is consumed and
/// this returns `WakeReason::Woken` without ever suspending the thread.
pub fn waitq_sleep_timeout(wq: &Waitq, usec: u64, flags: WaitqFlags) -> WakeReason {
    if flags.contains(WaitqFlags::NON_BLOCKING) && wq.try_consume_missed() {
        return WakeReason::Woken;
    }

    let ticket = wq.enqueue();
    let deadline = if usec == 0 { None } else { Some(usec) };
    let reason = scheduler().block(ticket, deadline, flags.contains(WaitqFlags::INTERRUPTIBLE));

    // `block` returning `Woken` means `wakeup` already removed the ticket under `wq`'s lock; any
    // other reason means the thread gave up on its own and must remove itself.
    if reason != WakeReason::Woken {
        wq.cancel(ticket);
    }
    reason
}

/// Wakes one or all threads sleeping on `wq`. See `Waitq::wakeup`.
pub fn waitq_wakeup(wq: &Waitq, mode: WakeMode) -> usize {
    wq.wakeup(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    struct ImmediateScheduler {
        blocked: AtomicUsize,
        readied: Mutex<Vec<(WaitTicket, WakeReason)>>
    }

    impl Scheduler for ImmediateScheduler {
        fn block(&self, _ticket: WaitTicket, deadline_usec: Option<u64>, _interruptible: bool) -> WakeReason {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            // A synchronous test scheduler: pretend every sleep with a deadline immediately times
            // out, and every sleep with no deadline is resolved out-of-band by the test calling
            // `wakeup` first.
            if deadline_usec.is_some() {
                WakeReason::TimedOut
            } else {
                WakeReason::Woken
            }
        }

        fn ready(&self, ticket: WaitTicket, reason: WakeReason) {
            loop {
                if let Ok(mut log) = self.readied.try_lock() {
                    log.push((ticket, reason));
                    return;
                }
            }
        }
    }

    fn install_scheduler() -> &'static ImmediateScheduler {
        static SCHED: ImmediateScheduler = ImmediateScheduler {
            blocked: AtomicUsize::new(0),
            readied: Mutex::new(Vec::new())
        };
        loop {
            if let Ok(mut slot) = SCHEDULER.try_lock() {
                *slot = Some(&SCHED);
                break;
            }
        }
        &SCHED
    }

    #[test]
    fn non_blocking_sleep_consumes_a_missed_wakeup() {
        install_scheduler();
        let wq = Waitq::new(true);
        wq.wakeup(WakeMode::First);
        assert_eq!(wq.missed(), 1);

        let reason = waitq_sleep_timeout(&wq, 0, WaitqFlags::NON_BLOCKING);
        assert_eq!(reason, WakeReason::Woken);
        assert_eq!(wq.missed(), 0);
    }

    #[test]
    fn timeout_cancels_the_ticket_so_it_cannot_be_double_woken() {
        install_scheduler();
        let wq = Waitq::new(false);
        let reason = waitq_sleep_timeout(&wq, 1000, WaitqFlags::empty());
        assert_eq!(reason, WakeReason::TimedOut);
        // The ticket was removed by `cancel`, so a wakeup now finds nobody to notify.
        assert_eq!(wq.wakeup(WakeMode::First), 0);
    }

    #[test]
    fn non_permanent_waitq_drops_a_wakeup_with_nobody_asleep() {
        install_scheduler();
        let wq = Waitq::new(false);
        assert_eq!(wq.wakeup(WakeMode::All), 0);
        assert_eq!(wq.missed(), 0);
    }
}
