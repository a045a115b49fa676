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

//! Cross-CPU TLB shootdown.
//!
//! `Arch::pt_map`/`Arch::pt_unmap` only ever touch the local page table; they say nothing about
//! what other CPUs' TLBs still have cached. Any CPU that has ever run the same address space may
//! be holding a stale translation, so before a CPU can trust that its own unmap (or permission
//! downgrade) is globally visible, every such CPU must invalidate the same entry.

use core::sync::atomic::{AtomicBool, Ordering};
use alloc::vec::Vec;

use arch::Arch;
use frame::PAGE_SIZE;
use locks::{Mutex, MutexGuard};

/// How many pending `(asid, vaddr)` requests a CPU's queue holds before a further push degrades
/// that CPU to an unconditional "invalidate everything" on its next drain.
const QUEUE_CAPACITY: usize = 32;

/// The IPI vector this kernel reserves for TLB shootdown.
pub const SHOOTDOWN_VECTOR: u8 = 1;

struct PerCpu {
    queue: Mutex<Vec<(Option<u16>, usize)>>,
    overflowed: AtomicBool,
    /// Clear while this CPU is in the middle of handling a shootdown it's been notified of. The
    /// invariant this module maintains: a CPU never does mapping work of its own while its own
    /// flag is false.
    tlb_active: AtomicBool
}

impl PerCpu {
    fn new() -> PerCpu {
        PerCpu {
            queue: Mutex::new(Vec::new()),
            overflowed: AtomicBool::new(false),
            tlb_active: AtomicBool::new(true)
        }
    }

    fn push(&self, asid: Option<u16>, vaddr: usize, count: usize) {
        loop {
            if let Ok(mut q) = self.queue.try_lock() {
                if self.overflowed.load(Ordering::Acquire) {
                    return;
                }
                if q.len() + count > QUEUE_CAPACITY {
                    self.overflowed.store(true, Ordering::Release);
                    q.clear();
                    return;
                }
                for i in 0 .. count {
                    q.push((asid, vaddr.wrapping_add(i * PAGE_SIZE)));
                }
                return;
            }
        }
    }

    fn drain_and_invalidate<A: Arch>(&self) {
        if self.overflowed.swap(false, Ordering::AcqRel) {
            A::tlb_invalidate(None, 0);
            loop {
                if let Ok(mut q) = self.queue.try_lock() {
                    q.clear();
                    return;
                }
            }
        }
        loop {
            if let Ok(mut q) = self.queue.try_lock() {
                for (asid, vaddr) in q.drain(..) {
                    A::tlb_invalidate(asid, vaddr);
                }
                return;
            }
        }
    }
}

static SHOOTDOWN_LOCK: Mutex<()> = Mutex::new(());
static CPUS: Mutex<Vec<PerCpu>> = Mutex::new(Vec::new());

fn with_cpu<R>(index: usize, f: impl FnOnce(&PerCpu) -> R) -> R {
    loop {
        if let Ok(mut cpus) = CPUS.try_lock() {
            while cpus.len() <= index {
                cpus.push(PerCpu::new());
            }
            return f(&cpus[index]);
        }
    }
}

/// A shootdown in progress, returned by [`tlb_shootdown_start`] and consumed by
/// [`tlb_shootdown_finalize`]. Holds the shootdown lock and the caller's interrupt priority level
/// for the duration of the shootdown.
pub struct ShootdownTicket<A: Arch> {
    ipl: A::Ipl,
    _guard: MutexGuard<'static, ()>
}

/// Begins a shootdown of `count` pages starting at `vaddr`, tagged with `asid` (or every ASID, if
/// `None`), on every CPU index in `cpus`. Disables interrupts locally, enqueues the request on
/// every named CPU's queue (falling back to "invalidate everything" if a queue is full), and sends
/// each of them the shootdown IPI. Busy-waits for each to report it has taken up the request before
/// returning the ticket, so that by the time the caller does its own invalidation and calls
/// [`tlb_shootdown_finalize`], no other CPU can still be running with the old translation cached.
pub fn tlb_shootdown_start<A: Arch>(cpus: &[usize], asid: Option<u16>, vaddr: usize, count: usize) -> ShootdownTicket<A> {
    let ipl = A::ipl_disable();
    let guard = loop {
        if let Ok(g) = SHOOTDOWN_LOCK.try_lock() {
            break g;
        }
    };

    for &cpu in cpus {
        with_cpu(cpu, |pc| pc.push(asid, vaddr, count));
    }
    for &cpu in cpus {
        A::send_ipi(cpu, SHOOTDOWN_VECTOR);
    }
    for &cpu in cpus {
        with_cpu(cpu, |pc| {
            while !pc.tlb_active.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        });
    }

    ShootdownTicket { ipl, _guard: guard }
}

/// Ends a shootdown begun with `tlb_shootdown_start`, releasing the shootdown lock and restoring
/// the caller's interrupt priority level. Call only after performing the initiator's own local
/// invalidation.
pub fn tlb_shootdown_finalize<A: Arch>(ticket: ShootdownTicket<A>) {
    let ShootdownTicket { ipl, _guard } = ticket;
    A::ipl_restore(ipl);
    // `_guard` drops here, releasing `SHOOTDOWN_LOCK`.
}

/// The receiving side of a shootdown IPI: clears `tlb_active` for `cpu_index` (the ack the
/// initiator's busy-wait is looking for), drains that CPU's pending invalidations (or does one
/// global invalidate, if the queue overflowed), then restores `tlb_active`.
///
/// In a real multi-CPU boot this runs on the target CPU, asynchronously with the initiator's
/// busy-wait; a production `Arch::send_ipi` would arrange for this to be called from the
/// shootdown vector's interrupt handler. The software-only `kernel-arch` test harness has no real
/// concurrency, so its tests drive this function directly (or through a `send_ipi` that calls it
/// inline) to simulate the remote CPU's side of the handshake.
pub fn handle_shootdown_ipi<A: Arch>(cpu_index: usize) {
    with_cpu(cpu_index, |pc| {
        pc.tlb_active.store(false, Ordering::Release);
        pc.drain_and_invalidate::<A>();
        pc.tlb_active.store(true, Ordering::Release);
    });
}

#[cfg(test)]
pub(crate) fn reset_for_test() {
    loop {
        if let Ok(mut cpus) = CPUS.try_lock() {
            cpus.clear();
            return;
        }
    }
}
