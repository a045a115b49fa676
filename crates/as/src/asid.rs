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

//! ASID (address-space identifier) allocation.
//!
//! A monotonic counter per generation hands out ASIDs so a TLB-tagged architecture never has to
//! flush the whole TLB on every context switch. Once the counter runs out, the generation advances
//! and every live, non-kernel address space must notice (via [`is_stale`]) and trade its ASID in
//! for a fresh one, at which point a system-wide TLB invalidate is unavoidable.

use arch::Arch;
use locks::Mutex;

/// Reserved for the kernel's own address space. Permanently resident in every generation; never
/// handed out to anything else and never reassigned.
pub const ASID_KERNEL: u16 = 0;

/// The first ASID a non-kernel address space may be given.
pub const ASID_START: u16 = ASID_KERNEL + 1;

/// One past the last ASID a generation can hand out before it must roll over. Kept small under
/// `cfg(test)` so the overflow-and-reassign path (scenario 6) is cheap to exercise without
/// allocating thousands of address spaces.
#[cfg(not(test))]
pub const ASID_OVERFLOW: u16 = 1 << 14;
#[cfg(test)]
pub const ASID_OVERFLOW: u16 = 8;

struct Allocator {
    next: u16,
    generation: u64
}

static ALLOCATOR: Mutex<Allocator> = Mutex::new(Allocator { next: ASID_START, generation: 0 });

/// An address space's ASID, tagged with the generation it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asid {
    /// The hardware-visible ASID value.
    pub value: u16,
    /// The generation counter's value at the time this ASID was issued.
    pub generation: u64
}

/// The generation counter's current value.
pub fn current_generation() -> u64 {
    loop {
        if let Ok(a) = ALLOCATOR.try_lock() {
            return a.generation;
        }
    }
}

/// Whether `asid` was issued in a generation that has since rolled over, meaning every TLB entry
/// tagged with it may have been silently reused for a different address space.
pub fn is_stale(asid: Asid) -> bool {
    current_generation() != asid.generation
}

/// Resets the global allocator to its boot state. Only meaningful for tests, which otherwise
/// share this module-level state across every test function in the crate.
#[cfg(test)]
pub(crate) fn reset() {
    loop {
        if let Ok(mut a) = ALLOCATOR.try_lock() {
            a.next = ASID_START;
            a.generation = 0;
            return;
        }
    }
}

/// Allocates a fresh ASID, rolling over to a new generation first if the current one is
/// exhausted. Rolling over is how `ASID_OVERFLOW - ASID_START + 1` consecutive allocations (scenario
/// 6) trigger a reassignment: since the hardware TLB only tags entries with the 16-bit ASID
/// *value* (not this generation counter), reusing a value across a rollover would collide with
/// stale entries from the generation it was last issued in, so the rollover itself issues a
/// system-wide `tlb_invalidate` here rather than leaving it to whichever caller happens to
/// notice its own ASID went stale.
pub fn asid_alloc<A: Arch>() -> Asid {
    let (asid, rolled_over) = loop {
        if let Ok(mut a) = ALLOCATOR.try_lock() {
            let mut rolled_over = false;
            if a.next >= ASID_OVERFLOW {
                a.generation += 1;
                a.next = ASID_START;
                rolled_over = true;
            }
            let value = a.next;
            a.next += 1;
            break (Asid { value, generation: a.generation }, rolled_over);
        }
    };
    if rolled_over {
        A::tlb_invalidate(None, 0);
    }
    asid
}

#[cfg(test)]
mod tests {
    use super::*;
    use arch::test::{TestArch, TLB_LOG};

    #[test]
    fn overflow_advances_generation_and_wraps_the_counter() {
        reset();
        TLB_LOG.lock().clear();
        let mut first = None;
        let mut saw_new_generation = false;
        for _ in 0 .. (ASID_OVERFLOW as usize) + 1 {
            let asid = asid_alloc::<TestArch>();
            if first.is_none() {
                first = Some(asid);
            } else if asid.generation != first.unwrap().generation {
                saw_new_generation = true;
            }
        }
        assert!(saw_new_generation, "allocating past ASID_OVERFLOW must roll the generation over");
        assert!(is_stale(first.unwrap()));
        assert!(
            TLB_LOG.lock().iter().any(|&(asid, _)| asid.is_none()),
            "a generation rollover must issue a system-wide tlb_invalidate(None, _)"
        );
    }
}
