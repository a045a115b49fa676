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

//! The kernel's physical frame allocator: a buddy allocator over each memory zone reported by the
//! boot-time memory map, with per-frame refcounting so backends (see `kernel-as`) can share
//! physical pages between address spaces.
//!
//! Everything above this crate (`kernel-slab` and up) should treat `frame_alloc`/`frame_free` as
//! the only way physical memory enters or leaves circulation.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;
#[macro_use] extern crate bitflags;

mod zone;

use {
    alloc::vec::Vec,
    core::sync::atomic::{AtomicU32, AtomicUsize, Ordering},

    i18n::Text,
    locks::Mutex,
    error::{KernelError, KernelResult},
};

pub use zone::{Zone, MAX_ORDER};

/// A physical frame number: a physical address divided by the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pfn(pub usize);

/// The architecture's page size, in bytes. Every frame is exactly this size.
pub const PAGE_SIZE: usize = 4096;

bitflags! {
    /// A zone's classification. Only zones with `AVAILABLE` set, matching a request's
    /// `LOWMEM`/`HIGHMEM`/`FIRMWARE` bits exactly, ever serve `frame_alloc`.
    pub struct ZoneFlags: u32 {
        /// Physical memory reachable without any special addressing tricks.
        const LOWMEM    = 0b0000_0001;
        /// Physical memory that needs a special mapping window to reach (e.g. above 4 GiB on a
        /// 32-bit architecture).
        const HIGHMEM   = 0b0000_0010;
        /// Memory owned by firmware (ACPI tables, UEFI runtime services, ...): present but never
        /// allocated from.
        const FIRMWARE  = 0b0000_0100;
        /// Memory explicitly reserved by the boot loader or the kernel image itself.
        const RESERVED  = 0b0000_1000;
        /// This zone may serve `frame_alloc` requests (combined with exactly one of the above).
        const AVAILABLE = 0b0001_0000;
    }
}

bitflags! {
    /// Flags accepted by `frame_alloc`.
    pub struct AllocFlags: u32 {
        /// The caller may not sleep or trigger reclaim; fail immediately instead.
        const ATOMIC     = 0b0000_0001;
        /// Do not run slab reclaim even on failure; fail immediately instead.
        const NO_RECLAIM = 0b0000_0010;
        /// Do not count this allocation against the global reservation.
        const NO_RESERVE = 0b0000_0100;
        /// Only an exactly `LOWMEM` zone may serve this request.
        const LOWMEM     = 0b0000_1000;
        /// Only an exactly `HIGHMEM` zone may serve this request.
        const HIGHMEM    = 0b0001_0000;
    }
}

/// A callback a higher layer (namely `kernel-slab`) registers so the frame allocator can ask it
/// to give back memory before failing a non-atomic request. This is the same
/// trait-object-plug-in shape `kernel-arch` uses for per-architecture collaborators, turned
/// around: here, a *lower* crate calls up into a higher one without a compile-time dependency.
pub trait Reclaimer: Sync {
    /// Asked to free as many frames as it reasonably can. Returns the number of frames freed.
    fn reclaim(&self, aggressive: bool) -> usize;
}

static RECLAIMERS: Mutex<Vec<&'static dyn Reclaimer>> = Mutex::new(Vec::new());

/// Registers a reclaimer to be consulted whenever a non-atomic `frame_alloc` would otherwise fail.
pub fn register_reclaimer(reclaimer: &'static dyn Reclaimer) {
    loop {
        if let Ok(mut reclaimers) = RECLAIMERS.try_lock() {
            reclaimers.push(reclaimer);
            return;
        }
    }
}

fn run_reclaim(aggressive: bool) -> usize {
    let mut total = 0;
    loop {
        if let Ok(reclaimers) = RECLAIMERS.try_lock() {
            for reclaimer in reclaimers.iter() {
                total += reclaimer.reclaim(aggressive);
            }
            return total;
        }
    }
}

static ZONES: Mutex<Vec<Zone>> = Mutex::new(Vec::new());

/// The number of bytes promised to allocations that must not be allowed to starve (transient
/// kernel data structures, mostly). `frame_alloc` accounts every non-`NO_RESERVE` allocation
/// against this so that reservation-holding callers can't be starved by reservation-less ones.
static RESERVED_BYTES: AtomicUsize = AtomicUsize::new(0);
static PROMISED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Registers a new zone of physical memory at boot. Not available once the allocator is serving
/// allocations from other CPUs, by convention (there is no internal locking protecting against
/// concurrent `register_zone` and `frame_alloc` -- boot is single-threaded).
pub fn register_zone(zone: Zone) {
    loop {
        if let Ok(mut zones) = ZONES.try_lock() {
            // Try to merge with an existing adjacent zone of the same class first.
            let mut zone = zone;
            let mut merged = false;
            for existing in zones.iter_mut() {
                match core::mem::replace(existing, Zone::new(Pfn(0), 0, ZoneFlags::empty()))
                        .try_merge_with(zone) {
                    Ok(combined) => { *existing = combined; merged = true; break; },
                    Err((old, z)) => { *existing = old; zone = z; }
                }
            }
            if !merged {
                zones.push(zone);
            }
            return;
        }
    }
}

/// Reserves `bytes` worth of future allocations, so that non-`NO_RESERVE` allocators can't
/// starve whoever made the reservation. Call `unreserve` with the same amount once the
/// corresponding allocation has either completed or been abandoned.
pub fn reserve(bytes: usize) {
    PROMISED_BYTES.fetch_add(bytes, Ordering::AcqRel);
}

/// The inverse of `reserve`.
pub fn unreserve(bytes: usize) {
    PROMISED_BYTES.fetch_sub(bytes, Ordering::AcqRel);
}

fn order_of(count: usize) -> usize {
    assert!(count.is_power_of_two(), "frame_alloc count must be a power of 2, got {count}");
    count.trailing_zeros() as usize
}

/// Allocates `count` (a power of two) contiguous physical frames matching `flags`.
///
/// If no zone can satisfy the request immediately: a non-atomic, reclaim-permitted request
/// triggers `kernel-slab` reclaim and retries once; an `ATOMIC` or `NO_RECLAIM` request fails
/// immediately.
pub fn frame_alloc(count: usize, flags: AllocFlags) -> KernelResult<Pfn> {
    let order = order_of(count);

    if !flags.contains(AllocFlags::NO_RESERVE) {
        RESERVED_BYTES.fetch_add(count * PAGE_SIZE, Ordering::AcqRel);
    }

    let result = try_alloc_once(order, flags);
    if result.is_ok() {
        return result;
    }

    if flags.contains(AllocFlags::ATOMIC) || flags.contains(AllocFlags::NO_RECLAIM) {
        if !flags.contains(AllocFlags::NO_RESERVE) {
            RESERVED_BYTES.fetch_sub(count * PAGE_SIZE, Ordering::AcqRel);
        }
        return Err(KernelError::NoMem);
    }

    // Reclaim-then-retry, exactly once, for a non-atomic caller.
    run_reclaim(false);
    let result = try_alloc_once(order, flags);
    if result.is_err() && !flags.contains(AllocFlags::NO_RESERVE) {
        RESERVED_BYTES.fetch_sub(count * PAGE_SIZE, Ordering::AcqRel);
    }
    result
}

fn try_alloc_once(order: usize, flags: AllocFlags) -> KernelResult<Pfn> {
    loop {
        if let Ok(mut zones) = ZONES.try_lock() {
            for zone in zones.iter_mut() {
                if zone.matches(flags) {
                    if let Some(offset) = zone.alloc(order) {
                        return Ok(Pfn(zone.base().0 + offset));
                    }
                }
            }
            return Err(KernelError::NoMem);
        }
    }
}

/// Finds the zone containing `pfn` and the frame's offset within it.
fn with_zone_mut<R>(pfn: Pfn, f: impl FnOnce(&mut Zone, usize) -> R) -> R {
    loop {
        if let Ok(mut zones) = ZONES.try_lock() {
            for zone in zones.iter_mut() {
                if pfn.0 >= zone.base().0 && pfn.0 < zone.base().0 + zone.frame_count() {
                    let offset = pfn.0 - zone.base().0;
                    return f(zone, offset);
                }
            }
            panic!("frame {:?} does not belong to any registered zone", pfn);
        }
    }
}

/// Increments a frame's refcount (used when a backend shares a physical frame between address
/// spaces instead of copying it).
///
/// # Panics
/// If the refcount would overflow `u32::MAX`.
pub fn frame_reference_add(pfn: Pfn) {
    with_zone_mut(pfn, |zone, offset| {
        let prev = zone.refcount(offset).fetch_add(1, Ordering::AcqRel);
        assert_ne!(prev, u32::MAX, "{}", Text::FrameRefcountOverflow(&pfn.0));
    });
}

/// Returns this frame's opaque parent pointer slot (used by `kernel-slab` to tag frames with the
/// cache that owns them).
pub fn frame_parent(pfn: Pfn) -> usize {
    with_zone_mut(pfn, |zone, offset| zone.parent(offset).load(Ordering::Acquire))
}

/// Sets this frame's opaque parent pointer slot.
pub fn frame_set_parent(pfn: Pfn, parent: usize) {
    with_zone_mut(pfn, |zone, offset| zone.parent(offset).store(parent, Ordering::Release));
}

/// Decrements `count` contiguous frames' refcounts starting at `pfn` and returns any whose
/// refcount reaches 0 to the buddy allocator, coalescing with free buddies as it goes.
pub fn frame_free(pfn: Pfn, count: usize, _flags: AllocFlags) {
    let order = order_of(count);
    with_zone_mut(pfn, |zone, offset| {
        let mut any_live = false;
        for i in 0 .. count {
            let rc = zone.refcount(offset + i);
            let prev = rc.fetch_sub(1, Ordering::AcqRel);
            assert_ne!(prev, 0, "{}", Text::FrameDoubleFree(&(pfn.0 + i)));
            if prev > 1 {
                any_live = true;
            }
        }
        if !any_live {
            zone.free(offset, order);
        }
    });
}

/// Runs `kernel-slab`'s reclaim through every registered reclaimer without going through a failed
/// `frame_alloc` first. Exposed so callers (and tests) can force reclaim under synthetic memory
/// pressure, mirroring scenario 5 of the testable-properties list: allocate to exhaustion, call
/// this, then retry.
pub fn reclaim_all(aggressive: bool) -> usize {
    run_reclaim(aggressive)
}

/// Returns `(free_frames, total_frames)` summed over every registered zone, for diagnostics.
pub fn frame_stats() -> (usize, usize) {
    loop {
        if let Ok(zones) = ZONES.try_lock() {
            let mut free = 0;
            let mut total = 0;
            for zone in zones.iter() {
                free += zone.free_frames();
                total += zone.frame_count();
            }
            return (free, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        loop {
            if let Ok(mut zones) = ZONES.try_lock() {
                zones.clear();
                break;
            }
        }
        RESERVED_BYTES.store(0, Ordering::Release);
        PROMISED_BYTES.store(0, Ordering::Release);
    }

    #[test]
    fn alloc_and_free_round_trips() {
        reset();
        register_zone(Zone::new(Pfn(0), 256, ZoneFlags::AVAILABLE | ZoneFlags::LOWMEM));
        let (free_before, _) = frame_stats();

        let pfn = frame_alloc(4, AllocFlags::empty()).expect("allocation should succeed");
        let (free_after, _) = frame_stats();
        assert_eq!(free_after, free_before - 4);

        frame_free(pfn, 4, AllocFlags::empty());
        let (free_restored, _) = frame_stats();
        assert_eq!(free_restored, free_before);
    }

    #[test]
    fn zone_class_matching_is_exact_on_class_bits() {
        reset();
        register_zone(Zone::new(Pfn(0), 16, ZoneFlags::AVAILABLE | ZoneFlags::HIGHMEM));
        let result = frame_alloc(1, AllocFlags::LOWMEM);
        assert_eq!(result, Err(KernelError::NoMem));

        let result = frame_alloc(1, AllocFlags::HIGHMEM);
        assert!(result.is_ok());
    }

    #[test]
    fn atomic_alloc_never_reclaims() {
        reset();
        struct CountingReclaimer;
        impl Reclaimer for CountingReclaimer {
            fn reclaim(&self, _aggressive: bool) -> usize { panic!("atomic alloc must not reclaim"); }
        }
        // Zero zones, so the first attempt always fails; an atomic request must not consult the
        // reclaimer we'd otherwise panic inside.
        let result = frame_alloc(1, AllocFlags::ATOMIC);
        assert_eq!(result, Err(KernelError::NoMem));
    }

    #[test]
    fn sharing_increments_and_balances_refcount() {
        reset();
        register_zone(Zone::new(Pfn(0), 4, ZoneFlags::AVAILABLE | ZoneFlags::LOWMEM));
        let pfn = frame_alloc(1, AllocFlags::empty()).unwrap();
        frame_reference_add(pfn);
        let (free_mid, _) = frame_stats();
        frame_free(pfn, 1, AllocFlags::empty());
        let (free_after_one, _) = frame_stats();
        assert_eq!(free_mid, free_after_one, "frame must still be live after only one of two frees");
        frame_free(pfn, 1, AllocFlags::empty());
        let (free_after_two, _) = frame_stats();
        assert_eq!(free_after_two, free_after_one + 1);
    }
}
