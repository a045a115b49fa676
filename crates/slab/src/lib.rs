/* Copyright (c) 2022-2023 Jeremy Davis (jeremydavis519@gmail.com)
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

//! Object caches built on top of `kernel-frame`'s physical frames.
//!
//! Each `Cache` hands out fixed-size objects a slab (`2^order` frames) at a time, fronted by a
//! pair of per-CPU LIFO magazines so that the overwhelmingly common alloc/free pair never touches
//! a lock shared between CPUs. A cache registers itself with `kernel-frame` as a `Reclaimer` so
//! the frame allocator can ask it to give back memory under pressure without depending on this
//! crate at compile time.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;

mod cache;

use {
    alloc::vec::Vec,

    frame::{AllocFlags, Reclaimer},
    locks::Mutex,
};

pub use cache::Cache;

/// Maximum number of objects a single magazine will hold before it's pushed to the shared list
/// and replaced with an empty one.
pub const MAGAZINE_CAPACITY: usize = 16;

/// `RECLAIM_NORMAL` only drains the shared magazine list and frees now-empty slabs.
/// `RECLAIM_ALL` additionally drains every CPU's own magazines first, for memory emergencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// Drain the shared magazine list and free empty slabs.
    Normal,
    /// Also drain every CPU's per-CPU magazines before freeing empty slabs.
    All
}

static REGISTRY: Mutex<Vec<&'static Cache>> = Mutex::new(Vec::new());

struct Registry;

impl Reclaimer for Registry {
    fn reclaim(&self, aggressive: bool) -> usize {
        slab_reclaim(if aggressive { ReclaimMode::All } else { ReclaimMode::Normal })
    }
}

static REGISTRY_RECLAIMER: Registry = Registry;

/// Creates a new cache and registers it with both the crate-wide cache list (for `slab_reclaim`)
/// and `kernel-frame`'s reclaimer list (so `frame_alloc` can drain it under pressure).
///
/// `cache` must be a `'static` reference, since both registries hold onto it for the life of the
/// kernel; caches are never destroyed once created, matching the frame allocator's zones.
pub fn register_cache(cache: &'static Cache) {
    loop {
        if let Ok(mut registry) = REGISTRY.try_lock() {
            registry.push(cache);
            break;
        }
    }
    // Only need to register the reclaimer hook itself once, but registering it again each time a
    // cache is added is harmless; `kernel-frame` just calls it once more per `Reclaimer` pushed.
    if registry_len() == 1 {
        frame::register_reclaimer(&REGISTRY_RECLAIMER);
    }
}

fn registry_len() -> usize {
    loop {
        if let Ok(registry) = REGISTRY.try_lock() {
            return registry.len();
        }
    }
}

/// Convenience wrapper around a `Cache` that also allocates its own frame-backed storage via the
/// current CPU's index (`kernel-arch`'s `Arch::cpu_index`).
pub fn alloc(cache: &Cache, cpu: usize, flags: AllocFlags) -> error::KernelResult<*mut u8> {
    cache.alloc(cpu, flags)
}

/// Frees an object previously returned by `alloc`.
pub fn free(cache: &Cache, cpu: usize, ptr: *mut u8) {
    cache.free(cpu, ptr)
}

/// Walks every registered cache, draining its shared magazine list and freeing any now-empty
/// slabs back to `kernel-frame`. `ReclaimMode::All` additionally drains every CPU's own
/// magazines first.
///
/// # Returns
/// The total number of frames freed across every cache.
pub fn slab_reclaim(mode: ReclaimMode) -> usize {
    let mut total = 0;
    loop {
        if let Ok(registry) = REGISTRY.try_lock() {
            for cache in registry.iter() {
                total += cache.reclaim(mode == ReclaimMode::All);
            }
            return total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame::{Pfn, Zone, ZoneFlags};

    fn reset_frame_allocator(frames: usize) {
        // `kernel-frame`'s tests module resets its own statics; here we only need a fresh zone,
        // so just register one on top of whatever's already there (tests run single-threaded).
        frame::register_zone(Zone::new(Pfn(1024), frames, ZoneFlags::AVAILABLE | ZoneFlags::LOWMEM));
    }

    #[test]
    fn alloc_free_round_trips_through_one_cpu() {
        reset_frame_allocator(16);
        let cache = Cache::new("test-objs", 64, 0, None, None, 1);
        let (allocated_before, _, _) = cache.stats();

        let ptr = cache.alloc(0, AllocFlags::empty()).expect("alloc should succeed");
        let (allocated_mid, _, _) = cache.stats();
        assert_eq!(allocated_mid, allocated_before + 1);

        cache.free(0, ptr);
        let (allocated_after, _, cached_after) = cache.stats();
        assert_eq!(allocated_after, allocated_before);
        assert_eq!(cached_after, 1);
    }

    #[test]
    fn reclaim_frees_empty_slabs() {
        reset_frame_allocator(16);
        let cache = Cache::new("reclaim-objs", 2048, 0, None, None, 1);

        let ptr = cache.alloc(0, AllocFlags::empty()).unwrap();
        let (_, allocated_slabs, _) = cache.stats();
        assert!(allocated_slabs >= 1);

        cache.free(0, ptr);
        let freed = cache.reclaim(true);
        assert!(freed >= 1, "reclaiming an all-empty cache should free at least one slab's frames");
    }

    #[test]
    fn constructor_runs_once_per_slot_not_per_alloc() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(_p: *mut u8) { CTOR_CALLS.fetch_add(1, Ordering::AcqRel); }

        reset_frame_allocator(16);
        let cache = Cache::new("ctor-objs", 64, 0, Some(ctor), None, 1);
        let before = CTOR_CALLS.load(Ordering::Acquire);

        let a = cache.alloc(0, AllocFlags::empty()).unwrap();
        let b = cache.alloc(0, AllocFlags::empty()).unwrap();
        let after_two_allocs = CTOR_CALLS.load(Ordering::Acquire);
        assert!(after_two_allocs > before, "constructor should run when a slab is carved");

        cache.free(0, a);
        cache.free(0, b);
        let c = cache.alloc(0, AllocFlags::empty()).unwrap();
        let after_reuse = CTOR_CALLS.load(Ordering::Acquire);
        assert_eq!(after_reuse, after_two_allocs, "constructor must not re-run on a reused object");
        cache.free(0, c);
    }
}
