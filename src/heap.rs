/* Copyright (c) 2017-2021 Jeremy Davis (jeremydavis519@gmail.com)
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

//! The kernel's `#[global_allocator]`: everything above this module (including `alloc::Vec`
//! growth inside `kernel-frame` and `kernel-slab` themselves) reaches physical memory through here.
//!
//! Two allocators are layered, switched on by [`HEAP_READY`]:
//!
//!  - Before [`init`] runs, every request is served out of a fixed-size bump arena baked into the
//!    kernel image. This exists to break a bootstrap cycle: registering the first `kernel-frame`
//!    zone and building the size-classed caches below both grow an `alloc::Vec` (`ZONES`, a
//!    cache's per-CPU magazine table, `kernel-slab`'s cache registry), and if that growth were
//!    itself served by the frame/slab-backed path, it would try to re-enter the very lock it's
//!    already holding. Bump memory is never reclaimed; it is sized to comfortably outlive boot.
//!  - After `init`, small requests (up to the largest size class) are handed to one of a fixed
//!    set of `kernel-slab` caches; anything larger goes straight to `kernel-frame::frame_alloc`,
//!    identity-mapped the same way `kernel-task`'s kernel stacks are.
//!
//! `dealloc` never carries its own metadata about which path an allocation took. Instead it
//! re-derives the answer from the pointer and the `Layout` Rust hands back, which are guaranteed
//! to match what `alloc` saw: an address inside the bump arena took the bump path; otherwise the
//! same size-class lookup `alloc` used picks out the owning cache, or falls through to the frame
//! path.

use core::{
    alloc::{GlobalAlloc, Layout},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering}
};

use frame::{AllocFlags, PAGE_SIZE, Pfn};
use i18n::Text;
use shared::once::Once;
use slab::Cache;

use crate::TargetArch;

/// Object sizes the slab-backed path will hand out. Chosen as the powers of two from 16 bytes up
/// to a quarter of a page; anything bigger goes to `kernel-frame` directly rather than wasting a
/// whole slab on a handful of large objects.
const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Bytes set aside for allocations made before [`init`] flips the heap over to the real
/// frame/slab-backed path. Boot only ever needs a handful of small `Vec` growths (one zone
/// registration, one cache registry push per size class, one per-CPU magazine table per cache);
/// this is generously oversized for that.
const BUMP_ARENA_BYTES: usize = 64 * 1024;

#[repr(align(4096))]
struct BumpArena([u8; BUMP_ARENA_BYTES]);

static mut BUMP_ARENA: BumpArena = BumpArena([0; BUMP_ARENA_BYTES]);
static BUMP_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Flipped exactly once, by [`init`], after every size-classed cache has been built and
/// registered using the bump path. `false` throughout boot; `true` for the rest of the kernel's
/// life.
static HEAP_READY: AtomicBool = AtomicBool::new(false);

static CACHES: Once<[Cache; SIZE_CLASSES.len()]> = Once::new();

fn bump_alloc(layout: Layout) -> *mut u8 {
    let base = unsafe { BUMP_ARENA.0.as_mut_ptr() } as usize;
    loop {
        let current = BUMP_OFFSET.load(Ordering::Acquire);
        let align = layout.align().max(1);
        let aligned_base = (base + current + align - 1) & !(align - 1);
        let start = aligned_base - base;
        let end = match start.checked_add(layout.size()) {
            Some(end) => end,
            None => return core::ptr::null_mut()
        };
        if end > BUMP_ARENA_BYTES {
            return core::ptr::null_mut();
        }
        if BUMP_OFFSET.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            return aligned_base as *mut u8;
        }
    }
}

fn in_bump_arena(ptr: *mut u8) -> bool {
    let base = unsafe { BUMP_ARENA.0.as_ptr() } as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + BUMP_ARENA_BYTES
}

/// The smallest size class that can hold a request of this `Layout`, if any does.
fn size_class_for(layout: Layout) -> Option<usize> {
    let need = layout.size().max(layout.align()).max(1);
    SIZE_CLASSES.iter().position(|&class| class >= need)
}

/// Frames (a power of two, as `frame_alloc` requires) large enough to hold `bytes`, page-aligned
/// -- which also satisfies any `align` up to `PAGE_SIZE`, the only case this path is used for
/// given `size_class_for` catches everything smaller.
fn frames_for(bytes: usize) -> usize {
    let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    pages.next_power_of_two().max(1)
}

fn caches() -> &'static [Cache; SIZE_CLASSES.len()] {
    CACHES.try_get().expect("heap::init must run before the slab-backed path is reachable")
}

struct KernelAlloc;

unsafe impl GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !HEAP_READY.load(Ordering::Acquire) {
            return bump_alloc(layout);
        }

        match size_class_for(layout) {
            Some(idx) => match slab::alloc(&caches()[idx], TargetArch::cpu_index(), AllocFlags::empty()) {
                Ok(ptr) => ptr,
                Err(_) => core::ptr::null_mut()
            },
            None => {
                let frames = frames_for(layout.size().max(layout.align()));
                match frame::frame_alloc(frames, AllocFlags::empty()) {
                    Ok(pfn) => (pfn.0 * PAGE_SIZE) as *mut u8,
                    Err(_) => core::ptr::null_mut()
                }
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if in_bump_arena(ptr) {
            // Bump memory is never reclaimed individually; it all lives until the kernel doesn't.
            return;
        }

        match size_class_for(layout) {
            Some(idx) => slab::free(&caches()[idx], TargetArch::cpu_index(), ptr),
            None => {
                let frames = frames_for(layout.size().max(layout.align()));
                let pfn = Pfn(ptr as usize / PAGE_SIZE);
                frame::frame_free(pfn, frames, AllocFlags::empty());
            }
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelAlloc = KernelAlloc;

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    let size = layout.size();
    let align = layout.align();
    let _ = Text::HeapOutOfMemory(&size, &align);
    panic!("allocation failed: size = {:#x}, align = {:#x}", size, align);
}

/// Builds every size-classed cache and registers it with `kernel-slab` (which in turn registers
/// the slab reclaimer with `kernel-frame`), then switches the global allocator over to the real
/// frame/slab-backed path.
///
/// Must run once, after the boot-time memory map has been handed to `kernel-frame::register_zone`
/// and before anything spawns a second CPU or thread. Every allocation this function itself makes
/// (one per cache, for its per-CPU magazine table) is still served by the bump arena, since
/// `HEAP_READY` doesn't flip until the function returns.
pub fn init(cpu_count: usize) {
    unsafe {
        CACHES.call_once(|| {
            [
                Cache::new("heap-16", SIZE_CLASSES[0], 0, None, None, cpu_count),
                Cache::new("heap-32", SIZE_CLASSES[1], 0, None, None, cpu_count),
                Cache::new("heap-64", SIZE_CLASSES[2], 0, None, None, cpu_count),
                Cache::new("heap-128", SIZE_CLASSES[3], 0, None, None, cpu_count),
                Cache::new("heap-256", SIZE_CLASSES[4], 0, None, None, cpu_count),
                Cache::new("heap-512", SIZE_CLASSES[5], 0, None, None, cpu_count),
                Cache::new("heap-1024", SIZE_CLASSES[6], 0, None, None, cpu_count),
                Cache::new("heap-2048", SIZE_CLASSES[7], 0, None, None, cpu_count)
            ]
        });
    }

    for cache in caches().iter() {
        slab::register_cache(cache);
    }

    HEAP_READY.store(true, Ordering::Release);
}
