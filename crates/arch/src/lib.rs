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

//! The one seam between the architecture-independent kernel and the architecture-specific
//! machine it runs on. Every collaborator the generic code needs from the machine -- raising and
//! lowering the interrupt priority level, saving and restoring a thread's register context,
//! writing a page table entry and invalidating the TLB for it, arming the next timer tick, and
//! sending an IPI to another CPU -- is a method on the `Arch` trait here, never an inline `asm!`
//! block in generic code.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;

#[macro_use] extern crate bitflags;
#[macro_use] extern crate shared;

use core::fmt::Debug;
use error::KernelResult;

#[cfg(any(target_arch = "arm", target_arch = "armv5te", target_arch = "armv7", target_arch = "aarch64"))]
pub mod aarch64;
#[cfg(any(target_arch = "i386", target_arch = "i586", target_arch = "i686", target_arch = "x86_64"))]
pub mod x86_64;
#[cfg(any(test, feature = "std-test"))]
pub mod test;

bitflags! {
    /// Permission and caching flags for a single page table entry, independent of how any one
    /// architecture's page table format happens to encode them.
    pub struct PageFlags: u32 {
        /// The page may be read.
        const READ    = 0b0000_0001;
        /// The page may be written.
        const WRITE   = 0b0000_0010;
        /// The page may be executed.
        const EXEC    = 0b0000_0100;
        /// The page is accessible from user mode. Without this flag, only the kernel can touch it.
        const USER    = 0b0000_1000;
        /// The page is not to be cached (used for MMIO).
        const NOCACHE = 0b0001_0000;
    }
}

/// A token that remembers the interrupt priority level in effect before it was raised, so that
/// `ipl_restore` can put things back exactly as they were. Every architecture has its own
/// representation (a flags register, a GIC priority mask, ...); generic code only ever holds this
/// opaquely and passes it back to `ipl_restore`.
pub trait Ipl: Copy + Debug {}

/// The per-architecture register context saved across a context switch. Opaque to generic code:
/// the scheduler keeps a `Context` per thread and hands it to `context_switch`/`context_init`
/// without inspecting its fields.
pub trait Context: Sized {}

/// The collaborators the generic kernel needs from the machine it's running on. One
/// implementation exists per supported target (selected by `cfg(target_arch = ...)`), plus a
/// software-only `test` implementation used by every other crate's unit tests.
pub trait Arch {
    /// See [`Ipl`].
    type Ipl: Ipl;
    /// See [`Context`].
    type Context: Context;

    /// Disables interrupts and returns a token that can restore the previous level.
    fn ipl_disable() -> Self::Ipl;
    /// Restores the interrupt priority level captured by an earlier call to `ipl_disable`.
    fn ipl_restore(prev: Self::Ipl);

    /// Puts the CPU into a low-power state until an event happens, or returns immediately.
    fn wait_for_event();
    /// Puts the CPU into a low-power state until an interrupt happens, or returns immediately.
    fn wait_for_interrupt();

    /// The number of CPUs in the system.
    fn count_cpus() -> usize;
    /// This CPU's index, in `0 .. count_cpus()`. Stable across the CPU's lifetime.
    fn cpu_index() -> usize;
    /// A number describing this CPU's cache/NUMA affinity, for the scheduler's load balancer.
    /// Closer numbers mean better affinity.
    fn cpu_affinity() -> i64;

    /// Builds a fresh `Context` for a new thread that will begin executing `entry(arg)` on
    /// `stack_top` (which must point just past the end of the thread's kernel stack).
    fn context_init(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Self::Context;
    /// Saves the currently running thread's registers into `*prev` and restores `*next`'s,
    /// resuming execution there. Returns once this thread is scheduled again.
    ///
    /// # Safety
    /// `prev` and `next` must each point to a valid, exclusively-owned `Context`, and `next` must
    /// have been produced by `context_init` or a previous `context_switch` into it.
    unsafe fn context_switch(prev: *mut Self::Context, next: *const Self::Context);

    /// Writes a single page table entry mapping `vaddr` to `paddr` with the given flags into the
    /// page table rooted at `pt_root` (an architecture-specific physical address).
    ///
    /// # Safety
    /// `pt_root` must be a live page table root for some address space; `vaddr`/`paddr` must be
    /// page-aligned.
    unsafe fn pt_map(pt_root: usize, vaddr: usize, paddr: usize, flags: PageFlags) -> KernelResult<()>;
    /// Clears the page table entry for `vaddr` in the page table rooted at `pt_root`.
    ///
    /// # Safety
    /// Same preconditions as `pt_map`.
    unsafe fn pt_unmap(pt_root: usize, vaddr: usize);
    /// Translates a physical address into one the kernel can dereference directly. Every
    /// architecture here identity-maps all of physical memory into the kernel's own address space
    /// at boot (the same assumption `kernel`'s task-spawning code makes of `pt_root`), so this is
    /// the identity function unless an architecture relocates that mapping to a fixed offset.
    fn phys_to_virt(paddr: usize) -> usize {
        paddr
    }
    /// Invalidates cached translations for `vaddr` under the given ASID (or every ASID, if
    /// `None`) on every CPU running this address space. This is the shootdown primitive;
    /// `kernel-as` is responsible for deciding which CPUs need an IPI to actually run it.
    fn tlb_invalidate(asid: Option<u16>, vaddr: usize);

    /// Arms the local timer to fire again after `ticks` of the architecture's own tick unit.
    fn timer_set_next(ticks: u64);
    /// Sends an inter-processor interrupt to the CPU at `cpu_index`, causing it to invoke the
    /// kernel's IPI handler (used for TLB shootdown and cross-CPU rescheduling).
    fn send_ipi(cpu_index: usize, vector: u8);
}
