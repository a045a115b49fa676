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

//! The AArch64 `Arch` implementation.

use core::arch::asm;
use error::{KernelError, KernelResult};
use crate::{Arch, Context as ContextTrait, Ipl as IplTrait, PageFlags};

/// The AArch64 `Arch` implementation. Zero-sized; every method reads or writes machine state
/// directly.
pub struct Aarch64;

/// The saved `DAIF` bits from before interrupts were masked.
#[derive(Debug, Clone, Copy)]
pub struct Daif(u64);
impl IplTrait for Daif {}

/// The callee-saved registers and stack pointer preserved across a context switch, plus the
/// initial program counter for a thread that hasn't run yet.
#[derive(Debug, Clone, Copy)]
pub struct Aarch64Context {
    sp: usize,
    x19_x30: [usize; 12],
    pc: usize
}
impl ContextTrait for Aarch64Context {}

impl Arch for Aarch64 {
    type Ipl = Daif;
    type Context = Aarch64Context;

    #[inline(always)]
    fn ipl_disable() -> Daif {
        let prev: u64;
        unsafe {
            asm!("mrs {}, DAIF", out(reg) prev, options(nomem, nostack, preserves_flags));
            asm!("msr DAIFSet, #0xf", options(nomem, nostack, preserves_flags));
        }
        Daif(prev)
    }

    #[inline(always)]
    fn ipl_restore(prev: Daif) {
        unsafe {
            asm!("msr DAIF, {}", in(reg) prev.0, options(nomem, nostack, preserves_flags));
        }
    }

    #[inline(always)]
    fn wait_for_event() {
        unsafe {
            asm!("dsb sy", "wfe", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline(always)]
    fn wait_for_interrupt() {
        unsafe {
            asm!("dsb sy", "wfi", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline]
    fn count_cpus() -> usize {
        // TODO: read this out of the DTB/ACPI tables gathered at boot instead of assuming one.
        1
    }

    #[inline]
    fn cpu_index() -> usize {
        0
    }

    fn cpu_affinity() -> i64 {
        bitflags! {
            struct Mpidr: i64 {
                const AFFINITY = 0x0000_00ff_00ff_ffff;
            }
        }
        let mpidr: i64;
        unsafe {
            asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nostack, nomem, preserves_flags));
        }
        mpidr & Mpidr::AFFINITY.bits()
    }

    fn context_init(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Aarch64Context {
        Aarch64Context {
            sp: stack_top as usize,
            x19_x30: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, arg],
            pc: entry as usize
        }
    }

    unsafe fn context_switch(_prev: *mut Aarch64Context, _next: *const Aarch64Context) {
        // TODO: hand-written assembly stub that saves x19-x30 and sp to `*prev`, loads them from
        // `*next`, and branches to `(*next).pc` the first time `*next` runs.
        unimplemented!("aarch64 context switch is implemented in assembly, not yet wired up here");
    }

    unsafe fn pt_map(_pt_root: usize, vaddr: usize, paddr: usize, _flags: PageFlags) -> KernelResult<()> {
        if vaddr % 4096 != 0 || paddr % 4096 != 0 {
            return Err(KernelError::Inval);
        }
        // TODO: walk/allocate the four-level AArch64 page table and write the leaf descriptor.
        unimplemented!("aarch64 page table walk not yet wired up here");
    }

    unsafe fn pt_unmap(_pt_root: usize, _vaddr: usize) {
        unimplemented!("aarch64 page table walk not yet wired up here");
    }

    fn tlb_invalidate(asid: Option<u16>, vaddr: usize) {
        unsafe {
            match asid {
                Some(asid) => {
                    let arg = ((asid as u64) << 48) | ((vaddr as u64) >> 12);
                    asm!("dsb ishst", "tlbi vae1is, {}", "dsb ish", "isb", in(reg) arg, options(nostack));
                }
                None => {
                    asm!("dsb ishst", "tlbi vmalle1is", "dsb ish", "isb", options(nostack, preserves_flags));
                }
            }
        }
    }

    fn timer_set_next(ticks: u64) {
        unsafe {
            asm!("msr cntp_tval_el0, {}", "msr cntp_ctl_el0, {}", in(reg) ticks, in(reg) 1u64, options(nostack));
        }
    }

    fn send_ipi(_cpu_index: usize, _vector: u8) {
        // TODO: write to the GIC distributor's SGI register once the GIC driver is wired up.
        unimplemented!("aarch64 IPI send not yet wired up here");
    }
}
