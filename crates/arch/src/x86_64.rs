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

//! The x86_64 `Arch` implementation. Mirrors the teacher crate's existing split: AArch64 is the
//! actively developed target, x86_64 is a stub that's filled in as each piece is needed.

use core::arch::asm;
use error::{KernelError, KernelResult};
use crate::{Arch, Context as ContextTrait, Ipl as IplTrait, PageFlags};

/// The x86_64 `Arch` implementation.
pub struct X86_64;

/// The saved `RFLAGS` register from before interrupts were masked.
#[derive(Debug, Clone, Copy)]
pub struct RFlags(u64);
impl IplTrait for RFlags {}

/// The callee-saved registers and stack pointer preserved across a context switch.
#[derive(Debug, Clone, Copy)]
pub struct X86_64Context {
    rsp: usize,
    rbx_r15: [usize; 7],
    rip: usize
}
impl ContextTrait for X86_64Context {}

impl Arch for X86_64 {
    type Ipl = RFlags;
    type Context = X86_64Context;

    #[inline(always)]
    fn ipl_disable() -> RFlags {
        let prev: u64;
        unsafe {
            asm!("pushfq", "pop {}", out(reg) prev, options(nomem, preserves_flags));
            asm!("cli", options(nomem, nostack, preserves_flags));
        }
        RFlags(prev)
    }

    #[inline(always)]
    fn ipl_restore(prev: RFlags) {
        unsafe {
            asm!("push {}", "popfq", in(reg) prev.0, options(nomem));
        }
    }

    #[inline(always)]
    fn wait_for_event() {
        unsafe {
            asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline(always)]
    fn wait_for_interrupt() {
        unsafe {
            asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline]
    fn count_cpus() -> usize {
        // TODO
        unimplemented!();
    }

    #[inline]
    fn cpu_index() -> usize {
        // TODO
        unimplemented!();
    }

    fn cpu_affinity() -> i64 {
        // TODO
        unimplemented!();
    }

    fn context_init(_stack_top: *mut u8, _entry: extern "C" fn(usize) -> !, _arg: usize) -> X86_64Context {
        // TODO
        unimplemented!();
    }

    unsafe fn context_switch(_prev: *mut X86_64Context, _next: *const X86_64Context) {
        // TODO
        unimplemented!();
    }

    unsafe fn pt_map(_pt_root: usize, vaddr: usize, paddr: usize, _flags: PageFlags) -> KernelResult<()> {
        if vaddr % 4096 != 0 || paddr % 4096 != 0 {
            return Err(KernelError::Inval);
        }
        // TODO
        unimplemented!();
    }

    unsafe fn pt_unmap(_pt_root: usize, _vaddr: usize) {
        // TODO
        unimplemented!();
    }

    fn tlb_invalidate(_asid: Option<u16>, vaddr: usize) {
        unsafe {
            asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
        }
    }

    fn timer_set_next(_ticks: u64) {
        // TODO
        unimplemented!();
    }

    fn send_ipi(_cpu_index: usize, _vector: u8) {
        // TODO
        unimplemented!();
    }
}
