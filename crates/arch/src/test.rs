/* Copyright (c) 2021 Jeremy Davis (jeremydavis519@gmail.com)
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

//! A software-only `Arch` implementation with no inline assembly and no real hardware, so the
//! rest of the workspace can be unit tested with `cargo test` on the build machine. Interrupt
//! masking is a plain counter, context switching is a userspace-thread-friendly no-op (the
//! "switch" just returns, since host tests never actually run two kernel threads concurrently on
//! one stack), and page table writes are recorded in a log instead of touching real memory.

use core::sync::atomic::{AtomicI8, AtomicUsize, Ordering};
use alloc::vec::Vec;
use locks::Mutex;
use error::{KernelError, KernelResult};
use crate::{Arch, Context as ContextTrait, Ipl as IplTrait, PageFlags};

static IPL_DEPTH: AtomicI8 = AtomicI8::new(0);
static TIMER_TICKS: AtomicUsize = AtomicUsize::new(0);

/// The test `Arch` implementation.
pub struct TestArch;

/// How many nested `ipl_disable` calls were already outstanding when this token was taken.
#[derive(Debug, Clone, Copy)]
pub struct TestIpl(i8);
impl IplTrait for TestIpl {}

/// A `(vaddr, paddr, flags)` triple or `None` for an unmapped page, recorded instead of written
/// to a real page table.
#[derive(Debug, Clone, Copy)]
pub struct TestContext {
    /// An opaque identifier distinguishing one simulated thread's context from another's.
    pub id: usize
}
impl ContextTrait for TestContext {}

lazy_static! {
    unsafe {
        /// Every `(pt_root, vaddr) -> (paddr, flags)` mapping written by `pt_map`, for tests to
        /// assert against. Cleared by nothing; each test is expected to use its own `pt_root`.
        pub static ref PAGE_TABLE_LOG: Mutex<Vec<(usize, usize, usize, PageFlags)>> = Mutex::new(Vec::new());
        /// Every `(asid, vaddr)` shootdown request `tlb_invalidate` recorded, in order.
        pub static ref TLB_LOG: Mutex<Vec<(Option<u16>, usize)>> = Mutex::new(Vec::new());
    }
}

impl Arch for TestArch {
    type Ipl = TestIpl;
    type Context = TestContext;

    fn ipl_disable() -> TestIpl {
        let prev = IPL_DEPTH.fetch_add(1, Ordering::SeqCst);
        TestIpl(prev)
    }

    fn ipl_restore(prev: TestIpl) {
        IPL_DEPTH.store(prev.0, Ordering::SeqCst);
    }

    fn wait_for_event() {}
    fn wait_for_interrupt() {}

    fn count_cpus() -> usize { 4 }
    fn cpu_index() -> usize { 0 }
    fn cpu_affinity() -> i64 { 0 }

    fn context_init(_stack_top: *mut u8, _entry: extern "C" fn(usize) -> !, arg: usize) -> TestContext {
        TestContext { id: arg }
    }

    unsafe fn context_switch(_prev: *mut TestContext, _next: *const TestContext) {
        // Host tests never actually need to resume a suspended thread's instruction pointer;
        // the scheduler tests only assert on run-queue bookkeeping, not on control flow.
    }

    unsafe fn pt_map(pt_root: usize, vaddr: usize, paddr: usize, flags: PageFlags) -> KernelResult<()> {
        if vaddr % 4096 != 0 || paddr % 4096 != 0 {
            return Err(KernelError::Inval);
        }
        PAGE_TABLE_LOG.lock().push((pt_root, vaddr, paddr, flags));
        Ok(())
    }

    unsafe fn pt_unmap(pt_root: usize, vaddr: usize) {
        PAGE_TABLE_LOG.lock().retain(|&(root, va, _, _)| root != pt_root || va != vaddr);
    }

    fn tlb_invalidate(asid: Option<u16>, vaddr: usize) {
        TLB_LOG.lock().push((asid, vaddr));
    }

    fn timer_set_next(ticks: u64) {
        TIMER_TICKS.store(ticks as usize, Ordering::SeqCst);
    }

    fn send_ipi(_cpu_index: usize, _vector: u8) {}
}
