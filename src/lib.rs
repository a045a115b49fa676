/* Copyright (c) 2017-2023 Jeremy Davis (jeremydavis519@gmail.com)
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

//! This crate and its dependencies comprise the microkernel: `lib.rs` is the thin binary-level
//! glue that wires the leaf crates (`frame`, `slab`, `waitq`, `address_space`, `sched`, `task`,
//! `ipc`, `cap`) into one running kernel and exposes the stable syscall surface in [`syscall`].
//! Everything with actual algorithmic weight lives in those crates; this one only knows how to
//! bring them up in the right order and route a syscall number to the right one of them.
//!
//! Per-architecture boot code, assembly trampolines and device drivers are out of scope here --
//! they hand off to [`init`] once physical memory has been discovered and the first CPU is ready
//! to take interrupts, the same handoff point the teacher's own `kmain` used to begin from.

#![no_std]

#![deny(warnings, missing_docs)]

extern crate alloc;

use core::panic::PanicInfo;

use arch::Arch;
use frame::{AllocFlags, Pfn, ZoneFlags};
use i18n::Text;
use shared::once::Once;
use task::TaskSystem;

mod heap;
pub mod syscall;

/// The `Arch` implementation this kernel image is built for. Exactly one of these is compiled
/// in; which one depends solely on the target triple, never on a runtime check.
#[cfg(any(target_arch = "arm", target_arch = "armv5te", target_arch = "armv7", target_arch = "aarch64"))]
pub type TargetArch = arch::aarch64::Aarch64;
/// See the aarch64 definition above.
#[cfg(any(target_arch = "i386", target_arch = "i586", target_arch = "i686", target_arch = "x86_64"))]
pub type TargetArch = arch::x86_64::X86_64;

/// A single contiguous run of physical memory discovered by boot code, handed to [`init`] to be
/// registered with the frame allocator. Mirrors the `(base, frame_count, flags)` triple
/// `frame::Zone::new` expects; this crate only adds the name so boot code doesn't need to depend
/// on `kernel-frame` just to describe what it found.
#[derive(Debug, Clone, Copy)]
pub struct MemoryZone {
    /// The physical frame number of the first frame in this zone.
    pub base: Pfn,
    /// The number of frames this zone covers.
    pub frame_count: usize,
    /// This zone's classification (lowmem/highmem/firmware/reserved/available).
    pub flags: ZoneFlags
}

static TASK_SYSTEM: Once<TaskSystem<TargetArch>> = Once::new();

/// The kernel's task/thread subsystem, once [`init`] has brought it up.
///
/// # Panics
/// If called before `init`.
pub fn task_system() -> &'static TaskSystem<TargetArch> {
    TASK_SYSTEM.try_get().expect("kernel::init must run before the task system is reachable")
}

/// Brings the kernel up: registers every physical memory zone boot code discovered, switches the
/// global allocator over to its frame/slab-backed path, and creates the task system every syscall
/// in [`syscall::dispatch`] ultimately reaches into.
///
/// Must run exactly once, after architecture-specific boot code has masked interrupts on the
/// calling CPU and before any second CPU is released to run, parked, or otherwise allowed to
/// allocate -- the same ordering constraint `heap::init` documents for its own caches.
pub fn init(zones: &[MemoryZone], cpu_count: usize) -> &'static TaskSystem<TargetArch> {
    for zone in zones {
        frame::register_zone(frame::Zone::new(zone.base, zone.frame_count, zone.flags));
    }

    heap::init(cpu_count);

    let system = TASK_SYSTEM.call_once(|| TaskSystem::new(cpu_count));
    TaskSystem::register(system);
    system
}

/// Loads a class-32 LSB ELF executable into a brand new task, one address-space area per
/// `PT_LOAD` segment, and spawns its first thread ready to run on `cpu`.
///
/// This is how the kernel starts its first userspace task; it is deliberately not part of
/// [`syscall::dispatch`], since nothing in userspace can be asked to bootstrap itself.
pub fn spawn_elf_task(
    image: &'static [u8],
    cpu: usize,
    priority: u8
) -> error::KernelResult<alloc::sync::Arc<task::Task<TargetArch>>> {
    use address_space::{AreaFlags, Elf};
    use alloc::sync::Arc;

    let parsed = elf::ElfImage::parse(image)?;

    // The page table this task's areas are mapped into. Real boot code allocates and initializes
    // this from the frame allocator before calling in; `frame_alloc` doubles as that allocation
    // here since the kernel identity-maps physical memory, the same simplification `kernel-task`
    // uses for kernel stacks.
    let pt_frame = frame::frame_alloc(1, AllocFlags::empty())?;
    let pt_root = pt_frame.0 * frame::PAGE_SIZE;

    let system = task_system();
    let entry = parsed.entry() as usize;
    let task = system.spawn_task(pt_root, cpu, priority, user_entry_trampoline, entry)?;

    for segment in parsed.segments() {
        let mut flags = AreaFlags::USER;
        if segment.flags.contains(elf::SegmentFlags::READABLE) { flags |= AreaFlags::READ; }
        if segment.flags.contains(elf::SegmentFlags::WRITABLE) { flags |= AreaFlags::WRITE; }
        if segment.flags.contains(elf::SegmentFlags::EXECUTABLE) { flags |= AreaFlags::EXEC; }

        let backend = Arc::new(Elf::<TargetArch>::new(image, *segment));
        task.address_space().area_create(segment.vaddr as usize, segment.mem_sz as usize, flags, backend)?;
    }

    Ok(task)
}

/// The trampoline every freshly loaded userspace thread's context is initialized to enter. Real
/// architecture code replaces this with an `eret`/`iret` into the ELF entry point carried in
/// `arg`; the generic kernel has no way to drop privilege itself, so it stops here instead of
/// pretending to resume user mode it can't actually reach.
extern "C" fn user_entry_trampoline(_entry: usize) -> ! {
    loop {
        TargetArch::wait_for_interrupt();
    }
}

#[panic_handler]
#[cold]
fn panic_handler(panic_info: &PanicInfo) -> ! {
    let _ = Text::UnexpectedKernelError(panic_info);
    unsafe { hang() }
}

/// Does nothing forever. Only ever called while panicking, since interrupts staying masked here
/// is the point: further interrupts on a CPU whose kernel state is already known-bad would only
/// corrupt it more.
unsafe fn hang() -> ! {
    let _ipl = TargetArch::ipl_disable();
    loop {
        TargetArch::wait_for_interrupt();
    }
}
