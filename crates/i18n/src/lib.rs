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

//! Human-readable text for everything the kernel logs or reports back through a fault handler.
//!
//! `KernelError` (see `kernel-error`) carries the machine-readable outcome of an operation;
//! `Text` carries the message a human would want to see alongside it. Kept as a single enum
//! rather than the multi-language dispatch this crate once had, since the kernel only ever
//! speaks one language to its log.

#![no_std]

#![deny(warnings, missing_docs)]

use core::fmt;

/// Every distinct message the kernel can produce, parameterized by the values needed to render
/// it. Grouped loosely by the subsystem that raises it.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum Text<'a> {
    // --- frame allocator ---
    /// No zone had a free block of the requested order.
    FrameOutOfMemory(&'a usize, &'a usize),
    /// A double-free was detected on a frame whose reference count was already 0.
    FrameDoubleFree(&'a usize),
    /// A frame's reference count would have wrapped past its max.
    FrameRefcountOverflow(&'a usize),
    /// Two zones being registered (or merged) overlap in physical address space.
    ZonesOverlap(&'a usize, &'a usize, &'a usize, &'a usize),

    // --- slab allocator ---
    /// A slab's free-object bitmap was corrupt (an already-free object was freed again).
    SlabDoubleFree(&'a *const u8),
    /// An object handed back to a cache didn't belong to any of its slabs.
    SlabForeignObject(&'a *const u8),
    /// `slab_reclaim` freed the given number of slabs back to the frame allocator.
    SlabReclaimed(&'a usize),

    // --- waitq ---
    /// A sleep on a waitq timed out before a wakeup arrived.
    WaitqTimedOut,
    /// A sleep on a waitq was interrupted before a wakeup or a timeout.
    WaitqInterrupted,
    /// `waitq_wakeup` was called with nobody asleep; it was recorded as a missed wakeup.
    WaitqMissedWakeup(&'a usize),

    // --- address space ---
    /// A new area would overlap an existing one in the same address space.
    AsAreaOverlaps(&'a usize, &'a usize),
    /// A page fault landed outside every area mapped into the faulting address space.
    AsFaultUnmapped(&'a usize),
    /// A page fault's access type (read/write/exec) wasn't permitted by the area it landed in.
    AsFaultProtection(&'a usize),
    /// The backend for an area doesn't implement the requested operation (e.g. resizing a
    /// physical-memory area).
    AsBackendUnsupported,
    /// Every ASID is in use; the oldest non-kernel address space's mappings must be shot down
    /// and its ASID reassigned before this request can proceed.
    AsnExhausted,

    // --- ELF loading (kernel-elf) ---
    /// Magic number didn't match `\x7fELF`.
    ElfBadMagic([u8; 4]),
    /// `e_ident[EI_CLASS]` didn't match the running architecture's pointer width.
    ElfWrongClass(u8),
    /// `e_ident[EI_DATA]` didn't match the running architecture's endianness.
    ElfWrongEndianness(u8),
    /// Program header entry size was smaller than `sizeof(Elf32_Phdr)`.
    ElfPhentsizeTooSmall(&'a u16, &'a u16),
    /// A `PT_LOAD` segment's file offset and virtual address disagree modulo the page size.
    ElfSegmentMisaligned(&'a u32, &'a u32),
    /// Two `PT_LOAD` segments overlap in virtual memory.
    ElfSegmentsOverlap,
    /// `p_filesz` exceeded `p_memsz` for a `PT_LOAD` segment.
    ElfSegmentFileszExceedsMemsz,
    /// The entry point isn't contained in any loaded segment.
    ElfEntryNotMapped(&'a u32),

    // --- scheduler / task ---
    /// A task tried to exceed the configured limit on live tasks.
    TaskLimitReached(&'a usize),
    /// A kernel stack could not be allocated for a new thread.
    ThreadStackAllocFailed,
    /// `schedule()` found every run queue on every CPU empty; the CPU will idle.
    SchedAllQueuesEmpty,

    // --- IPC ---
    /// The callee's phone had already been hung up.
    IpcPhoneHungUp,
    /// A phone's in-flight asynchronous call count hit `IPC_MAX_ASYNC_CALLS`.
    IpcAsyncCallsExhausted,
    /// A `data_write`/`data_read` request exceeded `DATA_XFER_LIMIT`.
    IpcXferTooLarge(&'a usize, &'a usize),
    /// A call carried a method number below `IPC_FIRST_USER_METHOD` that the kernel does not
    /// recognize as one of its own reserved methods.
    IpcUnknownKernelMethod(&'a u32),

    // --- capability table ---
    /// A task's capability table had no free slot.
    CapTableFull,
    /// A handle didn't name a live capability in the caller's table.
    CapNotFound(&'a u32),
    /// A handle named a capability, but of the wrong kobject kind for the requested operation.
    CapWrongKind,

    // --- heap ---
    /// The global allocator could not satisfy a request of the given size and alignment, even
    /// after a reclaim pass.
    HeapOutOfMemory(&'a usize, &'a usize),

    // --- misc / panics ---
    /// The kernel panicked with the given message.
    UnexpectedKernelError(&'a core::panic::PanicInfo<'a>)
}

impl<'a> fmt::Display for Text<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Text::FrameOutOfMemory(size, align) =>
                write!(f, "frame allocator ran out of memory trying to satisfy size = {:#x}, align = {:#x}", size, align),
            Text::FrameDoubleFree(frame) =>
                write!(f, "attempted to free frame {:#x} that was already free", frame),
            Text::FrameRefcountOverflow(frame) =>
                write!(f, "reference count on frame {:#x} would have overflowed", frame),
            Text::ZonesOverlap(a_base, a_size, b_base, b_size) =>
                write!(f, "zone [{:#x}, {:#x}) overlaps zone [{:#x}, {:#x})",
                    a_base, a_base.wrapping_add(*a_size), b_base, b_base.wrapping_add(*b_size)),

            Text::SlabDoubleFree(obj) => write!(f, "attempted to free object {:p} that was already free", obj),
            Text::SlabForeignObject(obj) => write!(f, "object {:p} does not belong to this cache", obj),
            Text::SlabReclaimed(slabs) => write!(f, "slab reclaim freed {} slab(s) back to the frame allocator", slabs),

            Text::WaitqTimedOut => write!(f, "waitq sleep timed out"),
            Text::WaitqInterrupted => write!(f, "waitq sleep was interrupted"),
            Text::WaitqMissedWakeup(count) => write!(f, "waitq_wakeup found nobody sleeping (missed wakeups: {})", count),

            Text::AsAreaOverlaps(base, size) =>
                write!(f, "new area [{:#x}, {:#x}) overlaps an existing area", base, base.wrapping_add(*size)),
            Text::AsFaultUnmapped(addr) => write!(f, "page fault at {:#x} is outside every mapped area", addr),
            Text::AsFaultProtection(addr) => write!(f, "page fault at {:#x} violated the area's access flags", addr),
            Text::AsBackendUnsupported => write!(f, "this area's backend does not support that operation"),
            Text::AsnExhausted => write!(f, "every address space identifier is in use"),

            Text::ElfBadMagic(found) =>
                write!(f, "wrong ELF magic number (found [{:#x}, {:#x}, {:#x}, {:#x}])",
                    found[0], found[1], found[2], found[3]),
            Text::ElfWrongClass(class) => write!(f, "unsupported ELF class {:#x}", class),
            Text::ElfWrongEndianness(data) => write!(f, "unsupported ELF endianness {:#x}", data),
            Text::ElfPhentsizeTooSmall(expected, actual) =>
                write!(f, "program header entry too small (expected at least {} bytes; found {})", expected, actual),
            Text::ElfSegmentMisaligned(offset, vaddr) =>
                write!(f, "segment file offset {:#x} disagrees with virtual address {:#x} modulo the page size", offset, vaddr),
            Text::ElfSegmentsOverlap => write!(f, "two PT_LOAD segments overlap in virtual memory"),
            Text::ElfSegmentFileszExceedsMemsz => write!(f, "segment's p_filesz exceeds its p_memsz"),
            Text::ElfEntryNotMapped(entry) => write!(f, "entry point {:#x} is not contained in any loaded segment", entry),

            Text::TaskLimitReached(limit) => write!(f, "task limit of {} tasks reached", limit),
            Text::ThreadStackAllocFailed => write!(f, "failed to allocate a kernel stack for a new thread"),
            Text::SchedAllQueuesEmpty => write!(f, "every run queue on every CPU is empty"),

            Text::IpcPhoneHungUp => write!(f, "the callee's phone has been hung up"),
            Text::IpcAsyncCallsExhausted => write!(f, "phone has reached its limit of in-flight asynchronous calls"),
            Text::IpcXferTooLarge(len, limit) => write!(f, "transfer of {:#x} bytes exceeds the {:#x}-byte limit", len, limit),
            Text::IpcUnknownKernelMethod(method) => write!(f, "unrecognized kernel-reserved IPC method {}", method),

            Text::CapTableFull => write!(f, "capability table is full"),
            Text::CapNotFound(handle) => write!(f, "handle {} does not name a live capability", handle),
            Text::CapWrongKind => write!(f, "handle names a capability of the wrong kind for this operation"),

            Text::HeapOutOfMemory(size, align) =>
                write!(f, "heap allocator ran out of memory trying to satisfy size = {:#x}, align = {:#x}", size, align),

            Text::UnexpectedKernelError(panic_info) => write!(f, "unexpected kernel error: {}", panic_info)
        }
    }
}
