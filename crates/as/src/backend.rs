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

//! The `Backend` vtable every address-space area is built on, and the four concrete backends this
//! kernel supports.

use core::marker::PhantomData;

use arch::{Arch, PageFlags};
use error::{KernelError, KernelResult};
use frame::{AllocFlags, Pfn};
use i18n::Text;
use locks::Mutex;

use crate::area::{AccessType, Area};

/// What a backend's `page_fault` hands back: the physical frame to map and the permission/caching
/// flags the page table entry should carry.
#[derive(Debug, Clone, Copy)]
pub struct PageMapping {
    /// The frame to map at the faulting address.
    pub pfn: Pfn,
    /// The flags to map it with.
    pub flags: PageFlags
}

/// The vtable an area's backing store implements: how to serve a fault, how to give back whatever
/// it handed out when a page is unmapped, and whether (and how) the area may be resized or shared.
pub trait Backend: Send + Sync {
    /// Serves a page fault at `va_aligned` (already rounded down to a page boundary) with the
    /// given access type. Called with `area`'s owning address space's page-table lock held and
    /// after `area`'s permission flags have already been checked against `access`.
    fn page_fault(&self, area: &Area, va_aligned: usize, access: AccessType) -> KernelResult<PageMapping>;

    /// Releases whatever `page_fault` allocated for the page previously mapped at `va_aligned`,
    /// now that it's being unmapped (explicit unmap, or area/address-space destruction).
    fn release_page(&self, area: &Area, va_aligned: usize, pfn: Pfn);

    /// Whether `Area::resize` is permitted on an area with this backend.
    fn is_resizable(&self) -> bool {
        false
    }

    /// Whether this area may be shared into another address space (`as_area_share`).
    fn is_shareable(&self) -> bool {
        false
    }

    /// Grows or shrinks the area. The default rejects every resize; backends that allow it
    /// override this.
    fn resize(&self, area: &Area, old_size: usize, new_size: usize) -> KernelResult<()> {
        let _ = (area, old_size, new_size);
        let _ = Text::AsBackendUnsupported;
        Err(KernelError::NotSup)
    }
}

/// Demand-paged, zero-filled memory with no backing file: a fresh frame is allocated (and, per the
/// spec, zeroed) the first time each page is touched. Resizable and shareable.
pub struct Anonymous;

impl Backend for Anonymous {
    fn page_fault(&self, _area: &Area, va_aligned: usize, _access: AccessType) -> KernelResult<PageMapping> {
        let pfn = frame::frame_alloc(1, AllocFlags::empty())?;
        #[cfg(any(test, feature = "std-test"))]
        crate::sim_memory::zero_frame(pfn);
        let _ = va_aligned;
        Ok(PageMapping { pfn, flags: PageFlags::READ | PageFlags::WRITE })
    }

    fn release_page(&self, _area: &Area, _va_aligned: usize, pfn: Pfn) {
        frame::frame_free(pfn, 1, AllocFlags::empty());
    }

    fn is_resizable(&self) -> bool {
        true
    }

    fn is_shareable(&self) -> bool {
        true
    }

    fn resize(&self, _area: &Area, _old_size: usize, _new_size: usize) -> KernelResult<()> {
        // Growing or shrinking an anonymous area touches no backing store up front; pages beyond
        // the new size are reclaimed lazily the next time the area is destroyed or explicitly
        // unmapped, same as any other page this backend gives up.
        Ok(())
    }
}

/// A fixed range of physical memory (MMIO, a framebuffer, ...), mapped linearly: `pa = base_pa +
/// (va - area.base)`. No frame allocation, so nothing to release on unmap. Always shareable; never
/// resizable, since growing it would require the caller to specify more physical memory than the
/// area was created with.
pub struct Physical {
    base_pa: usize
}

impl Physical {
    /// An area backed by `nframes` physical frames starting at `base_pa`. The area's own size
    /// (in bytes, set at `as_area_create` time) determines how much of that range is mapped.
    pub fn new(base_pa: usize) -> Physical {
        Physical { base_pa }
    }
}

impl Backend for Physical {
    fn page_fault(&self, area: &Area, va_aligned: usize, _access: AccessType) -> KernelResult<PageMapping> {
        let offset = va_aligned - area.base();
        let pfn = Pfn((self.base_pa + offset) / frame::PAGE_SIZE);
        Ok(PageMapping { pfn, flags: area.flags().to_page_flags() })
    }

    fn release_page(&self, _area: &Area, _va_aligned: usize, _pfn: Pfn) {
        // Nothing to give back: this backend never took anything from the frame allocator.
    }

    fn is_shareable(&self) -> bool {
        true
    }
}

/// A range of an address space backed by a `PT_LOAD` segment of an ELF image kept resident in
/// kernel memory. Pages are demand-loaded by copying from the image (zero-filling any `.bss`
/// tail); see `kernel-elf` for how the segment was parsed out of the file.
pub struct Elf<A: Arch> {
    image_data: &'static [u8],
    segment: elf::Segment,
    _arch: PhantomData<A>
}

impl<A: Arch> Elf<A> {
    /// `image_data` is the whole ELF file's bytes (kept alive for the program's lifetime, e.g. an
    /// embedded boot module); `segment` is one of its `PT_LOAD` entries, as produced by
    /// `ElfImage::parse`.
    pub fn new(image_data: &'static [u8], segment: elf::Segment) -> Elf<A> {
        Elf { image_data, segment, _arch: PhantomData }
    }

    /// Copies this segment's file-backed bytes (and zero-fills its `.bss` tail) for the page
    /// starting at `offset_in_segment` into `dst`, which must point to `frame::PAGE_SIZE` writable
    /// bytes.
    ///
    /// # Safety
    /// `dst` must be valid for `frame::PAGE_SIZE` writes and not aliased by any other live
    /// reference.
    unsafe fn copy_page_into(&self, offset_in_segment: usize, dst: *mut u8) {
        let seg_file_off = self.segment.file_offset as usize;
        let seg_file_sz = self.segment.file_sz as usize;
        let seg_mem_sz = self.segment.mem_sz as usize;
        core::ptr::write_bytes(dst, 0, frame::PAGE_SIZE);
        for i in 0 .. frame::PAGE_SIZE {
            let pos = offset_in_segment + i;
            if pos < seg_mem_sz && pos < seg_file_sz {
                dst.add(i).write(self.image_data[seg_file_off + pos]);
            }
        }
    }
}

impl<A: Arch> Backend for Elf<A> {
    fn page_fault(&self, area: &Area, va_aligned: usize, _access: AccessType) -> KernelResult<PageMapping> {
        let pfn = frame::frame_alloc(1, AllocFlags::empty())?;
        let offset_in_segment = va_aligned - self.segment.vaddr as usize;

        #[cfg(not(any(test, feature = "std-test")))]
        {
            // The kernel identity-maps physical memory, so the frame's physical address doubles
            // as a kernel-dereferenceable pointer once translated through `phys_to_virt`.
            let dst = A::phys_to_virt(pfn.0 * frame::PAGE_SIZE) as *mut u8;
            unsafe {
                self.copy_page_into(offset_in_segment, dst);
            }
        }
        #[cfg(any(test, feature = "std-test"))]
        {
            let mut page = [0u8; frame::PAGE_SIZE];
            unsafe {
                self.copy_page_into(offset_in_segment, page.as_mut_ptr());
            }
            crate::sim_memory::write_page(pfn, page);
        }

        Ok(PageMapping { pfn, flags: area.flags().to_page_flags() })
    }

    fn release_page(&self, _area: &Area, _va_aligned: usize, pfn: Pfn) {
        frame::frame_free(pfn, 1, AllocFlags::empty());
    }

    fn is_shareable(&self) -> bool {
        true
    }
}

/// A seam so a user-pager-backed area can ask a userspace server for pages without this crate
/// depending on `kernel-ipc` (which would need `kernel-task`, which needs `kernel-as`). Whatever
/// crate owns both tasks and address spaces implements this and registers it at boot with
/// [`register_pager`] -- the same shape `kernel-frame`'s `Reclaimer` and `kernel-waitq`'s
/// `Scheduler` use to let a lower layer call up into a higher one.
pub trait Pager: Sync {
    /// The equivalent of sending a synchronous `PAGE_IN(offset, length, id1, id2, id3)` IPC call
    /// to `pager_endpoint` and waiting for the reply. On success, the returned frame's reference
    /// count has already been adjusted by the pager server on the kernel's behalf.
    fn page_in(
        &self,
        pager_endpoint: u32,
        offset: usize,
        length: usize,
        id1: usize,
        id2: usize,
        id3: usize
    ) -> KernelResult<Pfn>;
}

static PAGER: Mutex<Option<&'static dyn Pager>> = Mutex::new(None);

/// Registers the kernel's single user-pager backend. Called once at boot by whatever crate
/// implements `Pager`.
pub fn register_pager(pager: &'static dyn Pager) {
    loop {
        if let Ok(mut slot) = PAGER.try_lock() {
            *slot = Some(pager);
            return;
        }
    }
}

fn with_pager<R>(f: impl FnOnce(Option<&'static dyn Pager>) -> R) -> R {
    loop {
        if let Ok(slot) = PAGER.try_lock() {
            return f(*slot);
        }
    }
}

/// An area whose pages are supplied on demand by a userspace pager server, addressed by an
/// opaque `(pager_endpoint, id1, id2, id3)` tuple the pager itself defines the meaning of. Neither
/// resizable nor shareable.
pub struct UserPager {
    pager_endpoint: u32,
    id1: usize,
    id2: usize,
    id3: usize
}

impl UserPager {
    /// An area whose faults are forwarded to `pager_endpoint` as `PAGE_IN` calls carrying
    /// `(id1, id2, id3)`.
    pub fn new(pager_endpoint: u32, id1: usize, id2: usize, id3: usize) -> UserPager {
        UserPager { pager_endpoint, id1, id2, id3 }
    }
}

impl Backend for UserPager {
    fn page_fault(&self, area: &Area, va_aligned: usize, _access: AccessType) -> KernelResult<PageMapping> {
        let offset = va_aligned - area.base();
        let pfn = with_pager(|pager| {
            let pager = pager.ok_or(KernelError::NotSup)?;
            pager.page_in(self.pager_endpoint, offset, frame::PAGE_SIZE, self.id1, self.id2, self.id3)
        })?;
        Ok(PageMapping { pfn, flags: area.flags().to_page_flags() })
    }

    fn release_page(&self, _area: &Area, _va_aligned: usize, pfn: Pfn) {
        // The pager owns this frame's lifetime; dropping the kernel's reference is enough.
        frame::frame_free(pfn, 1, AllocFlags::empty());
    }
}
