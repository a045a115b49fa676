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

//! A single mapped region of an address space and the backend that serves its faults.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use arch::PageFlags;
use error::KernelResult;
use frame::Pfn;
use locks::Mutex;

use crate::backend::Backend;

bitflags! {
    /// Permission flags an area carries, independent of its backend.
    pub struct AreaFlags: u32 {
        /// Pages in this area may be read.
        const READ      = 0b0000_0001;
        /// Pages in this area may be written.
        const WRITE     = 0b0000_0010;
        /// Pages in this area may be executed.
        const EXEC      = 0b0000_0100;
        /// Pages in this area are accessible from user mode.
        const USER      = 0b0000_1000;
        /// Pages in this area may be cached normally (absent, they're mapped `NOCACHE`, as for an
        /// MMIO-backed `Physical` area).
        const CACHEABLE = 0b0001_0000;
    }
}

impl AreaFlags {
    /// The `PageFlags` a page table entry for this area should carry.
    pub(crate) fn to_page_flags(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.contains(AreaFlags::READ) { flags |= PageFlags::READ; }
        if self.contains(AreaFlags::WRITE) { flags |= PageFlags::WRITE; }
        if self.contains(AreaFlags::EXEC) { flags |= PageFlags::EXEC; }
        if self.contains(AreaFlags::USER) { flags |= PageFlags::USER; }
        if !self.contains(AreaFlags::CACHEABLE) { flags |= PageFlags::NOCACHE; }
        flags
    }

    /// The subset of `READ`/`WRITE`/`EXEC` an access of the given kind requires of an area.
    fn required_for(access: AccessType) -> AreaFlags {
        match access {
            AccessType::Read => AreaFlags::READ,
            AccessType::Write => AreaFlags::WRITE,
            AccessType::Exec => AreaFlags::EXEC
        }
    }
}

/// The kind of access that triggered a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// A load.
    Read,
    /// A store.
    Write,
    /// An instruction fetch.
    Exec
}

/// A mapped region `[base, base + size)` of an address space, backed by one `Backend`.
pub struct Area {
    base: usize,
    size: AtomicUsize,
    flags: AtomicU32,
    backend: Arc<dyn Backend>,
    /// Pages actually faulted in so far, each holding the physical frame currently mapped there so
    /// it can be handed back to the backend when the page is unmapped or the area is destroyed.
    used_pages: Mutex<BTreeMap<usize, Pfn>>
}

impl Area {
    pub(crate) fn new(base: usize, size: usize, flags: AreaFlags, backend: Arc<dyn Backend>) -> Area {
        Area {
            base,
            size: AtomicUsize::new(size),
            flags: AtomicU32::new(flags.bits()),
            backend,
            used_pages: Mutex::new(BTreeMap::new())
        }
    }

    /// This area's starting virtual address.
    pub fn base(&self) -> usize {
        self.base
    }

    /// This area's current size, in bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// This area's permission flags.
    pub fn flags(&self) -> AreaFlags {
        AreaFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Stores this area's new permission flags. Only the bookkeeping half of
    /// `AS_AREA_CHANGE_FLAGS`: does not touch any page table entry already mapped for this area --
    /// see `AddressSpace::area_change_flags`, which calls this and then performs the full
    /// unmap/remap spec.md requires so existing mappings actually observe the change.
    pub(crate) fn change_flags(&self, new_flags: AreaFlags) {
        self.flags.store(new_flags.bits(), Ordering::Release);
    }

    /// The backend serving this area's page faults.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Whether `va` falls inside this area's mapped range.
    pub fn contains(&self, va: usize) -> bool {
        va >= self.base && va < self.base + self.size()
    }

    /// Whether `[base, base + size)` overlaps this area's range.
    pub fn overlaps(&self, base: usize, size: usize) -> bool {
        base < self.base + self.size() && self.base < base + size
    }

    /// Whether `access` is permitted by this area's flags (page-fault dispatch step 2).
    pub fn permits(&self, access: AccessType) -> bool {
        self.flags().contains(AreaFlags::required_for(access))
    }

    pub(crate) fn record_used(&self, va_aligned: usize, pfn: Pfn) {
        loop {
            if let Ok(mut pages) = self.used_pages.try_lock() {
                pages.insert(va_aligned, pfn);
                return;
            }
        }
    }

    /// Whether `va_aligned` has already been faulted in.
    pub fn is_used(&self, va_aligned: usize) -> bool {
        loop {
            if let Ok(pages) = self.used_pages.try_lock() {
                return pages.contains_key(&va_aligned);
            }
        }
    }

    pub(crate) fn take_used(&self, va_aligned: usize) -> Option<Pfn> {
        loop {
            if let Ok(mut pages) = self.used_pages.try_lock() {
                return pages.remove(&va_aligned);
            }
        }
    }

    pub(crate) fn used_pages_snapshot(&self) -> Vec<(usize, Pfn)> {
        loop {
            if let Ok(pages) = self.used_pages.try_lock() {
                return pages.iter().map(|(&va, &pfn)| (va, pfn)).collect();
            }
        }
    }

    /// Grows or shrinks the area, delegating to the backend to decide whether that's allowed.
    pub fn resize(&self, new_size: usize) -> KernelResult<()> {
        let old_size = self.size();
        self.backend.resize(self, old_size, new_size)?;
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }
}
