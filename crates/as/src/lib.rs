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

//! The address-space subsystem: areas, their backends, page-fault dispatch, TLB shootdown, and
//! ASID allocation.
//!
//! An `AddressSpace<A>` owns a set of non-overlapping `Area`s, each backed by a `Backend` that
//! knows how to serve a fault landing inside it. Dispatch (`AddressSpace::page_fault`) looks the
//! faulting address up in the area list, checks the access against the area's flags, and asks the
//! backend for a mapping to insert -- steps 1 through 5 of the algorithm this subsystem is named
//! for. Lock order throughout is `as.lock -> area.lock -> pt.lock`: the area list's lock, then an
//! individual area's own bookkeeping lock, then the page-table lock, never the reverse.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;
#[macro_use] extern crate bitflags;

mod area;
mod asid;
mod backend;
mod tlb;

use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};
use core::marker::PhantomData;

use arch::Arch;
use error::{KernelError, KernelResult};
use i18n::Text;
use locks::Mutex;

pub use area::{AccessType, Area, AreaFlags};
pub use asid::{ASID_KERNEL, ASID_OVERFLOW, ASID_START};
pub use backend::{Anonymous, Backend, Elf, Pager, PageMapping, Physical, UserPager, register_pager};
pub use tlb::{SHOOTDOWN_VECTOR, ShootdownTicket, handle_shootdown_ipi};

#[cfg(any(test, feature = "std-test"))]
pub(crate) mod sim_memory;

/// One address space: a page-table root, the areas mapped into it, and the bookkeeping needed to
/// serve faults and keep its ASID and other CPUs' TLBs consistent with it.
///
/// Generic over the architecture so `pt_map`/`pt_unmap`/`tlb_invalidate` go straight to
/// `kernel-arch` with no indirection; an `AddressSpace<A>` exists for exactly one architecture for
/// the lifetime of the kernel (there's only ever one `A` in a given build).
pub struct AddressSpace<A: Arch> {
    pt_root: usize,
    areas: Mutex<Vec<Arc<Area>>>,
    pt_lock: Mutex<()>,
    asid: Mutex<asid::Asid>,
    is_kernel: bool,
    /// CPUs currently running (or last known to be running) a thread in this address space, and
    /// therefore possibly holding stale entries for it in their TLB after an unmap.
    active_cpus: Mutex<BTreeSet<usize>>,
    _arch: PhantomData<A>
}

impl<A: Arch> AddressSpace<A> {
    /// Creates a new, empty, non-kernel address space rooted at `pt_root`, allocating it a fresh
    /// ASID.
    pub fn new(pt_root: usize) -> Arc<AddressSpace<A>> {
        Arc::new(AddressSpace {
            pt_root,
            areas: Mutex::new(Vec::new()),
            pt_lock: Mutex::new(()),
            asid: Mutex::new(asid::asid_alloc::<A>()),
            is_kernel: false,
            active_cpus: Mutex::new(BTreeSet::new()),
            _arch: PhantomData
        })
    }

    /// Creates the one kernel address space, permanently holding `ASID_KERNEL`. Never reassigned,
    /// even across an ASID generation rollover.
    pub fn new_kernel(pt_root: usize) -> Arc<AddressSpace<A>> {
        Arc::new(AddressSpace {
            pt_root,
            areas: Mutex::new(Vec::new()),
            pt_lock: Mutex::new(()),
            asid: Mutex::new(asid::Asid { value: asid::ASID_KERNEL, generation: asid::current_generation() }),
            is_kernel: true,
            active_cpus: Mutex::new(BTreeSet::new()),
            _arch: PhantomData
        })
    }

    /// The architecture-specific page-table root this address space is rooted at.
    pub fn pt_root(&self) -> usize {
        self.pt_root
    }

    /// Whether this is the kernel's own address space.
    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    fn with_asid<R>(&self, f: impl FnOnce(&mut asid::Asid) -> R) -> R {
        loop {
            if let Ok(mut a) = self.asid.try_lock() {
                return f(&mut a);
            }
        }
    }

    /// If a generation rollover has made this address space's ASID stale, allocates a fresh one.
    /// Exempt for the kernel address space, which is never reassigned.
    fn ensure_asid_fresh(&self) {
        if self.is_kernel {
            return;
        }
        self.with_asid(|a| {
            if asid::is_stale(*a) {
                *a = asid::asid_alloc::<A>();
            }
        });
    }

    /// This address space's current hardware ASID, reassigning it first if it went stale.
    pub fn asid(&self) -> u16 {
        self.ensure_asid_fresh();
        self.with_asid(|a| a.value)
    }

    /// Records that `cpu_index` is now running a thread in this address space, so a future unmap
    /// knows to shoot it down too.
    pub fn mark_active(&self, cpu_index: usize) {
        loop {
            if let Ok(mut cpus) = self.active_cpus.try_lock() {
                cpus.insert(cpu_index);
                return;
            }
        }
    }

    /// The inverse of `mark_active`, called when a CPU switches away from this address space.
    pub fn mark_inactive(&self, cpu_index: usize) {
        loop {
            if let Ok(mut cpus) = self.active_cpus.try_lock() {
                cpus.remove(&cpu_index);
                return;
            }
        }
    }

    fn other_active_cpus(&self) -> Vec<usize> {
        let me = A::cpu_index();
        loop {
            if let Ok(cpus) = self.active_cpus.try_lock() {
                return cpus.iter().copied().filter(|&c| c != me).collect();
            }
        }
    }

    /// Creates a new area `[base, base + size)` with the given flags and backend, failing with
    /// `KernelError::Inval` if it would overlap an existing one (the `∀ area` non-overlap
    /// invariant).
    pub fn area_create(&self, base: usize, size: usize, flags: AreaFlags, backend: Arc<dyn Backend>) -> KernelResult<Arc<Area>> {
        loop {
            if let Ok(mut areas) = self.areas.try_lock() {
                for existing in areas.iter() {
                    if existing.overlaps(base, size) {
                        let _ = Text::AsAreaOverlaps(&base, &size);
                        return Err(KernelError::Inval);
                    }
                }
                let area = Arc::new(Area::new(base, size, flags, backend));
                areas.push(Arc::clone(&area));
                return Ok(area);
            }
        }
    }

    /// Tears an area down: unmaps (and releases, via the backend) every page that had actually
    /// been faulted in, then removes it from the address space's area list.
    pub fn area_destroy(&self, area: &Arc<Area>) {
        loop {
            if let Ok(mut areas) = self.areas.try_lock() {
                areas.retain(|a| !Arc::ptr_eq(a, area));
                break;
            }
        }
        for (va, pfn) in area.used_pages_snapshot() {
            self.teardown_page(area, va, pfn);
        }
    }

    fn find_area(&self, va: usize) -> Option<Arc<Area>> {
        loop {
            if let Ok(areas) = self.areas.try_lock() {
                return areas.iter().find(|a| a.contains(va)).cloned();
            }
        }
    }

    /// The page-fault dispatch algorithm: looks up the area covering `va` (step 1), checks `acc`
    /// against its flags (step 2), then -- holding the page-table lock (step 3) -- asks the
    /// backend for a mapping (step 4), installs it, and records the page as used (step 5).
    pub fn page_fault(&self, va: usize, acc: AccessType) -> KernelResult<()> {
        let va_aligned = va & !(frame::PAGE_SIZE - 1);

        let area = self.find_area(va).ok_or_else(|| {
            let _ = Text::AsFaultUnmapped(&va);
            KernelError::Inval
        })?;
        if !area.permits(acc) {
            let _ = Text::AsFaultProtection(&va);
            return Err(KernelError::Inval);
        }

        loop {
            if let Ok(_pt_guard) = self.pt_lock.try_lock() {
                let mapping = area.backend().page_fault(&area, va_aligned, acc)?;
                unsafe {
                    A::pt_map(self.pt_root, va_aligned, mapping.pfn.0 * frame::PAGE_SIZE, mapping.flags)?;
                }
                area.record_used(va_aligned, mapping.pfn);
                return Ok(());
            }
        }
    }

    fn teardown_page(&self, area: &Area, va_aligned: usize, pfn: frame::Pfn) {
        loop {
            if let Ok(_pt_guard) = self.pt_lock.try_lock() {
                unsafe {
                    A::pt_unmap(self.pt_root, va_aligned);
                }
                break;
            }
        }
        area.backend().release_page(area, va_aligned, pfn);
    }

    /// Explicitly unmaps a single previously-faulted-in page, running a full TLB shootdown
    /// (`tlb_shootdown_start` / own invalidation / `tlb_shootdown_finalize`) against every other
    /// CPU that has this address space active before returning the frame to its backend.
    pub fn unmap_page(&self, area: &Arc<Area>, va: usize) -> KernelResult<()> {
        let va_aligned = va & !(frame::PAGE_SIZE - 1);
        let pfn = area.take_used(va_aligned).ok_or(KernelError::NoEnt)?;

        let asid = self.asid();
        let others = self.other_active_cpus();
        let ticket = tlb::tlb_shootdown_start::<A>(&others, Some(asid), va_aligned, 1);

        loop {
            if let Ok(_pt_guard) = self.pt_lock.try_lock() {
                unsafe {
                    A::pt_unmap(self.pt_root, va_aligned);
                }
                break;
            }
        }
        A::tlb_invalidate(Some(asid), va_aligned);
        tlb::tlb_shootdown_finalize::<A>(ticket);

        area.backend().release_page(area, va_aligned, pfn);
        Ok(())
    }

    /// Changes `area`'s permission flags (`AS_AREA_CHANGE_FLAGS`). Per spec.md §3, this "performs
    /// a full unmap/remap": every page of `area` already faulted in has its page-table entry
    /// rewritten under the new flags, each through the normal TLB-shootdown path, so a downgrade
    /// (e.g. dropping `WRITE`) is enforced on live mappings immediately instead of only on the
    /// next fault. The backing frames themselves are untouched -- this only ever changes
    /// permissions, never contents.
    pub fn area_change_flags(&self, area: &Arc<Area>, new_flags: AreaFlags) {
        area.change_flags(new_flags);
        for (va, pfn) in area.used_pages_snapshot() {
            self.remap_page(area, va, pfn);
        }
    }

    fn remap_page(&self, area: &Area, va_aligned: usize, pfn: frame::Pfn) {
        let asid = self.asid();
        let others = self.other_active_cpus();
        let ticket = tlb::tlb_shootdown_start::<A>(&others, Some(asid), va_aligned, 1);

        loop {
            if let Ok(_pt_guard) = self.pt_lock.try_lock() {
                unsafe {
                    A::pt_unmap(self.pt_root, va_aligned);
                }
                break;
            }
        }
        A::tlb_invalidate(Some(asid), va_aligned);
        tlb::tlb_shootdown_finalize::<A>(ticket);

        let flags = area.flags().to_page_flags();
        loop {
            if let Ok(_pt_guard) = self.pt_lock.try_lock() {
                let _ = unsafe { A::pt_map(self.pt_root, va_aligned, pfn.0 * frame::PAGE_SIZE, flags) };
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arch::{PageFlags, test::TestArch};

    struct SyncIpiArch;

    impl Arch for SyncIpiArch {
        type Ipl = <TestArch as Arch>::Ipl;
        type Context = <TestArch as Arch>::Context;

        fn ipl_disable() -> Self::Ipl { TestArch::ipl_disable() }
        fn ipl_restore(prev: Self::Ipl) { TestArch::ipl_restore(prev) }
        fn wait_for_event() { TestArch::wait_for_event() }
        fn wait_for_interrupt() { TestArch::wait_for_interrupt() }
        fn count_cpus() -> usize { 2 }
        fn cpu_index() -> usize { 0 }
        fn cpu_affinity() -> i64 { TestArch::cpu_affinity() }

        fn context_init(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Self::Context {
            TestArch::context_init(stack_top, entry, arg)
        }

        unsafe fn context_switch(prev: *mut Self::Context, next: *const Self::Context) {
            TestArch::context_switch(prev, next)
        }

        unsafe fn pt_map(pt_root: usize, vaddr: usize, paddr: usize, flags: PageFlags) -> KernelResult<()> {
            TestArch::pt_map(pt_root, vaddr, paddr, flags)
        }

        unsafe fn pt_unmap(pt_root: usize, vaddr: usize) {
            TestArch::pt_unmap(pt_root, vaddr)
        }

        fn tlb_invalidate(asid: Option<u16>, vaddr: usize) {
            TestArch::tlb_invalidate(asid, vaddr)
        }

        fn timer_set_next(ticks: u64) { TestArch::timer_set_next(ticks) }

        fn send_ipi(cpu_index: usize, vector: u8) {
            // This software-only harness has no real second CPU to deliver an interrupt to, so the
            // "IPI" is delivered inline: the shootdown handler runs synchronously, as if the remote
            // CPU had already finished by the time `send_ipi` returns.
            if vector == tlb::SHOOTDOWN_VECTOR {
                tlb::handle_shootdown_ipi::<SyncIpiArch>(cpu_index);
            }
        }
    }

    fn reset() {
        asid::reset();
        tlb::reset_for_test();
        #[cfg(any(test, feature = "std-test"))]
        sim_memory::reset();
    }

    #[test]
    fn demand_paging_zeroes_then_preserves_writes() {
        reset();
        let as_: Arc<AddressSpace<SyncIpiArch>> = AddressSpace::new(0x1000);
        let area = as_.area_create(
            0x4000_0000, 4 * frame::PAGE_SIZE,
            AreaFlags::READ | AreaFlags::WRITE | AreaFlags::USER,
            Arc::new(Anonymous)
        ).unwrap();

        let va = 0x4000_0abc;
        as_.page_fault(va, AccessType::Read).unwrap();
        let va_aligned = va & !(frame::PAGE_SIZE - 1);
        let pfn = area.take_used(va_aligned).unwrap();
        area.record_used(va_aligned, pfn); // put it back; `take_used` was just to peek
        assert_eq!(sim_memory::read_byte(pfn, va - va_aligned), 0);

        sim_memory::write_byte(pfn, va - va_aligned, 0xAB);
        assert_eq!(sim_memory::read_byte(pfn, va - va_aligned), 0xAB);
    }

    #[test]
    fn page_fault_outside_every_area_is_rejected() {
        reset();
        let as_: Arc<AddressSpace<SyncIpiArch>> = AddressSpace::new(0x1000);
        assert_eq!(as_.page_fault(0x9999_0000, AccessType::Read), Err(KernelError::Inval));
    }

    #[test]
    fn page_fault_violating_area_flags_is_rejected() {
        reset();
        let as_: Arc<AddressSpace<SyncIpiArch>> = AddressSpace::new(0x1000);
        as_.area_create(0x5000_0000, frame::PAGE_SIZE, AreaFlags::READ, Arc::new(Anonymous)).unwrap();
        assert_eq!(as_.page_fault(0x5000_0000, AccessType::Write), Err(KernelError::Inval));
    }

    #[test]
    fn tlb_shootdown_clears_every_active_cpus_entry() {
        reset();
        let as_: Arc<AddressSpace<SyncIpiArch>> = AddressSpace::new(0x2000);
        let area = as_.area_create(
            0x6000_0000, frame::PAGE_SIZE,
            AreaFlags::READ | AreaFlags::WRITE,
            Arc::new(Anonymous)
        ).unwrap();
        as_.page_fault(0x6000_0000, AccessType::Read).unwrap();
        as_.mark_active(1);

        as_.unmap_page(&area, 0x6000_0000).unwrap();

        let log = arch::test::TLB_LOG.lock();
        assert!(log.iter().any(|&(asid, vaddr)| asid == Some(as_.asid()) && vaddr == 0x6000_0000));
        assert!(!area.is_used(0x6000_0000));
    }

    #[test]
    fn asid_overflow_reassigns_every_live_address_space_but_the_kernels() {
        reset();
        let kernel_as: Arc<AddressSpace<SyncIpiArch>> = AddressSpace::new_kernel(0);
        let kernel_asid = kernel_as.asid();

        let mut spaces = Vec::new();
        for _ in 0 .. (ASID_OVERFLOW - ASID_START) {
            spaces.push(AddressSpace::<SyncIpiArch>::new(0x1000));
        }
        let first_asids: Vec<u16> = spaces.iter().map(|s| s.asid()).collect();

        arch::test::TLB_LOG.lock().clear();
        // One more allocation than the generation can hold: this is the trigger.
        let overflowing = AddressSpace::<SyncIpiArch>::new(0x1000);
        let _ = overflowing.asid();

        assert_eq!(kernel_as.asid(), kernel_asid, "the kernel as must keep ASID_KERNEL across a rollover");
        for (space, &old_asid) in spaces.iter().zip(first_asids.iter()) {
            assert_ne!(space.asid(), old_asid, "every previously live as must be reassigned after overflow");
        }
        assert!(
            arch::test::TLB_LOG.lock().iter().any(|&(asid, _)| asid.is_none()),
            "the rollover that triggered reassignment must issue a system-wide tlb_invalidate(None, _)"
        );
    }

    #[test]
    fn area_change_flags_revokes_write_from_an_already_faulted_page() {
        reset();
        let as_: Arc<AddressSpace<SyncIpiArch>> = AddressSpace::new(0x3000);
        let area = as_.area_create(
            0x7000_0000, frame::PAGE_SIZE,
            AreaFlags::READ | AreaFlags::WRITE,
            Arc::new(Anonymous)
        ).unwrap();
        as_.page_fault(0x7000_0000, AccessType::Write).unwrap();

        arch::test::TLB_LOG.lock().clear();
        arch::test::PAGE_TABLE_LOG.lock().clear();
        as_.area_change_flags(&area, AreaFlags::READ);

        assert_eq!(area.flags(), AreaFlags::READ, "the new flags must be recorded");
        assert!(
            arch::test::TLB_LOG.lock().iter().any(|&(asid, vaddr)| asid == Some(as_.asid()) && vaddr == 0x7000_0000),
            "changing flags on a live mapping must run it through the TLB shootdown path"
        );
        let remap = arch::test::PAGE_TABLE_LOG.lock().iter()
            .filter(|&&(_, vaddr, _, _)| vaddr == 0x7000_0000)
            .last()
            .copied();
        match remap {
            Some((_, _, _, flags)) => assert!(
                !flags.contains(PageFlags::WRITE),
                "the remapped entry must no longer carry WRITE after the downgrade"
            ),
            None => panic!("area_change_flags must remap the page, not just leave it unmapped")
        }

        // The downgrade must be enforced immediately, not just on the next fault.
        assert_eq!(as_.page_fault(0x7000_0000, AccessType::Write), Err(KernelError::Inval));
    }
}
