//! Nested (EPT/NPT-style) paging: the guest's own page tables are left
//! alone and walked by hardware; the VMM only maintains a single
//! second-level table translating guest-physical to host-physical
//! addresses. A fault here always means the GPA itself is not yet backed —
//! there is no guest page-table walk to perform (§4.3: "one flat gpa -> hpa
//! table shared by all cores").

use log::trace;

use super::{AccessKind, FaultContext, FaultResolution, PagingEngine, PagingError, PageSize};
use crate::mmap::Translation;

/// Tracks which guest-physical pages currently have a second-level mapping
/// installed, purely so `invalidate_range`/`invlpg` have something to drop.
/// A real EPT backend keeps this as actual page-table memory; since the
/// host's own `Mmap` is already the authoritative gpa -> hpa map here, this
/// engine's job reduces to servicing faults against it and remembering
/// which ranges have been "walked" so invalidation has an effect on the
/// next access.
#[derive(Default)]
pub struct NestedPaging {
    installed: std::collections::BTreeSet<u64>,
    active: bool,
}

impl NestedPaging {
    pub fn new() -> Self {
        Self {
            installed: std::collections::BTreeSet::new(),
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mapped_page_count(&self) -> usize {
        self.installed.len()
    }

    fn mark_installed(&mut self, page_base: u64) {
        self.installed.insert(page_base);
    }
}

impl PagingEngine for NestedPaging {
    /// `fault_addr` here is the guest-physical address the hardware's EPT
    /// violation reported directly; there is no second address space to
    /// translate through first.
    fn handle_fault(
        &mut self,
        ctx: &mut FaultContext,
        fault_addr: u64,
        access: AccessKind,
        _guest_error_code: u32,
    ) -> Result<FaultResolution, PagingError> {
        let translation = ctx.mmap.translate_gpa_to_hpa(fault_addr);
        match translation {
            Translation::Hpa(_) => {
                // Already backed; hardware must have faulted on a
                // permission bit the region itself doesn't grant.
                let region = ctx
                    .mmap
                    .lookup(fault_addr)
                    .ok_or(PagingError::GuestWalkRead(fault_addr))?;
                let permitted = match access {
                    AccessKind::Read => {
                        region.flags.contains(crate::mmap::RegionFlags::READABLE)
                    }
                    AccessKind::Write => {
                        region.flags.contains(crate::mmap::RegionFlags::WRITABLE)
                            && !region.flags.contains(crate::mmap::RegionFlags::COW)
                    }
                    AccessKind::Execute => {
                        region.flags.contains(crate::mmap::RegionFlags::EXECUTABLE)
                    }
                };
                let page_base = fault_addr & !0xFFF;
                if permitted {
                    self.mark_installed(page_base);
                    Ok(FaultResolution::Resolved)
                } else {
                    // Unlike shadow paging there is no guest-owned #PF to
                    // inject: a permission EPT violation on a host-owned
                    // mapping the guest cannot see is a VMM-internal
                    // condition, and the only sound action is to fail the
                    // VM rather than fabricate a guest fault for a fault
                    // the guest's own tables never produced.
                    Ok(FaultResolution::Fail)
                }
            }
            Translation::NeedsAlloc => {
                let page_base = fault_addr & !0xFFF;
                match (ctx.alloc)(page_base, PageSize::Size4K.bytes()) {
                    Some(hpa) => {
                        let region = ctx
                            .mmap
                            .lookup_mut(page_base)
                            .ok_or(PagingError::GuestWalkRead(page_base))?;
                        region.backing = crate::mmap::HostBacking::Direct(hpa);
                        region.kind = crate::mmap::RegionKind::Ram;
                        region.flags.insert(
                            crate::mmap::RegionFlags::PRESENT
                                | crate::mmap::RegionFlags::READABLE
                                | crate::mmap::RegionFlags::WRITABLE
                                | crate::mmap::RegionFlags::EXECUTABLE
                                | crate::mmap::RegionFlags::ALLOCATED,
                        );
                        self.mark_installed(page_base);
                        trace!("nested: on-demand backed gpa={:#x} -> hpa={:#x}", page_base, hpa);
                        Ok(FaultResolution::Resolved)
                    }
                    None => Ok(FaultResolution::Fail),
                }
            }
            Translation::Hooked => Ok(FaultResolution::Fail),
            Translation::Unmapped => {
                let page_base = fault_addr & !0xFFF;
                let region = ctx.mmap.lookup_mut(page_base);
                let resume = match region.and_then(|r| r.unhandled_fault_hook.as_mut()) {
                    Some(hook) => hook(fault_addr),
                    None => false,
                };
                if resume {
                    self.mark_installed(page_base);
                    Ok(FaultResolution::Resolved)
                } else {
                    Ok(FaultResolution::Fail)
                }
            }
        }
    }

    fn invalidate_range(&mut self, start: u64, end: u64) -> (u64, u64) {
        let aligned_start = start & !0xFFF;
        let aligned_end = (end + 0xFFF) & !0xFFF;
        let to_remove: Vec<u64> = self
            .installed
            .range(aligned_start..aligned_end)
            .copied()
            .collect();
        for page in to_remove {
            self.installed.remove(&page);
        }
        (aligned_start, aligned_end)
    }

    fn on_cr3_reload(&mut self, _new_guest_cr3: u64) {
        // CR3 is a guest-virtual concern; the second-level table is
        // indifferent to it.
    }

    fn activate(&mut self) {
        self.active = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::{Mmap, Region};
    use crate::paging::FlatGuestMemory;

    fn ctx_with<'a>(mmap: &'a mut Mmap, mem: &'a mut FlatGuestMemory, alloc: &'a mut dyn FnMut(u64, u64) -> Option<u64>) -> FaultContext<'a> {
        FaultContext { mmap, mem, alloc }
    }

    #[test]
    fn backed_region_resolves_immediately() {
        let mut mmap = Mmap::new();
        mmap.add(Region::ram(0, 0x1000, 0x9000)).unwrap();
        let mut mem = FlatGuestMemory::new(0x1000);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { None };
        let mut ctx = ctx_with(&mut mmap, &mut mem, &mut alloc);

        let mut nested = NestedPaging::new();
        nested.activate();
        let resolution = nested
            .handle_fault(&mut ctx, 0x100, AccessKind::Read, 0)
            .unwrap();
        assert_eq!(resolution, FaultResolution::Resolved);
        assert_eq!(nested.mapped_page_count(), 1);
    }

    #[test]
    fn unallocated_region_triggers_host_allocator() {
        let mut mmap = Mmap::new();
        mmap.add(Region::unallocated(0, 0x1000)).unwrap();
        let mut mem = FlatGuestMemory::new(0x1000);
        let mut calls = Vec::new();
        let mut alloc = |gpa: u64, size: u64| -> Option<u64> {
            calls.push((gpa, size));
            Some(0xA000)
        };
        let mut nested = NestedPaging::new();
        {
            let mut ctx = ctx_with(&mut mmap, &mut mem, &mut alloc);
            let resolution = nested
                .handle_fault(&mut ctx, 0x10, AccessKind::Write, 0)
                .unwrap();
            assert_eq!(resolution, FaultResolution::Resolved);
        }
        assert_eq!(calls, vec![(0, 0x1000)]);
        match mmap.translate_gpa_to_hpa(0x10) {
            Translation::Hpa(hpa) => assert_eq!(hpa, 0xA010),
            other => panic!("expected the region to now be backed, got {other:?}"),
        }
    }

    #[test]
    fn allocator_failure_fails_the_vm() {
        let mut mmap = Mmap::new();
        mmap.add(Region::unallocated(0, 0x1000)).unwrap();
        let mut mem = FlatGuestMemory::new(0x1000);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { None };
        let mut ctx = ctx_with(&mut mmap, &mut mem, &mut alloc);
        let mut nested = NestedPaging::new();
        let resolution = nested
            .handle_fault(&mut ctx, 0x10, AccessKind::Write, 0)
            .unwrap();
        assert_eq!(resolution, FaultResolution::Fail);
    }

    #[test]
    fn on_demand_backed_page_survives_invalidate_and_reread() {
        let mut mmap = Mmap::new();
        mmap.add(Region::unallocated(0, 0x1000)).unwrap();
        let mut mem = FlatGuestMemory::new(0x1000);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { Some(0xB000) };
        let mut nested = NestedPaging::new();
        {
            let mut ctx = ctx_with(&mut mmap, &mut mem, &mut alloc);
            let resolution = nested
                .handle_fault(&mut ctx, 0x10, AccessKind::Write, 0)
                .unwrap();
            assert_eq!(resolution, FaultResolution::Resolved);
        }
        nested.invalidate_range(0, 0x1000);
        // The page is still backed in `Mmap` (invalidation only drops the
        // engine's own bookkeeping); a later read must not fail for want of
        // the READABLE permission bit.
        let mut ctx = ctx_with(&mut mmap, &mut mem, &mut alloc);
        let resolution = nested
            .handle_fault(&mut ctx, 0x10, AccessKind::Read, 0)
            .unwrap();
        assert_eq!(resolution, FaultResolution::Resolved);
    }

    #[test]
    fn invalidate_range_forgets_installed_pages() {
        let mut mmap = Mmap::new();
        mmap.add(Region::ram(0, 0x3000, 0)).unwrap();
        let mut mem = FlatGuestMemory::new(0x3000);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { None };
        let mut nested = NestedPaging::new();
        {
            let mut ctx = ctx_with(&mut mmap, &mut mem, &mut alloc);
            nested
                .handle_fault(&mut ctx, 0x1500, AccessKind::Read, 0)
                .unwrap();
        }
        assert_eq!(nested.mapped_page_count(), 1);
        nested.invalidate_range(0x1000, 0x2000);
        assert_eq!(nested.mapped_page_count(), 0);
    }
}


