//! Shadow paging: the VMM mirrors the guest's own page-table walk into a
//! host-side table it owns, so the host's translation of a guest-virtual
//! address is directly `gva -> hpa` once a shadow PTE is installed.
//!
//! This implementation targets the long-mode (4-level, 9/9/9/9/12) format,
//! which is what Design Notes §9 asks for ("a sparse multi-level radix tree
//! indexing by virtual or physical address with 9/9/9/12 bit splits"). The
//! 32-bit and PAE walk formats are a recorded open question (see
//! DESIGN.md): this version only shadows long-mode guest paging.

use log::trace;

use super::arena::{NodeId, PageTableArena};
use super::{
    pf_bits, AccessKind, FaultContext, FaultResolution, GuestBytes, PagingEngine, PagingError,
};
use crate::mmap::Translation;

mod pte {
    pub const PRESENT: u64 = 1 << 0;
    pub const WRITABLE: u64 = 1 << 1;
    pub const USER: u64 = 1 << 2;
    pub const PAGE_SIZE: u64 = 1 << 7;
    pub const NX: u64 = 1 << 63;
    pub const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;

    pub fn frame(entry: u64) -> u64 {
        entry & FRAME_MASK
    }
}

const PAGE_SHIFT: u32 = 12;
const LEVEL_BITS: u32 = 9;

fn index(gva: u64, level: u32) -> usize {
    ((gva >> (PAGE_SHIFT + LEVEL_BITS * level)) & 0x1FF) as usize
}

/// The error-code bits a synthesized #PF should carry for the access kind
/// that triggered it (the P bit is added separately by the caller).
fn access_error_bits(access: AccessKind) -> u32 {
    match access {
        AccessKind::Write => pf_bits::WRITE,
        AccessKind::Execute => pf_bits::INSTRUCTION_FETCH,
        AccessKind::Read => 0,
    }
}

/// Classifies a guest page-table-entry permission check against the
/// requested access.
fn guest_permits(entry: u64, access: AccessKind) -> bool {
    if entry & pte::PRESENT == 0 {
        return false;
    }
    match access {
        AccessKind::Write => entry & pte::WRITABLE != 0,
        AccessKind::Execute => entry & pte::NX == 0,
        AccessKind::Read => true,
    }
}

/// One VCPU's shadow-paging state. Guest CR3 and the shadow root are always
/// either both set or both `None` (Data Model §3 invariant).
pub struct ShadowPaging {
    arena: PageTableArena,
    root: Option<(u64 /* guest_cr3 */, NodeId /* shadow PML4 */)>,
}

impl Default for ShadowPaging {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowPaging {
    pub fn new() -> Self {
        Self {
            arena: PageTableArena::new(),
            root: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.root.is_some()
    }

    pub fn node_count(&self) -> usize {
        self.arena.node_count()
    }

    fn ensure_root(&mut self, guest_cr3: u64) -> NodeId {
        match self.root {
            Some((cr3, node)) if cr3 == guest_cr3 => node,
            _ => {
                self.arena.reset();
                let node = self.arena.alloc();
                self.root = Some((guest_cr3, node));
                node
            }
        }
    }

    /// Walk the guest's own page tables for `gva`. Returns the final guest
    /// PTE-equivalent entry (permission bits + frame) and the page size it
    /// resolved to, or `None` if the guest's own tables say not-present
    /// (the caller should inject #PF).
    fn walk_guest(
        &self,
        ctx: &FaultContext,
        guest_cr3: u64,
        gva: u64,
    ) -> Result<Option<(u64, super::PageSize)>, PagingError> {
        let mut table_gpa = guest_cr3 & pte::FRAME_MASK;
        for level in (1..=3u32).rev() {
            let entry_gpa = table_gpa + (index(gva, level) as u64) * 8;
            let hpa = match ctx.mmap.translate_gpa_to_hpa(entry_gpa) {
                Translation::Hpa(hpa) => hpa,
                _ => return Err(PagingError::GuestWalkRead(entry_gpa)),
            };
            let entry = ctx.mem.read_u64(hpa);
            if entry & pte::PRESENT == 0 {
                return Ok(None);
            }
            let large_page_allowed = level == 1 || level == 2;
            if large_page_allowed && entry & pte::PAGE_SIZE != 0 {
                let page_size = if level == 2 {
                    super::PageSize::Size1G
                } else {
                    super::PageSize::Size2M
                };
                return Ok(Some((entry, page_size)));
            }
            table_gpa = pte::frame(entry);
        }
        let entry_gpa = table_gpa + (index(gva, 0) as u64) * 8;
        let hpa = match ctx.mmap.translate_gpa_to_hpa(entry_gpa) {
            Translation::Hpa(hpa) => hpa,
            _ => return Err(PagingError::GuestWalkRead(entry_gpa)),
        };
        let entry = ctx.mem.read_u64(hpa);
        if entry & pte::PRESENT == 0 {
            Ok(None)
        } else {
            Ok(Some((entry, super::PageSize::Size4K)))
        }
    }

    /// Install (or update) the shadow entry chain for `gva -> host_frame`,
    /// with permission bits derived from both the guest PTE and the owning
    /// region's flags.
    fn install(
        &mut self,
        root: NodeId,
        gva: u64,
        host_frame: u64,
        guest_entry: u64,
        region_writable: bool,
        region_executable: bool,
        page_size: super::PageSize,
    ) {
        let leaf_level = match page_size {
            super::PageSize::Size4K => 0,
            super::PageSize::Size2M => 1,
            super::PageSize::Size1G => 2,
        };
        let mut node = root;
        for level in (leaf_level + 1..=3).rev() {
            let idx = index(gva, level);
            let entry = self.arena.get(node).entries[idx];
            let child = if entry & pte::PRESENT != 0 {
                NodeId((pte::frame(entry) >> PAGE_SHIFT) as u32)
            } else {
                let child = self.arena.alloc();
                self.arena.get_mut(node).entries[idx] =
                    ((child.0 as u64) << PAGE_SHIFT) | pte::PRESENT | pte::WRITABLE | pte::USER;
                child
            };
            node = child;
        }

        let writable = region_writable && (guest_entry & pte::WRITABLE != 0);
        let user = guest_entry & pte::USER != 0;
        let mut flags = pte::PRESENT;
        if writable {
            flags |= pte::WRITABLE;
        }
        if user {
            flags |= pte::USER;
        }
        if !region_executable {
            flags |= pte::NX;
        }
        if leaf_level > 0 {
            flags |= pte::PAGE_SIZE;
        }
        let idx = index(gva, leaf_level);
        self.arena.get_mut(node).entries[idx] = (host_frame & pte::FRAME_MASK) | flags;
        trace!(
            "shadow: installed gva={:#x} -> hpa={:#x} size={:?} w={} x={}",
            gva,
            host_frame,
            page_size,
            writable,
            region_executable
        );
    }

    /// Look up whether a shadow entry for `gva` is already valid (used by
    /// tests to assert "no second exit for the same address").
    pub fn shadow_entry(&self, gva: u64) -> Option<u64> {
        let (_, root) = self.root?;
        let mut node = root;
        for level in (1..=3u32).rev() {
            let entry = self.arena.get(node).entries[index(gva, level)];
            if entry & pte::PRESENT == 0 {
                return None;
            }
            if entry & pte::PAGE_SIZE != 0 {
                return Some(entry);
            }
            node = NodeId((pte::frame(entry) >> PAGE_SHIFT) as u32);
        }
        let entry = self.arena.get(node).entries[index(gva, 0)];
        (entry & pte::PRESENT != 0).then_some(entry)
    }
}

impl PagingEngine for ShadowPaging {
    fn handle_fault(
        &mut self,
        ctx: &mut FaultContext,
        fault_addr: u64,
        access: AccessKind,
        _guest_error_code: u32,
    ) -> Result<FaultResolution, PagingError> {
        let guest_cr3 = match self.root {
            Some((cr3, _)) => cr3,
            None => return Err(PagingError::Inactive),
        };

        let walked = self.walk_guest(ctx, guest_cr3, fault_addr)?;
        let (guest_entry, page_size) = match walked {
            None => {
                return Ok(FaultResolution::InjectPageFault {
                    address: fault_addr,
                    error_code: access_error_bits(access),
                })
            }
            Some(v) => v,
        };

        if !guest_permits(guest_entry, access) {
            return Ok(FaultResolution::InjectPageFault {
                address: fault_addr,
                error_code: pf_bits::PRESENT | access_error_bits(access),
            });
        }

        let page_mask = page_size.bytes() - 1;
        let target_gpa = pte::frame(guest_entry) | (fault_addr & page_mask & pte::FRAME_MASK);
        let page_base_gpa = target_gpa & !page_mask;

        let translation = ctx.mmap.translate_gpa_to_hpa(page_base_gpa);
        let (host_base, region_writable, region_executable) = match translation {
            Translation::Hpa(hpa) => {
                let region = ctx
                    .mmap
                    .lookup(page_base_gpa)
                    .ok_or(PagingError::GuestWalkRead(page_base_gpa))?;
                let w = region.flags.contains(crate::mmap::RegionFlags::WRITABLE)
                    && !region.flags.contains(crate::mmap::RegionFlags::COW);
                let x = region.flags.contains(crate::mmap::RegionFlags::EXECUTABLE);
                (hpa, w, x)
            }
            Translation::NeedsAlloc => match (ctx.alloc)(page_base_gpa, page_size.bytes()) {
                Some(hpa) => {
                    let region = ctx
                        .mmap
                        .lookup_mut(page_base_gpa)
                        .ok_or(PagingError::GuestWalkRead(page_base_gpa))?;
                    region.backing = crate::mmap::HostBacking::Direct(hpa);
                    region.kind = crate::mmap::RegionKind::Ram;
                    region.flags.insert(
                        crate::mmap::RegionFlags::PRESENT
                            | crate::mmap::RegionFlags::READABLE
                            | crate::mmap::RegionFlags::WRITABLE
                            | crate::mmap::RegionFlags::EXECUTABLE
                            | crate::mmap::RegionFlags::ALLOCATED,
                    );
                    (hpa, true, true)
                }
                None => return Ok(FaultResolution::Fail),
            },
            Translation::Hooked => {
                // Hooked regions never get shadow PTEs; every access must trap.
                return Ok(FaultResolution::Fail);
            }
            Translation::Unmapped => {
                let region = ctx.mmap.lookup_mut(page_base_gpa);
                let resume = match region.and_then(|r| r.unhandled_fault_hook.as_mut()) {
                    Some(hook) => hook(page_base_gpa),
                    None => false,
                };
                return Ok(if resume {
                    FaultResolution::Resolved
                } else {
                    FaultResolution::Fail
                });
            }
        };

        let root = self.ensure_root(guest_cr3);
        self.install(
            root,
            fault_addr & !page_mask,
            host_base,
            guest_entry,
            region_writable,
            region_executable,
            page_size,
        );

        Ok(FaultResolution::Resolved)
    }

    fn invalidate_range(&mut self, start: u64, end: u64) -> (u64, u64) {
        // A single shadow PTE may cover up to a 1 GiB leaf; conservatively
        // report the containing 1 GiB-aligned range as affected.
        let aligned_start = start & !(0x4000_0000 - 1);
        let aligned_end = (end + 0x4000_0000 - 1) & !(0x4000_0000 - 1);
        if let Some((_, root)) = self.root {
            let mut gva = aligned_start;
            while gva < aligned_end {
                self.clear_entry(root, gva);
                gva += 0x1000;
            }
        }
        (aligned_start, aligned_end)
    }

    fn invlpg(&mut self, addr: u64) {
        if let Some((_, root)) = self.root {
            self.clear_entry(root, addr);
        }
    }

    fn on_cr3_reload(&mut self, new_guest_cr3: u64) {
        if self.root.map(|(cr3, _)| cr3) != Some(new_guest_cr3) {
            self.arena.reset();
            self.root = None;
            let node = self.arena.alloc();
            self.root = Some((new_guest_cr3, node));
        }
    }

    fn activate(&mut self) {}
}

impl ShadowPaging {
    fn clear_entry(&mut self, root: NodeId, gva: u64) {
        let mut node = root;
        for level in (1..=3u32).rev() {
            let entry = self.arena.get(node).entries[index(gva, level)];
            if entry & pte::PRESENT == 0 {
                return;
            }
            if entry & pte::PAGE_SIZE != 0 {
                self.arena.get_mut(node).entries[index(gva, level)] = 0;
                return;
            }
            node = NodeId((pte::frame(entry) >> PAGE_SHIFT) as u32);
        }
        self.arena.get_mut(node).entries[index(gva, 0)] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::{Mmap, Region};
    use crate::paging::FlatGuestMemory;

    fn write_pte(mem: &mut FlatGuestMemory, table_hpa: u64, idx: usize, value: u64) {
        let addr = table_hpa + (idx as u64) * 8;
        mem.write(addr, &value.to_le_bytes());
    }

    /// Build a minimal 4-level guest page table mapping a single GVA to a
    /// single GPA, entirely within a flat "physical memory" buffer that also
    /// serves as the Mmap's RAM region.
    struct Fixture {
        mem: FlatGuestMemory,
        mmap: Mmap,
        cr3: u64,
    }

    fn build_fixture(gva: u64, gpa: u64, writable: bool) -> Fixture {
        let mut mem = FlatGuestMemory::new(0x0010_0000);
        let mut mmap = Mmap::new();
        mmap.add(Region::ram(0, 0x0010_0000, 0)).unwrap();

        let pml4 = 0x1000u64;
        let pdpt = 0x2000u64;
        let pd = 0x3000u64;
        let pt = 0x4000u64;
        let mut flags = pte::PRESENT | pte::USER;
        if writable {
            flags |= pte::WRITABLE;
        }

        write_pte(&mut mem, pml4, index(gva, 3), pdpt | flags);
        write_pte(&mut mem, pdpt, index(gva, 2), pd | flags);
        write_pte(&mut mem, pd, index(gva, 1), pt | flags);
        write_pte(&mut mem, pt, index(gva, 0), (gpa & pte::FRAME_MASK) | flags);

        Fixture {
            mem,
            mmap,
            cr3: pml4,
        }
    }

    #[test]
    fn resolves_a_writable_fault_and_writes_through() {
        let gva = 0x8000u64;
        let gpa = 0x1_2000u64;
        let mut fx = build_fixture(gva, gpa, true);
        let mut shadow = ShadowPaging::new();
        shadow.on_cr3_reload(fx.cr3);

        let mut alloc = |_gpa: u64, _size: u64| -> Option<u64> { None };
        let mut ctx = FaultContext {
            mmap: &mut fx.mmap,
            mem: &mut fx.mem,
            alloc: &mut alloc,
        };

        let resolution = shadow
            .handle_fault(&mut ctx, gva, AccessKind::Write, 0b010 /* write, not-present=0 */)
            .unwrap();
        assert_eq!(resolution, FaultResolution::Resolved);

        // The installed shadow entry must point at the same HPA computed by Mmap.
        let entry = shadow.shadow_entry(gva).unwrap();
        assert_eq!(pte::frame(entry), gpa & pte::FRAME_MASK);

        // Simulate the guest write landing at the resolved HPA.
        fx.mem.write(gpa, &[0x41]);
        let mut buf = [0u8; 1];
        fx.mem.read(gpa, &mut buf);
        assert_eq!(buf[0], 0x41);
    }

    #[test]
    fn second_access_hits_existing_shadow_entry_without_rewalk() {
        let gva = 0x9000u64;
        let gpa = 0x2_0000u64;
        let mut fx = build_fixture(gva, gpa, true);
        let mut shadow = ShadowPaging::new();
        shadow.on_cr3_reload(fx.cr3);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { None };
        let mut ctx = FaultContext {
            mmap: &mut fx.mmap,
            mem: &mut fx.mem,
            alloc: &mut alloc,
        };
        shadow
            .handle_fault(&mut ctx, gva, AccessKind::Write, 0)
            .unwrap();
        assert!(shadow.shadow_entry(gva).is_some());
        // A real dispatcher would not call handle_fault again for gva while
        // the shadow entry is valid; invlpg/cr3-reload are the only things
        // that remove it.
        shadow.invlpg(gva);
        assert!(shadow.shadow_entry(gva).is_none());
    }

    #[test]
    fn read_only_guest_pte_yields_read_only_shadow_entry() {
        let gva = 0xa000u64;
        let gpa = 0x3_0000u64;
        let mut fx = build_fixture(gva, gpa, false);
        let mut shadow = ShadowPaging::new();
        shadow.on_cr3_reload(fx.cr3);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { None };
        let mut ctx = FaultContext {
            mmap: &mut fx.mmap,
            mem: &mut fx.mem,
            alloc: &mut alloc,
        };
        let resolution = shadow
            .handle_fault(&mut ctx, gva, AccessKind::Read, 0)
            .unwrap();
        assert_eq!(resolution, FaultResolution::Resolved);
        let entry = shadow.shadow_entry(gva).unwrap();
        assert_eq!(
            entry & pte::WRITABLE,
            0,
            "guest PTE denies write => RO shadow PTE"
        );
    }

    #[test]
    fn write_to_guest_read_only_page_is_injected_as_a_page_fault() {
        let gva = 0xb000u64;
        let gpa = 0x4_0000u64;
        let mut fx = build_fixture(gva, gpa, false);
        let mut shadow = ShadowPaging::new();
        shadow.on_cr3_reload(fx.cr3);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { None };
        let mut ctx = FaultContext {
            mmap: &mut fx.mmap,
            mem: &mut fx.mem,
            alloc: &mut alloc,
        };
        let resolution = shadow
            .handle_fault(&mut ctx, gva, AccessKind::Write, 0)
            .unwrap();
        match resolution {
            FaultResolution::InjectPageFault { address, error_code } => {
                assert_eq!(address, gva);
                assert_ne!(error_code & pf_bits::WRITE, 0);
            }
            other => panic!("expected an injected page fault, got {other:?}"),
        }
    }

    #[test]
    fn on_demand_backed_page_keeps_write_permission_after_reinstall() {
        let gva = 0xc000u64;
        let gpa = 0x10_0000u64;
        let mut mem = FlatGuestMemory::new(0x11_0000);
        let mut mmap = Mmap::new();
        mmap.add(Region::ram(0, 0x10_0000, 0)).unwrap();
        mmap.add(Region::unallocated(0x10_0000, 0x11_0000)).unwrap();

        let pml4 = 0x1000u64;
        let pdpt = 0x2000u64;
        let pd = 0x3000u64;
        let pt = 0x4000u64;
        let flags = pte::PRESENT | pte::USER | pte::WRITABLE;
        write_pte(&mut mem, pml4, index(gva, 3), pdpt | flags);
        write_pte(&mut mem, pdpt, index(gva, 2), pd | flags);
        write_pte(&mut mem, pd, index(gva, 1), pt | flags);
        write_pte(&mut mem, pt, index(gva, 0), (gpa & pte::FRAME_MASK) | flags);

        let mut shadow = ShadowPaging::new();
        shadow.on_cr3_reload(pml4);
        let mut alloc = |_: u64, _: u64| -> Option<u64> { Some(0xB_0000) };
        {
            let mut ctx = FaultContext {
                mmap: &mut mmap,
                mem: &mut mem,
                alloc: &mut alloc,
            };
            let resolution = shadow
                .handle_fault(&mut ctx, gva, AccessKind::Write, 0)
                .unwrap();
            assert_eq!(resolution, FaultResolution::Resolved);
        }
        let first_entry = shadow.shadow_entry(gva).unwrap();
        assert_ne!(first_entry & pte::WRITABLE, 0);

        // Drop the shadow entry (e.g. an invlpg) without touching the
        // now-backed Mmap region; the next fault must re-derive the same
        // write permission from the region's flags, not silently downgrade
        // to read-only for want of the WRITABLE bit.
        shadow.invlpg(gva);
        {
            let mut ctx = FaultContext {
                mmap: &mut mmap,
                mem: &mut mem,
                alloc: &mut alloc,
            };
            let resolution = shadow
                .handle_fault(&mut ctx, gva, AccessKind::Write, 0)
                .unwrap();
            assert_eq!(resolution, FaultResolution::Resolved);
        }
        let second_entry = shadow.shadow_entry(gva).unwrap();
        assert_ne!(second_entry & pte::WRITABLE, 0);
    }
}


