//! Guest-physical address space map.
//!
//! `Mmap` is the authoritative description of guest-physical memory: an
//! ordered set of disjoint regions, each tagged RAM / unallocated /
//! memory-mapped / remote / hooked, searchable in O(log n). A `BTreeMap`
//! keyed on `guest_start` stands in for the red-black tree spec.md §4.2
//! describes — same asymptotics, same ordered-traversal guarantees, and the
//! idiomatic choice in this ecosystem (the same structure Mythril's VM memory
//! map uses for guest-physical regions).

use std::collections::BTreeMap;
use std::ops::Range;

use bitflags::bitflags;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmapError {
    #[error("region [{0:#x}, {1:#x}) overlaps an existing region")]
    Overlap(u64, u64),
    #[error("no region contains address {0:#x}")]
    NotFound(u64),
    #[error("region [{0:#x}, {1:#x}) is not backed by host memory")]
    Unmapped(u64, u64),
    #[error("address {0:#x} needs on-demand allocation")]
    NeedsAlloc(u64),
    #[error("address {0:#x} is hooked and has no direct host backing")]
    Hooked(u64),
}

/// What kind of guest-physical region this is, from the guest's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Ram,
    Unallocated,
    MemoryMapped,
    Remote,
    Hooked,
}

bitflags! {
    /// Per-region permission/behavior flags (Data Model §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegionFlags: u32 {
        const PRESENT    = 1 << 0;
        const READABLE   = 1 << 1;
        const WRITABLE   = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const COW        = 1 << 4;
        const HOOKED     = 1 << 5;
        const ALLOCATED  = 1 << 6;
        const PINNED     = 1 << 7;
    }
}

/// Optional per-region callbacks (Data Model §3: "optional read/write
/// callbacks, optional unhandled-fault callback").
pub type ReadHook = Box<dyn FnMut(u64, &mut [u8]) + Send>;
pub type WriteHook = Box<dyn FnMut(u64, &[u8]) + Send>;
/// Returns `true` to resume the guest, `false` to fail the VM.
pub type UnhandledFaultHook = Box<dyn FnMut(u64) -> bool + Send>;

/// Where (if anywhere) a region's bytes live on the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostBacking {
    /// `host_physical_base`: `translate` returns `host_physical_base + (gpa -
    /// guest_start)`.
    Direct(u64),
    /// No direct backing: reads/writes must go through hooks, or the region
    /// is purely descriptive (e.g. `Unallocated`, awaiting on-demand alloc).
    None,
}

/// A single guest-physical memory region.
pub struct Region {
    pub guest_start: u64,
    pub guest_end: u64,
    pub kind: RegionKind,
    pub backing: HostBacking,
    pub flags: RegionFlags,
    pub read_hook: Option<ReadHook>,
    pub write_hook: Option<WriteHook>,
    pub unhandled_fault_hook: Option<UnhandledFaultHook>,
}

impl Region {
    pub fn ram(guest_start: u64, guest_end: u64, host_physical_base: u64) -> Self {
        Self {
            guest_start,
            guest_end,
            kind: RegionKind::Ram,
            backing: HostBacking::Direct(host_physical_base),
            flags: RegionFlags::PRESENT | RegionFlags::READABLE | RegionFlags::WRITABLE,
            read_hook: None,
            write_hook: None,
            unhandled_fault_hook: None,
        }
    }

    pub fn unallocated(guest_start: u64, guest_end: u64) -> Self {
        Self {
            guest_start,
            guest_end,
            kind: RegionKind::Unallocated,
            backing: HostBacking::None,
            flags: RegionFlags::empty(),
            read_hook: None,
            write_hook: None,
            unhandled_fault_hook: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.guest_end - self.guest_start
    }

    pub fn is_empty(&self) -> bool {
        self.guest_start == self.guest_end
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.guest_start && gpa < self.guest_end
    }

    pub fn range(&self) -> Range<u64> {
        self.guest_start..self.guest_end
    }

    fn split_at(self, cut: u64) -> (Option<Region>, Option<Region>) {
        debug_assert!(cut >= self.guest_start && cut <= self.guest_end);
        let Region {
            guest_start,
            guest_end,
            kind,
            backing,
            flags,
            ..
        } = &self;
        let left = if cut > *guest_start {
            Some(Region {
                guest_start: *guest_start,
                guest_end: cut,
                kind: *kind,
                backing: *backing,
                flags: *flags,
                read_hook: None,
                write_hook: None,
                unhandled_fault_hook: None,
            })
        } else {
            None
        };
        let right = if cut < *guest_end {
            let offset = cut - *guest_start;
            let right_backing = match backing {
                HostBacking::Direct(base) => HostBacking::Direct(base + offset),
                HostBacking::None => HostBacking::None,
            };
            Some(Region {
                guest_start: cut,
                guest_end: *guest_end,
                kind: *kind,
                backing: right_backing,
                flags: *flags,
                read_hook: None,
                write_hook: None,
                unhandled_fault_hook: None,
            })
        } else {
            None
        };
        (left, right)
    }
}

/// Result of `translate_gpa_to_hpa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    Hpa(u64),
    Unmapped,
    Hooked,
    NeedsAlloc,
}

/// The guest-physical address space, keyed for O(log n) lookup/insert/delete.
#[derive(Default)]
pub struct Mmap {
    regions: BTreeMap<u64, Region>,
}

impl Mmap {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// The region whose range contains `gpa`, if any. O(log n): one
    /// `range(..=gpa).next_back()` probe since regions are disjoint and
    /// sorted by `guest_start`.
    pub fn lookup(&self, gpa: u64) -> Option<&Region> {
        self.regions
            .range(..=gpa)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(gpa))
    }

    pub fn lookup_mut(&mut self, gpa: u64) -> Option<&mut Region> {
        let key = self
            .regions
            .range(..=gpa)
            .next_back()
            .filter(|(_, r)| r.contains(gpa))
            .map(|(k, _)| *k);
        key.and_then(move |k| self.regions.get_mut(&k))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        // A region overlaps [start, end) if its start is before `end` and its
        // end is after `start`. Only regions starting at or before `end` can
        // possibly overlap, so bound the scan from the left.
        self.regions
            .range(..end)
            .next_back()
            .map(|(_, r)| r.guest_end > start)
            .unwrap_or(false)
            || self
                .regions
                .range(start..end)
                .next()
                .map(|(_, r)| r.guest_start < end)
                .unwrap_or(false)
    }

    /// Insert a region. Fails with `Overlap` if it intersects any existing
    /// region (§4.2: "fails with OVERLAP if any existing region intersects").
    pub fn add(&mut self, region: Region) -> Result<(), MmapError> {
        if region.is_empty() {
            return Ok(());
        }
        if self.overlaps(region.guest_start, region.guest_end) {
            return Err(MmapError::Overlap(region.guest_start, region.guest_end));
        }
        self.regions.insert(region.guest_start, region);
        Ok(())
    }

    /// Remove `[start, end)`, splitting any region only partially covered.
    /// An empty result (nothing removed because nothing was there) is
    /// permitted.
    pub fn remove(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let affected_keys: Vec<u64> = self
            .regions
            .range(..end)
            .filter(|(_, r)| r.guest_end > start)
            .map(|(k, _)| *k)
            .collect();

        for key in affected_keys {
            let region = match self.regions.remove(&key) {
                Some(r) => r,
                None => continue,
            };
            let clip_start = region.guest_start.max(start);
            let clip_end = region.guest_end.min(end);
            if clip_start >= clip_end {
                // Didn't actually intersect; put it back untouched.
                self.regions.insert(region.guest_start, region);
                continue;
            }
            let (left, right) = region.split_at(clip_start);
            let (_, right) = match right {
                Some(r) => r.split_at(clip_end),
                None => (None, None),
            };
            if let Some(l) = left {
                self.regions.insert(l.guest_start, l);
            }
            if let Some(r) = right {
                self.regions.insert(r.guest_start, r);
            }
        }
    }

    /// Translate a guest-physical address through its owning region.
    pub fn translate_gpa_to_hpa(&self, gpa: u64) -> Translation {
        match self.lookup(gpa) {
            None => Translation::Unmapped,
            Some(region) => match region.backing {
                HostBacking::Direct(base) => {
                    Translation::Hpa(base + (gpa - region.guest_start))
                }
                HostBacking::None => {
                    if region.flags.contains(RegionFlags::HOOKED) {
                        Translation::Hooked
                    } else {
                        Translation::NeedsAlloc
                    }
                }
            },
        }
    }

    /// Install a hook over `[start, end)`. `write_only` leaves reads going to
    /// the region's existing backing (identity/shadow mapping) while writes
    /// trap; otherwise both directions trap.
    pub fn hook(
        &mut self,
        start: u64,
        end: u64,
        read_cb: Option<ReadHook>,
        write_cb: Option<WriteHook>,
        write_only: bool,
    ) -> Result<(), MmapError> {
        let mut region = Region {
            guest_start: start,
            guest_end: end,
            kind: RegionKind::Hooked,
            backing: HostBacking::None,
            flags: RegionFlags::PRESENT | RegionFlags::HOOKED,
            read_hook: read_cb,
            write_hook: write_cb,
            unhandled_fault_hook: None,
        };
        if write_only {
            region.flags.insert(RegionFlags::READABLE);
        }
        self.add(region)
    }

    pub fn pin(&mut self, gpa: u64) -> Result<(), MmapError> {
        let region = self
            .lookup_mut(gpa)
            .ok_or(MmapError::NotFound(gpa))?;
        region.flags.insert(RegionFlags::PINNED);
        Ok(())
    }

    pub fn unpin(&mut self, gpa: u64) -> Result<(), MmapError> {
        let region = self
            .lookup_mut(gpa)
            .ok_or(MmapError::NotFound(gpa))?;
        region.flags.remove(RegionFlags::PINNED);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_is_linear_within_a_region() {
        let mut map = Mmap::new();
        map.add(Region::ram(0, 0x40000000, 0xA000_0000)).unwrap();
        let a = map.translate_gpa_to_hpa(0x1000);
        let b = map.translate_gpa_to_hpa(0x2000);
        match (a, b) {
            (Translation::Hpa(ha), Translation::Hpa(hb)) => assert_eq!(hb - ha, 0x1000),
            _ => panic!("expected direct translations"),
        }
    }

    #[test]
    fn lookup_matches_inserted_bounds_exactly() {
        let mut map = Mmap::new();
        map.add(Region::ram(0x1000, 0x2000, 0)).unwrap();
        assert!(map.lookup(0x1000).is_some());
        assert!(map.lookup(0x1fff).is_some());
        assert!(map.lookup(0x2000).is_none());
        assert!(map.lookup(0x0fff).is_none());
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut map = Mmap::new();
        map.add(Region::ram(0, 0x1000, 0)).unwrap();
        let err = map.add(Region::ram(0x800, 0x1800, 0)).unwrap_err();
        assert!(matches!(err, MmapError::Overlap(_, _)));
    }

    #[test]
    fn remove_splits_partially_overlapped_region() {
        let mut map = Mmap::new();
        map.add(Region::ram(0, 0x3000, 0)).unwrap();
        map.remove(0x1000, 0x2000);
        assert!(map.lookup(0x0800).is_some());
        assert!(map.lookup(0x1800).is_none());
        assert!(map.lookup(0x2800).is_some());
        // Host offsets on the surviving right half must still be correct.
        match map.translate_gpa_to_hpa(0x2000) {
            Translation::Hpa(hpa) => assert_eq!(hpa, 0x2000),
            _ => panic!(),
        }
    }

    #[test]
    fn remove_on_empty_range_is_a_noop() {
        let mut map = Mmap::new();
        map.add(Region::ram(0, 0x1000, 0)).unwrap();
        map.remove(0x5000, 0x6000);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn unallocated_region_reports_needs_alloc() {
        let mut map = Mmap::new();
        map.add(Region::unallocated(0, 0x1000)).unwrap();
        assert_eq!(map.translate_gpa_to_hpa(0x100), Translation::NeedsAlloc);
    }

    #[test]
    fn pin_and_unpin_toggle_the_flag() {
        let mut map = Mmap::new();
        map.add(Region::ram(0, 0x1000, 0)).unwrap();
        map.pin(0x10).unwrap();
        assert!(map.lookup(0x10).unwrap().flags.contains(RegionFlags::PINNED));
        map.unpin(0x10).unwrap();
        assert!(!map.lookup(0x10).unwrap().flags.contains(RegionFlags::PINNED));
    }
}


