//! Boot-time physical memory accounting.
//!
//! Inspired by Linux's memblock: fixed arrays of usable segments and reserved ranges let
//! the kernel reserve and carve out memory before the buddy allocator (and the heap it
//! needs for frame metadata) exists.

use crate::arch::PAGE_SIZE;
use crate::{HumanSize, PhysicalAddress};

/// Maximum number of usable physical segments.
pub const MAX_SEGMENTS: usize = 8;

/// Maximum number of reserved ranges.
pub const MAX_RESERVED: usize = 64;

/// Memory region reported by the boot loader.
pub trait BootMemoryRegion {
    fn base(&self) -> PhysicalAddress;

    /// Size in bytes.
    fn size(&self) -> usize;

    /// Whether the kernel may allocate from this region.
    fn is_usable(&self) -> bool;
}

/// A contiguous, named range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: usize,
    size: usize,
    name: &'static str,
}

impl MemoryRegion {
    pub const fn new(base: PhysicalAddress, size: usize, name: &'static str) -> Self {
        Self {
            base: base.as_usize(),
            size,
            name,
        }
    }

    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Returns true if this region overlaps or touches another.
    pub const fn mergeable(&self, other: &MemoryRegion) -> bool {
        self.base <= other.end() && other.base <= self.end()
    }

    /// Merges this region with another, keeping this region's name.
    pub const fn merge(&self, other: &MemoryRegion) -> MemoryRegion {
        let base = if self.base < other.base { self.base } else { other.base };
        let end = if self.end() > other.end() { self.end() } else { other.end() };
        MemoryRegion {
            base,
            size: end - base,
            name: self.name,
        }
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Fixed-capacity array of regions sorted by base address.
#[derive(Debug)]
struct RegionArray<const N: usize> {
    regions: [Option<MemoryRegion>; N],
    count: usize,
}

impl<const N: usize> RegionArray<N> {
    const fn new() -> Self {
        Self {
            regions: [None; N],
            count: 0,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.count].iter().flatten()
    }

    fn insert(&mut self, index: usize, region: MemoryRegion) -> bool {
        if self.count >= N {
            return false;
        }
        self.regions[index..=self.count].rotate_right(1);
        self.regions[index] = Some(region);
        self.count += 1;
        true
    }

    fn remove(&mut self, index: usize) {
        self.regions[index..self.count].rotate_left(1);
        self.count -= 1;
        self.regions[self.count] = None;
    }

    /// Adds a region, merging it with every region it overlaps or touches.
    ///
    /// Returns false if the array is full.
    fn add(&mut self, region: MemoryRegion) -> bool {
        if region.size == 0 {
            return true;
        }
        let mut merged = region;
        let mut index = 0;
        while index < self.count {
            let Some(existing) = self.regions[index] else {
                break;
            };
            if existing.end() < merged.base {
                index += 1;
            } else if merged.end() < existing.base {
                break;
            } else {
                merged = existing.merge(&merged);
                self.remove(index);
            }
        }
        self.insert(index, merged)
    }

    /// Removes a range, splitting regions that straddle it.
    fn subtract(&mut self, base: usize, size: usize) -> bool {
        let cut = MemoryRegion {
            base,
            size,
            name: "",
        };
        let mut index = 0;
        while index < self.count {
            let Some(existing) = self.regions[index] else {
                break;
            };
            if !existing.overlaps(&cut) {
                index += 1;
                continue;
            }
            self.remove(index);
            if existing.base < cut.base {
                let before = MemoryRegion {
                    size: cut.base - existing.base,
                    ..existing
                };
                if !self.insert(index, before) {
                    return false;
                }
                index += 1;
            }
            if existing.end() > cut.end() {
                let after = MemoryRegion {
                    base: cut.end(),
                    size: existing.end() - cut.end(),
                    ..existing
                };
                if !self.insert(index, after) {
                    return false;
                }
                index += 1;
            }
        }
        true
    }

    fn total_size(&self) -> usize {
        self.iter().map(|r| r.size).sum()
    }
}

/// Segments and reservations known before the buddy allocator takes over.
pub struct EarlyAllocator {
    segments: RegionArray<MAX_SEGMENTS>,
    reserved: RegionArray<MAX_RESERVED>,
}

impl EarlyAllocator {
    pub const fn new() -> Self {
        Self {
            segments: RegionArray::new(),
            reserved: RegionArray::new(),
        }
    }

    /// Registers usable memory, trimmed to whole pages.
    ///
    /// Segments beyond [`MAX_SEGMENTS`] are dropped with a warning.
    pub fn add_segment(&mut self, base: PhysicalAddress, size: usize) -> bool {
        let start = base.align_up(PAGE_SIZE).as_usize();
        let end = (base.as_usize() + size) & !(PAGE_SIZE - 1);
        if end <= start {
            return true;
        }
        let added = self
            .segments
            .add(MemoryRegion::new(PhysicalAddress::new(start), end - start, "ram"));
        if added {
            log::info!(
                "phys: segment {:#x}-{:#x} ({})",
                start,
                end,
                HumanSize(end - start)
            );
        } else {
            log::warn!("phys: too many segments, ignoring {:#x}-{:#x}", start, end);
        }
        added
    }

    /// Marks a range permanently unavailable, widened to whole pages.
    ///
    /// # Panics
    ///
    /// Panics if the reservation table is full: losing a reservation would hand
    /// in-use memory to the allocator.
    pub fn reserve(&mut self, base: PhysicalAddress, size: usize, name: &'static str) {
        if size == 0 {
            return;
        }
        let start = base.align_down(PAGE_SIZE).as_usize();
        let end = (base.as_usize() + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        log::debug!("phys: reserve {:#x}-{:#x} {}", start, end, name);
        let region = MemoryRegion::new(PhysicalAddress::new(start), end - start, name);
        assert!(self.reserved.add(region), "too many reserved regions");
    }

    /// First-fit allocation of `size` bytes aligned to `align`, recorded as a reservation.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<PhysicalAddress> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let size = (size.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let align = align.max(PAGE_SIZE);

        let mut found = None;
        'segments: for segment in self.segments.iter() {
            let mut current = segment.base;
            loop {
                let candidate = (current + align - 1) & !(align - 1);
                if candidate + size > segment.end() {
                    break;
                }
                let probe = MemoryRegion {
                    base: candidate,
                    size,
                    name: "",
                };
                match self.reserved.iter().find(|r| r.overlaps(&probe)) {
                    Some(blocker) => current = blocker.end(),
                    None => {
                        found = Some(candidate);
                        break 'segments;
                    }
                }
            }
        }

        let base = PhysicalAddress::new(found?);
        self.reserve(base, size, "early");
        Some(base)
    }

    /// Returns an early allocation.
    pub fn free(&mut self, base: PhysicalAddress, size: usize) {
        let size = (size.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        assert!(
            self.reserved.subtract(base.as_usize(), size),
            "too many reserved regions"
        );
    }

    pub fn is_reserved(&self, addr: PhysicalAddress) -> bool {
        self.reserved.iter().any(|r| r.contains(addr.as_usize()))
    }

    pub fn segments(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.segments.iter()
    }

    pub fn reservations(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.reserved.iter()
    }

    /// Bytes of usable memory in all segments.
    pub fn total_memory(&self) -> usize {
        self.segments.total_size()
    }

    /// Bytes reserved inside segments.
    pub fn reserved_memory(&self) -> usize {
        self.reserved
            .iter()
            .flat_map(|r| {
                self.segments.iter().filter(|s| s.overlaps(r)).map(|s| {
                    r.end().min(s.end()) - r.base.max(s.base)
                })
            })
            .sum()
    }
}

impl Default for EarlyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phys(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    #[test]
    fn region_merge_keeps_first_name() {
        let a = MemoryRegion::new(phys(0x100), 0x100, "kernel");
        let b = MemoryRegion::new(phys(0x200), 0x100, "initrd");
        assert!(a.mergeable(&b));
        assert!(!a.overlaps(&b));
        let merged = a.merge(&b);
        assert_eq!((merged.base(), merged.size(), merged.name()), (phys(0x100), 0x200, "kernel"));
    }

    #[test]
    fn region_array_merges_and_splits() {
        let mut array = RegionArray::<4>::new();
        assert!(array.add(MemoryRegion::new(phys(0x200), 0x100, "a")));
        assert!(array.add(MemoryRegion::new(phys(0x500), 0x100, "b")));
        assert!(array.add(MemoryRegion::new(phys(0x300), 0x200, "c")));
        assert_eq!(array.count, 1);
        assert_eq!(array.total_size(), 0x400);

        assert!(array.subtract(0x300, 0x100));
        let regions: Vec<_> = array.iter().map(|r| (r.base, r.size)).collect();
        assert_eq!(regions, vec![(0x200, 0x100), (0x400, 0x200)]);
    }

    #[test]
    fn region_array_full() {
        let mut array = RegionArray::<1>::new();
        assert!(array.add(MemoryRegion::new(phys(0x100), 0x10, "a")));
        assert!(!array.add(MemoryRegion::new(phys(0x300), 0x10, "b")));
    }

    #[test]
    fn segments_are_trimmed_to_pages() {
        let mut early = EarlyAllocator::new();
        early.add_segment(phys(0x104), 0x100);
        assert_eq!(early.total_memory(), 0xF0);
        assert_eq!(early.segments().next().map(|s| s.base()), Some(phys(0x110)));
    }

    #[test]
    fn allocation_skips_reservations() {
        let mut early = EarlyAllocator::new();
        early.add_segment(phys(0), 0x400);
        early.reserve(phys(0), 0x105, "kernel");
        assert_eq!(early.reserved_memory(), 0x110);

        let a = early.allocate(0x20, PAGE_SIZE).unwrap();
        assert_eq!(a, phys(0x110));
        assert!(early.is_reserved(a));

        let b = early.allocate(0x10, 0x100).unwrap();
        assert_eq!(b, phys(0x200));

        early.free(a, 0x20);
        assert!(!early.is_reserved(a));
        assert_eq!(early.allocate(0x10, PAGE_SIZE), Some(phys(0x110)));
    }

    #[test]
    fn allocation_fails_when_full() {
        let mut early = EarlyAllocator::new();
        early.add_segment(phys(0), 0x40);
        assert!(early.allocate(0x40, PAGE_SIZE).is_some());
        assert!(early.allocate(0x10, PAGE_SIZE).is_none());
    }

    #[test]
    #[should_panic(expected = "too many reserved regions")]
    fn reservation_overflow_is_fatal() {
        let mut early = EarlyAllocator::new();
        for i in 0..=MAX_RESERVED {
            early.reserve(phys(i * 0x40), 0x10, "hole");
        }
    }
}
