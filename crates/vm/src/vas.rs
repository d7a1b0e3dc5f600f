//! Virtual address spaces.
//!
//! A [`Vas`] is a set of non-overlapping [`Map`]s, each binding a page-aligned range to
//! an object at an offset, plus the MMU context the ranges are translated through.
//! Translations are created lazily by [`Vas::fault`].
//!
//! Lock order: the VAS map-tree lock, then a map's lock, then object locks. A fault
//! never holds a map lock across the object fault itself; it re-validates under the
//! map lock before installing the translation, and code that removes a page from an
//! object does so before taking map locks to unmap it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Bound;

use crate::arch::{KERNEL_VM_START, PAGE_SIZE, USER_VM_END, USER_VM_START};
use crate::{Mmu, Page, PhysicalAddress, VirtualAddress, VmError, VmFlags, VmObject, Vmem};

#[derive(Clone)]
struct MapState {
    start: usize,
    size: usize,
    object: Arc<VmObject>,
    offset: u64,
    flags: VmFlags,
    max_prot: VmFlags,
    /// Bumped whenever the map's object, range or protection changes.
    generation: u64,
    /// Set once the map has left its address space.
    detached: bool,
}

impl MapState {
    fn end(&self) -> usize {
        self.start + self.size
    }

    fn object_offset(&self, addr: usize) -> u64 {
        self.offset + (addr - self.start) as u64
    }
}

/// One mapped range of an address space.
pub struct Map {
    mmu: Arc<Mmu>,
    state: spin::Mutex<MapState>,
}

impl Map {
    fn new(mmu: Arc<Mmu>, state: MapState) -> Arc<Self> {
        let shadow = state.flags.contains(VmFlags::SHADOW);
        let object = state.object.clone();
        let map = Arc::new(Self {
            mmu,
            state: spin::Mutex::new(state),
        });
        object.map_add(&map);
        if shadow {
            object.register_demand();
        }
        map
    }

    pub fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.state.lock().start)
    }

    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn flags(&self) -> VmFlags {
        self.state.lock().flags
    }

    pub fn max_prot(&self) -> VmFlags {
        self.state.lock().max_prot
    }

    pub fn object(&self) -> Arc<VmObject> {
        self.state.lock().object.clone()
    }

    /// Offset into the object of the map's first page.
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// Removes the translation of an object page if this map covers it.
    pub(crate) fn unmap_object_page(&self, offset: u64, page: Page) {
        let st = self.state.lock();
        if st.detached || offset < st.offset || offset >= st.offset + st.size as u64 {
            return;
        }
        let virt = VirtualAddress::new(st.start + (offset - st.offset) as usize);
        self.mmu.unmap_frame(virt, page.phys());
    }

    /// Splits the map at `addr`, keeping the low part and returning the high part.
    fn split(&self, addr: usize) -> Arc<Map> {
        let mut st = self.state.lock();
        assert!(addr > st.start && addr < st.end(), "split outside map");
        let mut high = st.clone();
        high.offset = st.object_offset(addr);
        high.start = addr;
        high.size = st.end() - addr;
        high.generation = 0;
        st.size = addr - st.start;
        st.generation += 1;
        drop(st);
        Map::new(self.mmu.clone(), high)
    }

    /// Unhooks a map removed from its address space from its object. A reference that
    /// outlives the removal no longer counts as a user of the object.
    fn detach(&self) {
        let (object, shadow) = {
            let mut st = self.state.lock();
            if st.detached {
                return;
            }
            st.detached = true;
            st.generation += 1;
            (st.object.clone(), st.flags.contains(VmFlags::SHADOW))
        };
        object.map_remove(self);
        if shadow {
            object.unregister_demand();
        }
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        let me: *const Map = self;
        let st = self.state.get_mut();
        if st.detached {
            return;
        }
        st.object.map_remove(me);
        if st.flags.contains(VmFlags::SHADOW) {
            st.object.unregister_demand();
        }
    }
}

enum VasKind {
    Kernel(Arc<Vmem>),
    User,
}

/// A virtual address space.
pub struct Vas {
    kind: VasKind,
    mmu: Arc<Mmu>,
    kernel_mmu: Arc<Mmu>,
    maps: spin::RwLock<BTreeMap<usize, Arc<Map>>>,
}

type MapTree = BTreeMap<usize, Arc<Map>>;

impl Vas {
    pub(crate) fn kernel(mmu: Arc<Mmu>, vmem: Arc<Vmem>) -> Self {
        Self {
            kind: VasKind::Kernel(vmem),
            kernel_mmu: mmu.clone(),
            mmu,
            maps: spin::RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn user(kernel_mmu: Arc<Mmu>) -> Result<Self, VmError> {
        Ok(Self {
            kind: VasKind::User,
            mmu: Arc::new(Mmu::user(&kernel_mmu)?),
            kernel_mmu,
            maps: spin::RwLock::new(BTreeMap::new()),
        })
    }

    pub fn is_kernel(&self) -> bool {
        matches!(self.kind, VasKind::Kernel(_))
    }

    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    fn bounds(&self) -> (usize, usize) {
        match &self.kind {
            VasKind::Kernel(vmem) => (vmem.start().as_usize(), vmem.end().as_usize()),
            VasKind::User => (USER_VM_START, USER_VM_END + 1),
        }
    }

    /// Maps `size` bytes of `object` starting at `offset`.
    ///
    /// User spaces place the map at `addr` if given and free (or, with `FIXED`, exactly
    /// at `addr`, replacing whatever was there), otherwise at the lowest free range.
    /// The kernel space always places maps itself.
    pub fn map(
        &self,
        addr: Option<VirtualAddress>,
        size: usize,
        object: Arc<VmObject>,
        offset: u64,
        flags: VmFlags,
        max_prot: VmFlags,
    ) -> Result<VirtualAddress, VmError> {
        if size == 0 || size % PAGE_SIZE != 0 || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }
        let (mut flags, mut max_prot) = (flags, max_prot);
        if self.is_kernel() {
            flags |= VmFlags::KERN;
            max_prot |= VmFlags::KERN;
        }
        if !max_prot.contains(flags.prot()) {
            return Err(VmError::ProtectionViolation);
        }
        let placed = flags & !(VmFlags::FIXED | VmFlags::WAIT | VmFlags::ZERO);

        let reserved = match &self.kind {
            VasKind::Kernel(_) if addr.is_some() => return Err(VmError::InvalidArgument),
            VasKind::Kernel(vmem) => Some(vmem.alloc(size, flags & VmFlags::WAIT)?.as_usize()),
            VasKind::User => None,
        };

        let mut removed = Vec::new();
        let mut maps = self.maps.write();
        let start = match reserved {
            Some(start) => start,
            None => {
                let (low, high) = self.bounds();
                match addr.map(VirtualAddress::as_usize) {
                    Some(start) if flags.contains(VmFlags::FIXED) => {
                        if start % PAGE_SIZE != 0 || start < low || start.checked_add(size).is_none_or(|end| end > high) {
                            return Err(VmError::InvalidArgument);
                        }
                        removed = self.remove_range(&mut maps, start, start + size);
                        start
                    }
                    None if flags.contains(VmFlags::FIXED) => return Err(VmError::InvalidArgument),
                    hint => hint
                        .map(|a| a & !(PAGE_SIZE - 1))
                        .filter(|&a| a >= low && a.checked_add(size).is_some_and(|end| end <= high))
                        .filter(|&a| Self::is_free(&maps, a, a + size))
                        .or_else(|| Self::first_fit(&maps, low, high, size))
                        .ok_or(VmError::OutOfMemory)?,
                }
            }
        };

        let map = Map::new(
            self.mmu.clone(),
            MapState {
                start,
                size,
                object,
                offset,
                flags: placed,
                max_prot: max_prot.prot(),
                generation: 0,
                detached: false,
            },
        );
        maps.insert(start, map);
        drop(maps);
        removed.iter().for_each(|map| map.detach());

        log::debug!("vas: mapped {:#x}+{:#x} {:?}", start, size, placed.prot());
        Ok(VirtualAddress::new(start))
    }

    fn is_free(maps: &MapTree, start: usize, end: usize) -> bool {
        maps.range(..end)
            .next_back()
            .is_none_or(|(_, m)| m.state.lock().end() <= start)
    }

    fn first_fit(maps: &MapTree, low: usize, high: usize, size: usize) -> Option<usize> {
        let mut cursor = low;
        for map in maps.values() {
            let st = map.state.lock();
            if st.start >= cursor && st.start - cursor >= size {
                return Some(cursor);
            }
            cursor = cursor.max(st.end());
        }
        (high.checked_sub(cursor)? >= size).then_some(cursor)
    }

    /// Splits whichever map straddles `addr` so that a map boundary falls on it.
    fn split_at(maps: &mut MapTree, addr: usize) {
        let Some((_, map)) = maps.range(..addr).next_back() else {
            return;
        };
        let straddles = {
            let st = map.state.lock();
            st.start < addr && addr < st.end()
        };
        if straddles {
            let high = map.split(addr);
            maps.insert(addr, high);
        }
    }

    /// Removes everything in `[start, end)` from the tree and its translations.
    /// Returns the removed maps, which the caller detaches after unlocking.
    fn remove_range(&self, maps: &mut MapTree, start: usize, end: usize) -> Vec<Arc<Map>> {
        Self::split_at(maps, start);
        Self::split_at(maps, end);
        let keys: Vec<usize> = maps.range(start..end).map(|(&k, _)| k).collect();
        let removed: Vec<Arc<Map>> = keys.iter().filter_map(|k| maps.remove(k)).collect();
        self.mmu.unmap_range(VirtualAddress::new(start), end - start);
        removed
    }

    /// Removes all maps and translations in `[addr, addr + size)`.
    pub fn unmap(&self, addr: VirtualAddress, size: usize) -> Result<(), VmError> {
        let start = addr.as_usize();
        if size == 0 || size % PAGE_SIZE != 0 || start % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        let end = start.checked_add(size).ok_or(VmError::InvalidArgument)?;

        let mut maps = self.maps.write();
        let removed = self.remove_range(&mut maps, start, end);
        drop(maps);

        if let VasKind::Kernel(vmem) = &self.kind {
            for map in &removed {
                let st = map.state.lock();
                vmem.free(VirtualAddress::new(st.start), st.size);
            }
        }
        log::debug!("vas: unmapped {:#x}+{:#x} ({} maps)", start, size, removed.len());
        removed.iter().for_each(|map| map.detach());
        Ok(())
    }

    /// Changes the protection of every map in `[addr, addr + size)`.
    ///
    /// Fails without changing anything if `prot` exceeds some map's `max_prot`.
    pub fn protect(&self, addr: VirtualAddress, size: usize, prot: VmFlags) -> Result<(), VmError> {
        let start = addr.as_usize();
        if size == 0 || size % PAGE_SIZE != 0 || start % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        let end = start.checked_add(size).ok_or(VmError::InvalidArgument)?;
        let mut prot = prot.prot();
        if self.is_kernel() {
            prot |= VmFlags::KERN;
        }

        let mut maps = self.maps.write();
        let overlapping = |maps: &MapTree| -> Vec<Arc<Map>> {
            let first = maps
                .range(..=start)
                .next_back()
                .filter(|(_, m)| m.state.lock().end() > start)
                .map(|(&k, _)| k)
                .unwrap_or(start);
            maps.range((Bound::Included(first), Bound::Excluded(end)))
                .map(|(_, m)| m.clone())
                .collect()
        };
        if overlapping(&maps)
            .iter()
            .any(|m| !m.state.lock().max_prot.contains(prot))
        {
            return Err(VmError::ProtectionViolation);
        }

        Self::split_at(&mut maps, start);
        Self::split_at(&mut maps, end);
        for map in overlapping(&maps) {
            let mut st = map.state.lock();
            st.flags = (st.flags - VmFlags::PROT) | prot;
            st.generation += 1;
        }
        self.mmu.protect_range(addr, size, prot);
        Ok(())
    }

    /// The map containing `addr`.
    pub fn lookup(&self, addr: VirtualAddress) -> Option<Arc<Map>> {
        Self::find(&self.maps.read(), addr.as_usize())
    }

    fn find(maps: &MapTree, addr: usize) -> Option<Arc<Map>> {
        maps.range(..=addr)
            .next_back()
            .filter(|(_, m)| m.state.lock().end() > addr)
            .map(|(_, m)| m.clone())
    }

    /// Number of maps.
    pub fn map_count(&self) -> usize {
        self.maps.read().len()
    }

    /// Resolves a fault at `addr` by installing a translation for its page.
    pub fn fault(&self, addr: VirtualAddress, access: VmFlags) -> Result<(), VmError> {
        let page = self.fault_pinned(addr, access)?;
        self.mmu.phys().unpin(page);
        Ok(())
    }

    /// Like [`Vas::fault`], but returns the page behind `addr` still pinned, so it
    /// cannot be paged out or freed until the caller unpins it.
    pub(crate) fn fault_pinned(&self, addr: VirtualAddress, access: VmFlags) -> Result<Page, VmError> {
        let page_addr = addr.align_down(PAGE_SIZE);
        let maps = self.maps.read();
        let map = Self::find(&maps, page_addr.as_usize()).ok_or(VmError::NoMapping)?;
        let phys = self.mmu.phys();

        loop {
            let (object, offset, prot, generation) = {
                let mut st = map.state.lock();
                if !st.flags.prot().permits(access) {
                    return Err(VmError::ProtectionViolation);
                }
                if st.flags.contains(VmFlags::SHADOW) {
                    let current = st.object.clone();
                    let chosen = current.demand_shadow();
                    st.flags.remove(VmFlags::SHADOW);
                    st.generation += 1;
                    if !Arc::ptr_eq(&chosen, &current) {
                        chosen.map_add(&map);
                        current.map_remove(Arc::as_ptr(&map));
                        st.object = chosen;
                    }
                }
                (
                    st.object.clone(),
                    st.object_offset(page_addr.as_usize()),
                    st.flags.prot(),
                    st.generation,
                )
            };

            let (page, effective) = object.fault(offset, access, prot)?;

            let st = map.state.lock();
            if st.generation != generation || !object.backs(offset, page) {
                drop(st);
                phys.unpin(page);
                continue;
            }
            let result = self.mmu.map_page(page_addr, page.phys(), effective);
            drop(st);
            if let Err(err) = result {
                phys.unpin(page);
                return Err(err);
            }
            #[cfg(feature = "detailed-logging")]
            log::trace!("vas: {:?} -> {:?} {:?}", page_addr, page.phys(), effective);
            return Ok(page);
        }
    }

    /// The physical address and protection `addr` currently translates to.
    pub fn translate(&self, addr: VirtualAddress) -> Option<(PhysicalAddress, VmFlags)> {
        match addr.as_usize() >= KERNEL_VM_START && !self.is_kernel() {
            true => self.kernel_mmu.translate(addr),
            false => self.mmu.translate(addr),
        }
    }

    /// Creates a child address space with the same maps.
    ///
    /// Shared maps share their object. Private maps become copy-on-write in both
    /// spaces: each side shadows the object on its next fault, and the parent's
    /// translations are write protected until then.
    pub fn fork(&self) -> Result<Vas, VmError> {
        assert!(!self.is_kernel(), "the kernel address space cannot be forked");
        let child = Vas::user(self.kernel_mmu.clone())?;
        let maps = self.maps.read();
        let mut child_maps = BTreeMap::new();

        for (&start, map) in maps.iter() {
            let mut st = map.state.lock();
            if !st.flags.contains(VmFlags::SHARED) {
                if !st.flags.contains(VmFlags::SHADOW) {
                    st.flags |= VmFlags::SHADOW;
                    st.object.register_demand();
                    st.generation += 1;
                }
                self.mmu.protect_range(
                    VirtualAddress::new(st.start),
                    st.size,
                    st.flags.prot() - VmFlags::WR,
                );
            }
            let mut copy = st.clone();
            drop(st);
            copy.generation = 0;
            child_maps.insert(start, Map::new(child.mmu.clone(), copy));
        }
        drop(maps);

        *child.maps.write() = child_maps;
        log::debug!("vas: forked {} maps", child.map_count());
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, CountingPager};
    use std::sync::atomic::Ordering;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn user_addr(page: usize) -> VirtualAddress {
        VirtualAddress::new(0x1000 + page * PAGE_SIZE)
    }

    #[test]
    fn first_fit_skips_used_ranges() {
        let vm = testing::boot();
        let vas = vm.vas_create().unwrap();
        let object = vm.anon_object(4 * PAGE);
        let a = vas.map(None, 2 * PAGE_SIZE, object.clone(), 0, VmFlags::RW, VmFlags::RW).unwrap();
        let b = vas.map(None, PAGE_SIZE, object.clone(), 0, VmFlags::RD, VmFlags::RW).unwrap();
        assert_eq!(a.as_usize(), USER_VM_START);
        assert_eq!(b, a + 2 * PAGE_SIZE);

        let hinted = vas.map(Some(user_addr(0)), PAGE_SIZE, object, 0, VmFlags::RD, VmFlags::RD).unwrap();
        assert_eq!(hinted, user_addr(0));
    }

    #[test]
    fn prot_beyond_max_is_refused() {
        let vm = testing::boot();
        let vas = vm.vas_create().unwrap();
        let object = vm.anon_object(PAGE);
        assert_eq!(
            vas.map(None, PAGE_SIZE, object, 0, VmFlags::RW, VmFlags::RD),
            Err(VmError::ProtectionViolation)
        );
    }

    #[test]
    fn faults_install_translations_lazily() {
        let vm = testing::boot();
        let vas = vm.vas_create().unwrap();
        let pager = Arc::new(CountingPager::new());
        let object = vm.pager_object(3 * PAGE, pager.clone());
        let base = vm.phys().free_count();
        let addr = vas
            .map(None, 3 * PAGE_SIZE, object.clone(), 0, VmFlags::RD | VmFlags::SHARED, VmFlags::RW)
            .unwrap();
        assert!(vas.translate(addr).is_none());

        for i in 0..3 {
            vas.fault(addr + i * PAGE_SIZE + 3, VmFlags::RD).unwrap();
        }
        assert_eq!(pager.pageins.load(Ordering::SeqCst), 3);
        assert_eq!(vm.phys().free_count(), base - 3);
        assert_eq!(object.resident_count(), 3);
        let (phys, prot) = vas.translate(addr + PAGE_SIZE).unwrap();
        assert_eq!(Some(vm.phys().page_of(phys)), object.resident(PAGE));
        assert!(!prot.contains(VmFlags::WR));

        assert_eq!(vas.fault(addr, VmFlags::WR), Err(VmError::ProtectionViolation));
        assert_eq!(vas.fault(addr + 3 * PAGE_SIZE, VmFlags::RD), Err(VmError::NoMapping));
    }

    #[test]
    fn unmap_splits_partially_covered_maps() {
        let vm = testing::boot();
        let vas = vm.vas_create().unwrap();
        let object = vm.anon_object(4 * PAGE);
        let addr = vas
            .map(Some(user_addr(0)), 4 * PAGE_SIZE, object.clone(), 0, VmFlags::RW, VmFlags::RW)
            .unwrap();
        for i in 0..4 {
            vas.fault(addr + i * PAGE_SIZE, VmFlags::WR).unwrap();
        }

        vas.unmap(addr + PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(vas.map_count(), 2);
        assert!(vas.translate(addr + PAGE_SIZE).is_none());
        assert!(vas.translate(addr + 3 * PAGE_SIZE).is_some());

        let tail = vas.lookup(addr + 3 * PAGE_SIZE).unwrap();
        assert_eq!(tail.start(), addr + 3 * PAGE_SIZE);
        assert_eq!(tail.offset(), 3 * PAGE);
        assert_eq!(object.state.lock().live_maps(), 2);

        // A reference held past the unmap does not keep the map attached.
        vas.unmap(addr, 4 * PAGE_SIZE).unwrap();
        assert_eq!(vas.map_count(), 0);
        assert_eq!(object.state.lock().live_maps(), 0);
        drop(tail);
    }

    #[test]
    fn removed_maps_release_their_shadow_demand() {
        let vm = testing::boot();
        let parent = vm.vas_create().unwrap();
        let object = vm.anon_object(PAGE);
        let addr = parent
            .map(Some(user_addr(0)), PAGE_SIZE, object.clone(), 0, VmFlags::RW, VmFlags::RW)
            .unwrap();
        let child = parent.fork().unwrap();
        let stale = child.lookup(addr).unwrap();
        child.unmap(addr, PAGE_SIZE).unwrap();

        // The parent is the only user left, so its write reuses the object.
        parent.fault(addr, VmFlags::WR).unwrap();
        assert!(Arc::ptr_eq(&parent.lookup(addr).unwrap().object(), &object));
        drop(stale);
    }

    #[test]
    fn fixed_map_replaces_existing() {
        let vm = testing::boot();
        let vas = vm.vas_create().unwrap();
        let first = vm.anon_object(2 * PAGE);
        let second = vm.anon_object(PAGE);
        vas.map(Some(user_addr(0)), 2 * PAGE_SIZE, first, 0, VmFlags::RW, VmFlags::RW).unwrap();
        let flags = VmFlags::RD | VmFlags::FIXED;
        vas.map(Some(user_addr(1)), PAGE_SIZE, second.clone(), 0, flags, VmFlags::RD).unwrap();

        assert_eq!(vas.map_count(), 2);
        assert_eq!(vas.lookup(user_addr(1)).unwrap().object().id(), second.id());
        assert!(!vas.lookup(user_addr(1)).unwrap().flags().contains(VmFlags::FIXED));
    }

    #[test]
    fn protect_respects_max_prot_and_downgrades() {
        let vm = testing::boot();
        let vas = vm.vas_create().unwrap();
        let object = vm.anon_object(2 * PAGE);
        let addr = vas
            .map(None, 2 * PAGE_SIZE, object, 0, VmFlags::RW, VmFlags::RW)
            .unwrap();
        vas.fault(addr, VmFlags::WR).unwrap();

        assert_eq!(vas.protect(addr, PAGE_SIZE, VmFlags::PROT), Err(VmError::ProtectionViolation));
        vas.protect(addr, PAGE_SIZE, VmFlags::RD).unwrap();
        assert_eq!(vas.map_count(), 2);
        assert!(!vas.translate(addr).unwrap().1.contains(VmFlags::WR));
        assert_eq!(vas.fault(addr, VmFlags::WR), Err(VmError::ProtectionViolation));
        vas.fault(addr + PAGE_SIZE, VmFlags::WR).unwrap();
    }

    #[test]
    fn fork_copies_on_write_exactly_once() {
        let vm = testing::boot();
        let parent = vm.vas_create().unwrap();
        let object = vm.anon_object(PAGE);
        let addr = parent.map(None, PAGE_SIZE, object, 0, VmFlags::RW, VmFlags::RW).unwrap();
        parent.fault(addr, VmFlags::WR).unwrap();
        let (original, _) = parent.translate(addr).unwrap();
        vm.phys().memory().write(original, b"parent");

        let child = parent.fork().unwrap();
        assert!(!parent.translate(addr).unwrap().1.contains(VmFlags::WR));

        // Reads through the child share the frame.
        child.fault(addr, VmFlags::RD).unwrap();
        assert_eq!(child.translate(addr).map(|t| t.0), Some(original));

        let frames = vm.phys().free_count();
        child.fault(addr, VmFlags::WR).unwrap();
        let (copy, prot) = child.translate(addr).unwrap();
        assert_ne!(copy, original);
        assert!(prot.contains(VmFlags::WR));
        assert_eq!(vm.phys().free_count(), frames - 1);
        vm.phys().memory().write(copy, b"child!");

        let mut buf = [0u8; 6];
        vm.phys().memory().read(parent.translate(addr).unwrap().0, &mut buf);
        assert_eq!(&buf, b"parent");

        // Writing again through the child needs no fault: the translation is writable.
        assert!(child.translate(addr).unwrap().1.contains(VmFlags::WR));
    }

    #[test]
    fn child_exit_collapses_the_parent_chain() {
        let vm = testing::boot();
        let parent = vm.vas_create().unwrap();
        let object = vm.anon_object(PAGE);
        let addr = parent.map(None, PAGE_SIZE, object.clone(), 0, VmFlags::RW, VmFlags::RW).unwrap();
        parent.fault(addr, VmFlags::WR).unwrap();
        let (original, _) = parent.translate(addr).unwrap();
        drop(object);

        let child = parent.fork().unwrap();
        child.fault(addr, VmFlags::WR).unwrap();
        parent.fault(addr, VmFlags::WR).unwrap();
        let parent_object = parent.lookup(addr).unwrap().object();
        assert!(parent_object.shadow().is_some());

        drop(child);
        assert!(parent_object.shadow().is_none());
        assert_eq!(parent.translate(addr).map(|t| t.0), parent_object.resident(0).map(|p| p.phys()));
        assert_ne!(parent.translate(addr).map(|t| t.0), Some(original));
    }

    #[test]
    fn concurrent_faults_map_the_same_frame() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::slow());
        let object = vm.pager_object(PAGE, pager.clone());
        let vas = Arc::new(vm.vas_create().unwrap());
        let addr = vas
            .map(None, PAGE_SIZE, object, 0, VmFlags::RD | VmFlags::SHARED, VmFlags::RD)
            .unwrap();

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let vas = vas.clone();
                std::thread::spawn(move || {
                    vas.fault(addr, VmFlags::RD).unwrap();
                    vas.translate(addr).unwrap().0
                })
            })
            .collect();
        let frames: Vec<PhysicalAddress> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(frames[0], frames[1]);
        assert_eq!(pager.pageins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pageout_removes_translations() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::new());
        let object = vm.pager_object(PAGE, pager.clone());
        let vas = vm.vas_create().unwrap();
        let addr = vas
            .map(None, PAGE_SIZE, object.clone(), 0, VmFlags::RW | VmFlags::SHARED, VmFlags::RW)
            .unwrap();
        vas.fault(addr, VmFlags::WR).unwrap();

        assert_eq!(object.pageout(0), Ok(true));
        assert!(vas.translate(addr).is_none());
        vas.fault(addr, VmFlags::RD).unwrap();
        assert_eq!(pager.pageins.load(Ordering::SeqCst), 2);
    }
}
