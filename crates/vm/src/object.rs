//! VM objects: pageable memory with a pager and a set of resident pages.
//!
//! An object's resident pages are indexed in the shared page-hash under the object's
//! id and mirrored in a per-object map so the object can enumerate them. Both are only
//! changed with the object lock held. Pages being filled or written back are `BUSY`;
//! anyone else who finds such a page pins it and waits.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::mem;

use crate::arch::PAGE_SIZE;
use crate::frame::{FrameFlag, FrameState};
use crate::vas::Map;
use crate::{
    AnonPager, NodeKind, ObjectId, Page, PageHash, Pager, PagerFlags, PghashNode,
    PhysicalAllocator, VmError, VmFlags,
};

/// How an object's absent pages are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Zero-filled on first touch.
    Anonymous,
    /// Read from the object's pager.
    Paged,
    /// Copy-on-write layer over a parent object.
    Shadow,
}

pub(crate) struct ObjectState {
    pub(crate) size: u64,
    pub(crate) resident: BTreeMap<u64, Page>,
    pub(crate) pager_nodes: BTreeSet<u64>,
    pub(crate) maps: Vec<Weak<Map>>,
    pub(crate) shadow: Option<Arc<VmObject>>,
    pub(crate) children: Vec<Weak<VmObject>>,
    /// Private maps that will insert a shadow over this object on their first fault.
    pub(crate) demand: usize,
}

impl ObjectState {
    pub(crate) fn live_maps(&self) -> usize {
        self.maps.iter().filter(|m| m.strong_count() > 0).count()
    }
}

/// A pageable memory region.
pub struct VmObject {
    id: ObjectId,
    kind: ObjectKind,
    pager: Arc<dyn Pager>,
    pub(crate) phys: Arc<PhysicalAllocator>,
    pub(crate) pghash: Arc<PageHash>,
    pub(crate) state: spin::Mutex<ObjectState>,
}

impl VmObject {
    pub(crate) fn with_kind(
        kind: ObjectKind,
        size: u64,
        pager: Arc<dyn Pager>,
        shadow: Option<Arc<VmObject>>,
        phys: Arc<PhysicalAllocator>,
        pghash: Arc<PageHash>,
    ) -> Arc<Self> {
        assert_eq!(size % PAGE_SIZE as u64, 0, "object size {size:#x} is not page aligned");
        Arc::new(Self {
            id: pghash.new_object_id(),
            kind,
            pager,
            phys,
            pghash,
            state: spin::Mutex::new(ObjectState {
                size,
                resident: BTreeMap::new(),
                pager_nodes: BTreeSet::new(),
                maps: Vec::new(),
                shadow,
                children: Vec::new(),
                demand: 0,
            }),
        })
    }

    /// An anonymous, zero-filled object.
    pub fn anonymous(size: u64, phys: Arc<PhysicalAllocator>, pghash: Arc<PageHash>) -> Arc<Self> {
        Self::with_kind(ObjectKind::Anonymous, size, Arc::new(AnonPager), None, phys, pghash)
    }

    /// An object backed by `pager`.
    pub fn paged(
        size: u64,
        pager: Arc<dyn Pager>,
        phys: Arc<PhysicalAllocator>,
        pghash: Arc<PageHash>,
    ) -> Arc<Self> {
        Self::with_kind(ObjectKind::Paged, size, pager, None, phys, pghash)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn pager(&self) -> &Arc<dyn Pager> {
        &self.pager
    }

    /// The object this one shadows, if any.
    pub fn shadow(&self) -> Option<Arc<VmObject>> {
        self.state.lock().shadow.clone()
    }

    /// The resident page at `offset`, if any.
    pub fn resident(&self, offset: u64) -> Option<Page> {
        self.state.lock().resident.get(&offset).copied()
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    /// Makes the page at `offset` resident and returns it pinned, with the protection
    /// it may be mapped with.
    ///
    /// At most one pagein runs per (object, offset): concurrent faulters find the busy
    /// page in the index, pin it and wait for the first to finish.
    pub fn fault(&self, offset: u64, access: VmFlags, prot: VmFlags) -> Result<(Page, VmFlags), VmError> {
        assert_eq!(offset % PAGE_SIZE as u64, 0, "unaligned object offset {offset:#x}");
        loop {
            let mut st = self.state.lock();
            if offset >= st.size {
                return Err(VmError::OutOfRange);
            }

            let node = self.pghash.lookup(self.id, offset);
            if let Some(page) = node.and_then(|n| n.resident()) {
                self.phys.pin(page);
                drop(st);
                if !self.phys.wait_unbusy(page) {
                    self.phys.unpin(page);
                    return Err(VmError::Io);
                }
                return Ok((page, self.finish(page, prot)));
            }

            if node.is_none() && self.pager.flags().contains(PagerFlags::PGHASH) {
                if self.kind == ObjectKind::Shadow {
                    drop(st);
                    match self.shadow_fault(offset, access, prot)? {
                        Some(result) => return Ok(result),
                        None => continue,
                    }
                }
                let page = self.phys.alloc(VmFlags::ZERO)?;
                self.install(&mut st, offset, page, false);
                drop(st);
                return Ok((page, self.finish(page, prot)));
            }

            let page = self.phys.alloc(VmFlags::empty())?;
            if node.is_some() {
                self.pghash.remove(self.id, offset);
                st.pager_nodes.remove(&offset);
            }
            self.install(&mut st, offset, page, true);
            drop(st);
            return self.pagein(offset, node, page).map(|page| (page, self.finish(page, prot)));
        }
    }

    /// Runs the pager for a freshly installed busy page.
    fn pagein(&self, offset: u64, node: Option<PghashNode>, page: Page) -> Result<Page, VmError> {
        #[cfg(feature = "detailed-logging")]
        log::trace!("pagein {:?} offset {:#x} into {:?}", self.id, offset, page.phys());

        // SAFETY: the page is busy and not yet mapped, so this is the only access.
        let buf = unsafe { self.phys.bytes_mut(page) };
        match self.pager.pagein(offset, node.as_ref(), buf) {
            Ok(()) => {}
            Err(VmError::NotResident) => buf.fill(0),
            Err(err) => {
                log::warn!("pagein of {:?} offset {:#x} failed: {err}", self.id, offset);
                self.page_error(offset, page, node);
                return Err(err);
            }
        }
        self.phys.unbusy(page);
        Ok(page)
    }

    /// Read-through and copy-on-write for shadow objects. Returns `None` if another
    /// faulter installed the page meanwhile.
    fn shadow_fault(&self, offset: u64, access: VmFlags, prot: VmFlags) -> Result<Option<(Page, VmFlags)>, VmError> {
        let parent = self.state.lock().shadow.clone();
        let source = match parent {
            Some(parent) => {
                match parent.fault(offset, (access & VmFlags::KERN) | VmFlags::RD, prot - VmFlags::WR) {
                    Ok((page, _)) => Some(page),
                    // The parent is smaller than this object: zero-fill past its end.
                    Err(VmError::OutOfRange) => None,
                    Err(err) => return Err(err),
                }
            }
            None => None,
        };

        let mut st = self.state.lock();
        let beyond = offset >= st.size;
        if beyond || self.pghash.lookup(self.id, offset).is_some() {
            drop(st);
            if let Some(src) = source {
                self.phys.unpin(src);
            }
            return match beyond {
                true => Err(VmError::OutOfRange),
                false => Ok(None),
            };
        }

        let Some(src) = source else {
            let page = self.phys.alloc(VmFlags::ZERO)?;
            self.install(&mut st, offset, page, false);
            drop(st);
            return Ok(Some((page, self.finish(page, prot))));
        };

        if !access.contains(VmFlags::WR) {
            return Ok(Some((src, prot - VmFlags::WR)));
        }

        let page = match self.phys.alloc(VmFlags::empty()) {
            Ok(page) => page,
            Err(err) => {
                drop(st);
                self.phys.unpin(src);
                return Err(err);
            }
        };
        self.phys.copy(page, src);
        self.install(&mut st, offset, page, false);
        drop(st);
        self.phys.unpin(src);
        #[cfg(feature = "detailed-logging")]
        log::trace!("cow {:?} offset {:#x}: {:?} -> {:?}", self.id, offset, src.phys(), page.phys());
        Ok(Some((page, self.finish(page, prot))))
    }

    /// Returns true if a fault at `offset` would still resolve to `page`: the page is
    /// still indexed and this object has not gained a page of its own there meanwhile.
    pub(crate) fn backs(&self, offset: u64, page: Page) -> bool {
        let st = self.state.lock();
        let frame = self.phys.frame(page);
        if frame.state() != FrameState::Object || frame.owner().is_none() {
            return false;
        }
        st.resident.get(&offset).is_none_or(|&own| own == page)
    }

    fn finish(&self, page: Page, prot: VmFlags) -> VmFlags {
        if prot.contains(VmFlags::WR) {
            self.phys.dirty(page);
        }
        prot
    }

    /// Makes a newly allocated page the object's page at `offset`, pinned for the caller.
    fn install(&self, st: &mut ObjectState, offset: u64, page: Page, busy: bool) {
        let frame = self.phys.frame(page);
        frame.set_owner(Some((self.id, offset)));
        frame.set_state(FrameState::Object);
        if busy {
            self.phys.set_busy(page);
        }
        self.phys.pin(page);
        self.pghash.add(PghashNode::page(self.id, offset, page));
        st.resident.insert(offset, page);
    }

    /// Allocates and installs a zeroed page at `offset`, returned pinned.
    pub fn page_alloc(&self, offset: u64) -> Result<Page, VmError> {
        let mut st = self.state.lock();
        assert!(offset < st.size, "page_alloc beyond end of object");
        assert!(
            self.pghash.lookup(self.id, offset).is_none(),
            "page_alloc over an existing page"
        );
        let page = self.phys.alloc(VmFlags::ZERO)?;
        self.install(&mut st, offset, page, false);
        Ok(page)
    }

    /// Drops a page whose pagein failed. Waiters see the error and give up.
    ///
    /// The pager-private node the pagein consumed goes back into the index so the
    /// backing store stays reachable for the next fault.
    fn page_error(&self, offset: u64, page: Page, node: Option<PghashNode>) {
        let mut st = self.state.lock();
        if st.resident.get(&offset) == Some(&page) {
            st.resident.remove(&offset);
            self.pghash.remove(self.id, offset);
            if let Some(node) = node {
                self.pghash.add(node);
                st.pager_nodes.insert(offset);
            }
        }
        self.detach(page);
        drop(st);
        self.phys.set_error(page);
        self.phys.release(page);
        self.phys.unpin(page);
    }

    fn detach(&self, page: Page) {
        let frame = self.phys.frame(page);
        frame.set_owner(None);
        frame.set_state(FrameState::Normal);
    }

    /// Writes the page at `offset` back if dirty and evicts it.
    ///
    /// Returns `Ok(false)` if the page is in use and was left resident.
    pub fn pageout(&self, offset: u64) -> Result<bool, VmError> {
        self.reclaim_page(offset, true)
    }

    /// Evicts the page at `offset` if it is clean and unused.
    pub fn evict(&self, offset: u64) -> Result<bool, VmError> {
        self.reclaim_page(offset, false)
    }

    fn reclaim_page(&self, offset: u64, writeback: bool) -> Result<bool, VmError> {
        let page = {
            let st = self.state.lock();
            let Some(&page) = st.resident.get(&offset) else {
                return Err(VmError::NotResident);
            };
            let frame = self.phys.frame(page);
            if frame.pins() > 0 || self.phys.is_busy(page) {
                return Ok(false);
            }
            if !writeback && frame.flags.atomic_test(FrameFlag::Dirty) {
                return Ok(false);
            }
            self.phys.set_busy(page);
            frame.set_state(FrameState::Pageout);
            page
        };
        let frame = self.phys.frame(page);

        self.unmap_page(offset, page);

        let mut handle = None;
        if self.phys.take_dirty(page) {
            // SAFETY: the page is busy and unmapped everywhere; nobody writes it.
            match self.pager.pageout(offset, unsafe { self.phys.bytes(page) }) {
                Ok(h) => handle = h,
                Err(err) => {
                    self.phys.dirty(page);
                    frame.set_state(FrameState::Object);
                    self.phys.unbusy(page);
                    return Err(err);
                }
            }
        }

        let mut st = self.state.lock();
        if frame.pins() > 0 || st.resident.get(&offset) != Some(&page) {
            frame.set_state(FrameState::Object);
            drop(st);
            self.phys.unbusy(page);
            return Ok(false);
        }
        st.resident.remove(&offset);
        self.pghash.remove(self.id, offset);
        if let Some(handle) = handle {
            self.pghash
                .add(PghashNode::new(self.id, NodeKind::Pager, offset, handle));
            st.pager_nodes.insert(offset);
        }
        self.detach(page);
        drop(st);

        self.phys.unbusy(page);
        self.phys.free(page);
        #[cfg(feature = "detailed-logging")]
        log::trace!("pageout {:?} offset {:#x}", self.id, offset);
        Ok(true)
    }

    /// Pages out every unused resident page, returning how many were evicted.
    pub fn pageout_all(&self) -> usize {
        let offsets: Vec<u64> = self.state.lock().resident.keys().copied().collect();
        offsets
            .into_iter()
            .filter(|&offset| matches!(self.pageout(offset), Ok(true)))
            .count()
    }

    /// Maps that may hold a translation to one of this object's pages: its own and
    /// those of every shadow reading through it.
    pub(crate) fn collect_maps(&self) -> Vec<Arc<Map>> {
        let (mut maps, mut pending) = {
            let st = self.state.lock();
            (st.maps.clone(), st.children.clone())
        };
        while let Some(child) = pending.pop() {
            if let Some(child) = child.upgrade() {
                let st = child.state.lock();
                maps.extend(st.maps.iter().cloned());
                pending.extend(st.children.iter().cloned());
            }
        }
        maps.iter().filter_map(Weak::upgrade).collect()
    }

    /// Removes every translation to `page` at object offset `offset`.
    ///
    /// Must be called without the object lock.
    pub(crate) fn unmap_page(&self, offset: u64, page: Page) {
        for map in self.collect_maps() {
            map.unmap_object_page(offset, page);
        }
    }

    /// Changes the object's size, dropping pages past the new end.
    pub fn resize(&self, size: u64) {
        assert_eq!(size % PAGE_SIZE as u64, 0, "object size {size:#x} is not page aligned");
        let dropped = {
            let mut st = self.state.lock();
            st.size = size;
            self.drop_pages(&mut st, size)
        };
        self.release_dropped(dropped);
    }

    /// Drops every resident page, keeping the size.
    pub fn clear(&self) {
        let dropped = {
            let mut st = self.state.lock();
            self.drop_pages(&mut st, 0)
        };
        self.release_dropped(dropped);
    }

    fn drop_pages(&self, st: &mut ObjectState, from: u64) -> Vec<(u64, Page)> {
        let dropped: Vec<(u64, Page)> = st.resident.split_off(&from).into_iter().collect();
        for &(offset, page) in &dropped {
            self.pghash.remove(self.id, offset);
            self.detach(page);
        }
        for offset in st.pager_nodes.split_off(&from) {
            self.pghash.remove(self.id, offset);
        }
        dropped
    }

    pub(crate) fn release_dropped(&self, dropped: Vec<(u64, Page)>) {
        for (offset, page) in dropped {
            self.unmap_page(offset, page);
            self.phys.release(page);
        }
    }

    /// Moves `src`'s pages into `self` at the same offsets.
    ///
    /// Pages `self` already has (or that lie past its end) are discarded. `self` must
    /// be the shadow child of `src`, or unrelated to it. Returns the number of pages
    /// moved.
    pub fn pages_migrate(&self, src: &VmObject) -> usize {
        let (moved, dropped) = {
            let mut dst = self.state.lock();
            let mut src_st = src.state.lock();
            self.migrate_locked(&mut dst, src, &mut src_st)
        };
        self.release_dropped(dropped);
        moved
    }

    pub(crate) fn migrate_locked(
        &self,
        dst: &mut ObjectState,
        src: &VmObject,
        src_st: &mut ObjectState,
    ) -> (usize, Vec<(u64, Page)>) {
        let mut moved = 0;
        let mut dropped = Vec::new();
        let taken = |dst: &ObjectState, offset: u64| {
            offset >= dst.size || dst.resident.contains_key(&offset) || dst.pager_nodes.contains(&offset)
        };

        for (offset, page) in mem::take(&mut src_st.resident) {
            if taken(dst, offset) {
                self.pghash.remove(src.id, offset);
                src.detach(page);
                dropped.push((offset, page));
            } else {
                self.pghash.migrate(src.id, offset, self.id);
                self.phys.frame(page).set_owner(Some((self.id, offset)));
                dst.resident.insert(offset, page);
                moved += 1;
            }
        }
        for offset in mem::take(&mut src_st.pager_nodes) {
            if taken(dst, offset) {
                self.pghash.remove(src.id, offset);
            } else {
                self.pghash.migrate(src.id, offset, self.id);
                dst.pager_nodes.insert(offset);
            }
        }
        (moved, dropped)
    }

    pub(crate) fn map_add(&self, map: &Arc<Map>) {
        let mut st = self.state.lock();
        st.maps.retain(|m| m.strong_count() > 0);
        st.maps.push(Arc::downgrade(map));
    }

    pub(crate) fn map_remove(&self, map: *const Map) {
        self.state
            .lock()
            .maps
            .retain(|m| m.as_ptr() != map && m.strong_count() > 0);
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let resident = mem::take(&mut st.resident);
        let pager_nodes = mem::take(&mut st.pager_nodes);
        let parent = st.shadow.take();

        for (offset, page) in resident {
            self.pghash.remove(self.id, offset);
            self.detach(page);
            self.phys.release(page);
        }
        for offset in pager_nodes {
            self.pghash.remove(self.id, offset);
        }

        if let Some(parent) = parent {
            let me: *const VmObject = self;
            parent
                .state
                .lock()
                .children
                .retain(|c| c.as_ptr() != me && c.strong_count() > 0);
            parent.simplify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, CountingPager};
    use std::sync::atomic::Ordering;

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn three_page_object_pages_in_once_per_offset() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::new());
        let object = vm.pager_object(3 * PAGE, pager.clone());
        let baseline = vm.phys().free_count();

        let mut pages = Vec::new();
        for i in 0..3 {
            let (page, _) = object.fault(i * PAGE, VmFlags::RD, VmFlags::RD).unwrap();
            vm.phys().unpin(page);
            pages.push(page);
        }
        pages.dedup();
        assert_eq!(pages.len(), 3);
        for i in 0..3 {
            let node = vm.pghash().lookup(object.id(), i * PAGE).unwrap();
            assert_eq!(node.resident(), Some(pages[i as usize]));
        }
        assert_eq!(pager.pageins.load(Ordering::SeqCst), 3);
        assert_eq!(vm.phys().free_count(), baseline - 3);

        // Faulting again hits the index.
        let (page, _) = object.fault(PAGE, VmFlags::RD, VmFlags::RD).unwrap();
        vm.phys().unpin(page);
        assert_eq!(pager.pageins.load(Ordering::SeqCst), 3);

        let mut buf = [0u8; PAGE_SIZE];
        vm.phys().read(pages[2], 0, &mut buf);
        assert_eq!(buf, CountingPager::pattern(2 * PAGE));
    }

    #[test]
    fn concurrent_faults_share_one_pagein() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::slow());
        let object = vm.pager_object(PAGE, pager.clone());

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let (vm, object) = (vm.clone(), object.clone());
                std::thread::spawn(move || {
                    let (page, _) = object.fault(0, VmFlags::RD, VmFlags::RD).unwrap();
                    vm.phys().unpin(page);
                    page
                })
            })
            .collect();
        let pages: Vec<Page> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(pager.pageins.load(Ordering::SeqCst), 1);
        assert!(pages.iter().all(|&p| p == pages[0]));
    }

    #[test]
    fn failed_pagein_is_reported_and_not_cached() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::failing());
        let object = vm.pager_object(PAGE, pager.clone());
        let baseline = vm.phys().free_count();

        assert_eq!(object.fault(0, VmFlags::RD, VmFlags::RD), Err(VmError::Io));
        assert!(vm.pghash().lookup(object.id(), 0).is_none());
        assert_eq!(vm.phys().free_count(), baseline);
        assert_eq!(object.fault(0, VmFlags::RD, VmFlags::RD), Err(VmError::Io));
        assert_eq!(pager.pageins.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_pagein_keeps_the_paged_out_copy() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::new());
        let object = vm.pager_object(PAGE, pager.clone());

        let (page, _) = object.fault(0, VmFlags::WR, VmFlags::RW).unwrap();
        vm.phys().write(page, 0, b"dirty");
        vm.phys().unpin(page);
        assert_eq!(object.pageout(0), Ok(true));

        pager.fail_next_pagein();
        assert_eq!(object.fault(0, VmFlags::RD, VmFlags::RD), Err(VmError::Io));
        assert_eq!(vm.pghash().lookup(object.id(), 0).map(|n| n.kind()), Some(NodeKind::Pager));

        let (page, _) = object.fault(0, VmFlags::RD, VmFlags::RD).unwrap();
        let mut buf = [0u8; 5];
        vm.phys().read(page, 0, &mut buf);
        assert_eq!(&buf, b"dirty");
        vm.phys().unpin(page);
    }

    #[test]
    fn anonymous_pages_are_zero_filled_without_pager() {
        let vm = testing::boot();
        let object = vm.anon_object(2 * PAGE);
        let (page, prot) = object.fault(PAGE, VmFlags::WR, VmFlags::RW).unwrap();
        assert_eq!(prot, VmFlags::RW);
        assert!(vm.phys().frame(page).flags.atomic_test(FrameFlag::Dirty));

        let mut buf = [0xFFu8; PAGE_SIZE];
        vm.phys().read(page, 0, &mut buf);
        assert_eq!(buf, [0; PAGE_SIZE]);
        vm.phys().unpin(page);
        assert_eq!(object.fault(2 * PAGE, VmFlags::RD, VmFlags::RD), Err(VmError::OutOfRange));
    }

    #[test]
    fn pageout_writes_back_and_pagein_restores() {
        let vm = testing::boot();
        let pager = Arc::new(CountingPager::new());
        let object = vm.pager_object(PAGE, pager.clone());

        let (page, _) = object.fault(0, VmFlags::WR, VmFlags::RW).unwrap();
        vm.phys().write(page, 0, b"dirty");
        vm.phys().unpin(page);
        let free = vm.phys().free_count();

        assert_eq!(object.pageout(0), Ok(true));
        assert_eq!(pager.pageouts.load(Ordering::SeqCst), 1);
        assert_eq!(vm.phys().free_count(), free + 1);
        assert_eq!(vm.pghash().lookup(object.id(), 0).map(|n| n.kind()), Some(NodeKind::Pager));

        let (page, _) = object.fault(0, VmFlags::RD, VmFlags::RD).unwrap();
        let mut buf = [0u8; 5];
        vm.phys().read(page, 0, &mut buf);
        assert_eq!(&buf, b"dirty");
        vm.phys().unpin(page);
    }

    #[test]
    fn pinned_pages_are_not_evicted() {
        let vm = testing::boot();
        let object = vm.pager_object(PAGE, Arc::new(CountingPager::new()));
        let (page, _) = object.fault(0, VmFlags::RD, VmFlags::RD).unwrap();
        assert_eq!(object.evict(0), Ok(false));
        vm.phys().unpin(page);
        assert_eq!(object.evict(0), Ok(true));
        assert_eq!(object.evict(0), Err(VmError::NotResident));
    }

    #[test]
    fn anonymous_dirty_pages_cannot_be_paged_out() {
        let vm = testing::boot();
        let object = vm.anon_object(PAGE);
        let (page, _) = object.fault(0, VmFlags::WR, VmFlags::RW).unwrap();
        vm.phys().unpin(page);
        assert_eq!(object.pageout(0), Err(VmError::InvalidArgument));
        assert_eq!(object.resident(0), Some(page));
    }

    #[test]
    fn resize_drops_pages_past_the_end() {
        let vm = testing::boot();
        let object = vm.anon_object(4 * PAGE);
        for i in 0..4 {
            let page = object.page_alloc(i * PAGE).unwrap();
            vm.phys().unpin(page);
        }
        let free = vm.phys().free_count();
        object.resize(PAGE);
        assert_eq!(object.resident_count(), 1);
        assert_eq!(vm.phys().free_count(), free + 3);
        assert!(vm.pghash().lookup(object.id(), 2 * PAGE).is_none());

        object.clear();
        assert_eq!(object.resident_count(), 0);
        assert_eq!(object.size(), PAGE);
    }

    #[test]
    fn pages_migrate_moves_index_entries() {
        let vm = testing::boot();
        let src = vm.anon_object(2 * PAGE);
        let dst = vm.anon_object(2 * PAGE);
        let a = src.page_alloc(0).unwrap();
        let b = src.page_alloc(PAGE).unwrap();
        let mine = dst.page_alloc(PAGE).unwrap();
        [a, b, mine].into_iter().for_each(|p| vm.phys().unpin(p));
        let free = vm.phys().free_count();

        assert_eq!(dst.pages_migrate(&src), 1);
        assert_eq!(dst.resident(0), Some(a));
        assert_eq!(dst.resident(PAGE), Some(mine));
        assert!(vm.pghash().lookup(src.id(), 0).is_none());
        assert_eq!(vm.phys().frame(a).owner(), Some((dst.id(), 0)));
        assert_eq!(vm.phys().free_count(), free + 1);
    }

    #[test]
    fn dropping_an_object_frees_its_pages() {
        let vm = testing::boot();
        let free = vm.phys().free_count();
        let object = vm.anon_object(2 * PAGE);
        let page = object.page_alloc(0).unwrap();
        vm.phys().unpin(page);
        let id = object.id();
        drop(object);
        assert_eq!(vm.phys().free_count(), free);
        assert!(vm.pghash().lookup(id, 0).is_none());
    }
}
