//! Physical page allocator.
//!
//! A binary buddy allocator over the segments registered at boot. Order `n` blocks are
//! `2^n` contiguous frames; orders run from 0 to [`MAX_ORDER`] (a 4MiB block on i386).
//! Free blocks are kept in address-ordered sets, so allocation always splits the
//! lowest-addressed block of the smallest order that fits.
//!
//! Before the allocator is initialized, single frames are carved out of the early
//! allocator through [`PhysicalAllocator::alloc_phys`].

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{PAGE_SHIFT, PAGE_SIZE, TableAllocator};
use crate::frame::{Frame, FrameFlag, FrameState, ORDER_NONE};
use crate::{
    AddressTranslator, EarlyAllocator, FrameNumber, HumanSize, InitFlags, InitState,
    MemoryType, PhysicalAddress, Pressure, VmError, VmFlags, WaitQueue,
};

/// Largest buddy order.
pub const MAX_ORDER: usize = 10;

const NUM_ORDERS: usize = MAX_ORDER + 1;

/// Handle to an allocated block, named by its first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page(FrameNumber);

impl Page {
    pub(crate) const fn from_frame(frame: FrameNumber) -> Self {
        Self(frame)
    }

    pub const fn frame(self) -> FrameNumber {
        self.0
    }

    /// Page index of the block.
    pub const fn addr(self) -> usize {
        self.0.as_usize()
    }

    /// Physical address of the block (`addr * PAGE_SIZE`).
    pub const fn phys(self) -> PhysicalAddress {
        self.0.start()
    }
}

struct Segment {
    base: FrameNumber,
    frames: Box<[Frame]>,
}

impl Segment {
    fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.base && frame - self.base < self.frames.len()
    }

    fn end(&self) -> FrameNumber {
        self.base + self.frames.len()
    }
}

struct FreeLists {
    lists: [BTreeSet<FrameNumber>; NUM_ORDERS],
    free_frames: usize,
}

/// The buddy allocator and the frame metadata for all managed memory.
pub struct PhysicalAllocator {
    memory: AddressTranslator,
    pressure: Arc<Pressure>,
    init: Arc<InitState>,
    early: spin::Mutex<EarlyAllocator>,
    segments: spin::Once<Box<[Segment]>>,
    free: spin::Mutex<FreeLists>,
    total_frames: AtomicUsize,
    page_wait: WaitQueue,
}

impl PhysicalAllocator {
    pub fn new(memory: AddressTranslator, pressure: Arc<Pressure>, init: Arc<InitState>) -> Self {
        Self {
            memory,
            pressure,
            init,
            early: spin::Mutex::new(EarlyAllocator::new()),
            segments: spin::Once::new(),
            free: spin::Mutex::new(FreeLists {
                lists: Default::default(),
                free_frames: 0,
            }),
            total_frames: AtomicUsize::new(0),
            page_wait: WaitQueue::new(),
        }
    }

    /// Registers a range of usable physical memory.
    pub fn add_segment(&self, base: PhysicalAddress, size: usize) {
        self.init.assert_not_ready(InitFlags::PHYS_EARLY);
        self.early.lock().add_segment(base, size);
    }

    /// Marks a range permanently unavailable (kernel image, boot data, firmware tables).
    pub fn reserve(&self, base: PhysicalAddress, size: usize, name: &'static str) {
        self.init.assert_not_ready(InitFlags::PHYS);
        self.early.lock().reserve(base, size, name);
    }

    /// Completes segment discovery. Early allocation is usable afterwards.
    pub fn init_early(&self) {
        self.init.assert_not_ready(InitFlags::PHYS_EARLY);
        let total = self.early.lock().total_memory();
        self.pressure.init(MemoryType::Phys, total, 0);
        self.init.mark(InitFlags::PHYS_EARLY);
    }

    /// Builds the frame metadata and hands every unreserved frame to the buddy lists.
    ///
    /// Needs the kernel heap.
    pub fn init(&self) {
        self.init
            .assert_ready(InitFlags::PHYS_EARLY | InitFlags::KMALLOC);
        self.init.assert_not_ready(InitFlags::PHYS);

        let early = self.early.lock();
        let segments: Vec<Segment> = early
            .segments()
            .map(|region| Segment {
                base: region.base().frame_number(),
                frames: (0..region.size() >> PAGE_SHIFT)
                    .map(|_| Frame::default())
                    .collect(),
            })
            .collect();
        let segments = self.segments.call_once(|| segments.into_boxed_slice());

        let mut released = 0;
        for segment in segments.iter() {
            let mut frame = segment.base;
            while frame < segment.end() {
                if early.is_reserved(frame.start()) {
                    frame = frame + 1;
                    continue;
                }
                let mut order = 0;
                while order < MAX_ORDER
                    && frame.is_order_aligned(order + 1)
                    && (frame + (2 << order)) <= segment.end()
                    && !(1..2usize << order)
                        .any(|i| early.is_reserved((frame + i).start()))
                {
                    order += 1;
                }
                for i in 0..1usize << order {
                    self.frame_at(frame + i).set_state(FrameState::Free);
                }
                self.release_block(frame, order);
                released += 1 << order;
                frame = frame + (1 << order);
            }
        }
        drop(early);

        self.total_frames.store(released, Ordering::Release);
        self.pressure
            .add(MemoryType::Phys, (released * PAGE_SIZE) as isize);
        log::info!(
            "phys: {} managed, {} available",
            HumanSize(self.pressure.total(MemoryType::Phys)),
            HumanSize(released * PAGE_SIZE)
        );
        self.init.mark(InitFlags::PHYS);
    }

    /// Allocates one frame.
    pub fn alloc(&self, flags: VmFlags) -> Result<Page, VmError> {
        self.alloc_order(0, flags)
    }

    /// Allocates `2^order` contiguous frames.
    ///
    /// With `WAIT`, blocks until memory is available: on the PHYS pressure counter when
    /// too little is free, or for the next free when fragmentation is the problem.
    pub fn alloc_order(&self, order: usize, flags: VmFlags) -> Result<Page, VmError> {
        self.init.assert_ready(InitFlags::PHYS);
        assert!(order <= MAX_ORDER, "order {order} exceeds maximum {MAX_ORDER}");
        let bytes = PAGE_SIZE << order;
        loop {
            let ticket = self.pressure.free_ticket(MemoryType::Phys);
            if let Some(page) = self.try_alloc(order) {
                if flags.contains(VmFlags::ZERO) {
                    self.zero(page);
                }
                return Ok(page);
            }
            if !flags.contains(VmFlags::WAIT) {
                return Err(VmError::OutOfMemory);
            }
            if self.pressure.mem_wait_p(MemoryType::Phys, bytes) {
                self.pressure.mem_wait(MemoryType::Phys, bytes)?;
            } else {
                self.pressure.mem_wait_free(MemoryType::Phys, ticket)?;
            }
        }
    }

    fn try_alloc(&self, order: usize) -> Option<Page> {
        let mut free = self.free.lock();
        let found = (order..NUM_ORDERS).find(|&o| !free.lists[o].is_empty())?;
        let head = free.lists[found].pop_first()?;
        for split in (order..found).rev() {
            let buddy = head + (1 << split);
            self.frame_at(buddy).set_order(split as u8);
            free.lists[split].insert(buddy);
        }
        free.free_frames -= 1 << order;
        self.frame_at(head).reset(FrameState::Normal, order as u8);
        drop(free);

        self.pressure
            .add(MemoryType::Phys, -((PAGE_SIZE << order) as isize));
        #[cfg(feature = "detailed-logging")]
        log::trace!("phys: alloc {:?} order {}", head.start(), order);
        Some(Page(head))
    }

    /// Returns a block to the free lists.
    ///
    /// # Panics
    ///
    /// Panics on a double free, on freeing a reserved frame and on freeing a pinned page.
    pub fn free(&self, page: Page) {
        let frame = self.frame(page);
        match frame.state() {
            FrameState::Free => panic!("double free of {:?}", page.phys()),
            FrameState::Reserved => panic!("free of reserved frame {:?}", page.phys()),
            _ => {}
        }
        assert_eq!(frame.pins(), 0, "free of pinned page {:?}", page.phys());
        let order = frame.order() as usize;
        assert!(order <= MAX_ORDER, "corrupt order on {:?}", page.phys());

        frame.set_owner(None);
        frame.set_state(FrameState::Free);
        self.release_block(page.frame(), order);
        self.pressure
            .add(MemoryType::Phys, (PAGE_SIZE << order) as isize);
        #[cfg(feature = "detailed-logging")]
        log::trace!("phys: free {:?} order {}", page.phys(), order);
    }

    /// Inserts a block into the free lists, coalescing with free buddies.
    fn release_block(&self, frame: FrameNumber, order: usize) {
        let segment = self.segment_of(frame);
        let mut free = self.free.lock();
        free.free_frames += 1 << order;

        let (mut head, mut order) = (frame, order);
        while order < MAX_ORDER {
            let buddy = head.buddy(order);
            if !segment.contains(buddy) {
                break;
            }
            let meta = self.frame_at(buddy);
            if meta.state() != FrameState::Free || meta.order() as usize != order {
                break;
            }
            if !free.lists[order].remove(&buddy) {
                break;
            }
            let upper = head.max(buddy);
            self.frame_at(upper).set_order(ORDER_NONE);
            head = head.min(buddy);
            order += 1;
        }
        self.frame_at(head).set_order(order as u8);
        free.lists[order].insert(head);
    }

    /// Size of an allocated block in bytes.
    pub fn size(&self, page: Page) -> usize {
        PAGE_SIZE << self.frame(page).order()
    }

    /// Frames handed to the buddy allocator.
    pub fn total(&self) -> usize {
        self.total_frames.load(Ordering::Acquire)
    }

    /// Frames currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().free_frames
    }

    pub fn free_blocks_at_order(&self, order: usize) -> usize {
        self.free
            .lock()
            .lists
            .get(order)
            .map_or(0, BTreeSet::len)
    }

    /// Allocates one frame and returns its address, or [`PhysicalAddress::ERR`].
    ///
    /// Usable from `PHYS_EARLY` on; frames taken before `PHYS` come from the early
    /// allocator and stay reserved.
    pub fn alloc_phys(&self, flags: VmFlags) -> PhysicalAddress {
        if self.init.is_ready(InitFlags::PHYS) {
            return match self.alloc(flags) {
                Ok(page) => page.phys(),
                Err(_) => PhysicalAddress::ERR,
            };
        }
        self.init.assert_ready(InitFlags::PHYS_EARLY);
        let Some(addr) = self.early.lock().allocate(PAGE_SIZE, PAGE_SIZE) else {
            log::warn!("phys: early allocation failed");
            return PhysicalAddress::ERR;
        };
        if flags.contains(VmFlags::ZERO) {
            self.memory.fill(addr, PAGE_SIZE, 0);
        }
        addr
    }

    /// Frees a frame returned by [`PhysicalAllocator::alloc_phys`].
    pub fn free_phys(&self, addr: PhysicalAddress) {
        assert!(!addr.is_err(), "free of VM_PHYS_ERR");
        if !self.init.is_ready(InitFlags::PHYS) {
            self.early.lock().free(addr, PAGE_SIZE);
            return;
        }
        let page = self.page_of(addr);
        let frame = self.frame(page);
        if frame.state() == FrameState::Reserved {
            let mut early = self.early.lock();
            assert!(early.is_reserved(addr), "free of unmanaged frame {addr:?}");
            early.free(addr, PAGE_SIZE);
            drop(early);
            frame.set_state(FrameState::Free);
            self.total_frames.fetch_add(1, Ordering::AcqRel);
            self.release_block(page.frame(), 0);
            self.pressure.add(MemoryType::Phys, PAGE_SIZE as isize);
            return;
        }
        self.free(page);
    }

    /// Returns the page handle for a physical address inside a managed segment.
    pub fn page_of(&self, addr: PhysicalAddress) -> Page {
        Page(addr.frame_number())
    }

    fn segments(&self) -> &[Segment] {
        match self.segments.get() {
            Some(segments) => segments,
            None => panic!("physical allocator used before PHYS init"),
        }
    }

    fn segment_of(&self, frame: FrameNumber) -> &Segment {
        match self.segments().iter().find(|s| s.contains(frame)) {
            Some(segment) => segment,
            None => panic!("frame {frame} outside managed memory"),
        }
    }

    fn frame_at(&self, frame: FrameNumber) -> &Frame {
        let segment = self.segment_of(frame);
        &segment.frames[frame - segment.base]
    }

    /// Metadata of the first frame of a block.
    pub fn frame(&self, page: Page) -> &Frame {
        self.frame_at(page.frame())
    }

    pub fn pin(&self, page: Page) {
        self.frame(page).pin();
    }

    /// Drops a pin. The last unpin of a page marked for deallocation frees it.
    pub fn unpin(&self, page: Page) {
        let frame = self.frame(page);
        if frame.unpin() == 0 && frame.flags.atomic_test_and_clear(FrameFlag::Dealloc) {
            self.free(page);
        }
    }

    /// Frees the page now if nobody pins it, otherwise on its last unpin.
    pub fn release(&self, page: Page) {
        let frame = self.frame(page);
        frame.flags.atomic_set(FrameFlag::Dealloc);
        if frame.pins() == 0 && frame.flags.atomic_test_and_clear(FrameFlag::Dealloc) {
            self.free(page);
        }
    }

    pub fn set_busy(&self, page: Page) {
        self.frame(page).flags.atomic_set(FrameFlag::Busy);
    }

    pub fn is_busy(&self, page: Page) -> bool {
        self.frame(page).flags.atomic_test(FrameFlag::Busy)
    }

    /// Clears the busy bit and wakes everyone waiting on a busy page.
    pub fn unbusy(&self, page: Page) {
        self.frame(page).flags.atomic_clear(FrameFlag::Busy);
        self.page_wait.wake_all();
    }

    /// Marks the page's contents unusable and wakes waiters.
    pub fn set_error(&self, page: Page) {
        let frame = self.frame(page);
        frame.flags.atomic_set(FrameFlag::Error);
        frame.flags.atomic_clear(FrameFlag::Busy);
        self.page_wait.wake_all();
    }

    /// Waits for a pinned page to stop being busy. Returns false if the pagein that
    /// held it busy failed.
    pub fn wait_unbusy(&self, page: Page) -> bool {
        let frame = self.frame(page);
        self.page_wait
            .wait_until_uninterruptible(self.pressure.platform(), || {
                !frame.flags.atomic_test(FrameFlag::Busy)
            });
        !frame.flags.atomic_test(FrameFlag::Error)
    }

    pub fn dirty(&self, page: Page) {
        self.frame(page).flags.atomic_set(FrameFlag::Dirty);
    }

    /// Clears the dirty bit, returning whether it was set.
    pub fn take_dirty(&self, page: Page) -> bool {
        self.frame(page).flags.atomic_test_and_clear(FrameFlag::Dirty)
    }

    pub fn zero(&self, page: Page) {
        self.memory.fill(page.phys(), self.size(page), 0);
    }

    /// Copies a whole block; both blocks must be the same size.
    pub fn copy(&self, dst: Page, src: Page) {
        let size = self.size(src);
        assert_eq!(self.size(dst), size, "copy between blocks of different size");
        self.memory.copy(dst.phys(), src.phys(), size);
    }

    pub fn read(&self, page: Page, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.size(page), "read past end of page");
        self.memory.read(page.phys() + offset, buf);
    }

    pub fn write(&self, page: Page, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size(page), "write past end of page");
        self.memory.write(page.phys() + offset, data);
    }

    /// Contents of a block as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive use of the page (it is busy, or not yet visible to
    /// any object or mapping) for the lifetime of the slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, page: Page) -> &mut [u8] {
        let size = self.size(page);
        self.memory.assert_backed(page.phys(), size);
        // SAFETY: the block is backed by `size` bytes of memory and the caller
        // guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.memory.phys_to_ptr(page.phys()), size) }
    }

    /// Contents of a block as a slice.
    ///
    /// # Safety
    ///
    /// Nothing may write the page for the lifetime of the slice.
    pub unsafe fn bytes(&self, page: Page) -> &[u8] {
        let size = self.size(page);
        self.memory.assert_backed(page.phys(), size);
        // SAFETY: as for `bytes_mut`.
        unsafe { core::slice::from_raw_parts(self.memory.phys_to_ptr(page.phys()), size) }
    }

    pub fn memory(&self) -> &AddressTranslator {
        &self.memory
    }

    pub fn pressure(&self) -> &Arc<Pressure> {
        &self.pressure
    }

    pub(crate) fn init_state(&self) -> &InitState {
        &self.init
    }
}

impl TableAllocator for PhysicalAllocator {
    fn alloc_table(&self) -> Result<PhysicalAddress, VmError> {
        match self.alloc_phys(VmFlags::ZERO) {
            addr if addr.is_err() => Err(VmError::OutOfMemory),
            addr => Ok(addr),
        }
    }

    fn free_table(&self, table: PhysicalAddress) {
        self.free_phys(table);
    }

    fn table_ptr(&self, table: PhysicalAddress) -> *mut u8 {
        self.memory.phys_to_ptr(table)
    }
}
