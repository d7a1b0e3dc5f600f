use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::ObjectId;

/// Order value for frames that do not head a buddy block.
pub const ORDER_NONE: u8 = 0xFF;

/// Owner value for frames not owned by any object.
const NO_OWNER: u64 = u64::MAX;

/// What a frame is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// On a buddy free list (only the head frame of a free block is marked).
    Free = 0,
    /// Never allocatable: boot reservations, early allocations, holes.
    Reserved = 1,
    /// Allocated, not owned by an object.
    Normal = 2,
    /// Resident page of an object.
    Object = 3,
    /// Being written back and unmapped.
    Pageout = 4,
}

impl FrameState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Reserved,
            2 => Self::Normal,
            3 => Self::Object,
            4 => Self::Pageout,
            _ => panic!("corrupt frame state {raw}"),
        }
    }
}

/// Holds metadata for a physical memory frame.
///
/// Modeled after Linux's `struct page`. Only the first frame of an allocated block carries
/// meaningful state; the others stay `Reserved`/`Free` with `ORDER_NONE`.
pub struct Frame {
    pub flags: FrameFlags,
    state: AtomicU8,
    order: AtomicU8,
    pins: AtomicU32,
    owner: AtomicU64,
    offset: AtomicU64,
}

impl Frame {
    pub fn state(&self) -> FrameState {
        FrameState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: FrameState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Gets the buddy order of the block this frame heads.
    pub fn order(&self) -> u8 {
        self.order.load(Ordering::Acquire)
    }

    pub fn set_order(&self, order: u8) {
        self.order.store(order, Ordering::Release);
    }

    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Takes a pin and returns the new count.
    pub fn pin(&self) -> u32 {
        self.pins.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a pin and returns the new count.
    pub fn unpin(&self) -> u32 {
        let old = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "frame unpinned more often than pinned");
        old - 1
    }

    /// Records the object and offset this frame backs.
    pub fn set_owner(&self, owner: Option<(ObjectId, u64)>) {
        match owner {
            Some((object, offset)) => {
                self.offset.store(offset, Ordering::Release);
                self.owner.store(object.0, Ordering::Release);
            }
            None => self.owner.store(NO_OWNER, Ordering::Release),
        }
    }

    pub fn owner(&self) -> Option<(ObjectId, u64)> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some((ObjectId(id), self.offset.load(Ordering::Acquire))),
        }
    }

    /// Resets per-allocation state when a block is handed out.
    pub(crate) fn reset(&self, state: FrameState, order: u8) {
        self.flags.reset();
        self.pins.store(0, Ordering::Release);
        self.owner.store(NO_OWNER, Ordering::Release);
        self.set_order(order);
        self.set_state(state);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            state: AtomicU8::new(FrameState::Reserved as u8),
            order: AtomicU8::new(ORDER_NONE),
            pins: AtomicU32::new(0),
            owner: AtomicU64::new(NO_OWNER),
            offset: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Contents differ from the backing store.
    Dirty = 1 << 0,
    /// A pagein or pageout is in progress; other users must wait.
    Busy = 1 << 1,
    /// The last pagein failed; waiters must not use the contents.
    Error = 1 << 2,
    /// Free the frame when its last pin is dropped.
    Dealloc = 1 << 3,
}

/// Atomic flags for a physical memory frame.
#[derive(Debug, Default)]
pub struct FrameFlags(AtomicU8);

impl FrameFlags {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u8, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u8), Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u8 != 0
    }

    /// Tests the given flag and sets it atomically, returning the previous value.
    pub fn atomic_test_and_set(&self, flag: FrameFlag) -> bool {
        self.0.fetch_or(flag as u8, Ordering::AcqRel) & flag as u8 != 0
    }

    /// Tests the given flag and clears it atomically, returning the previous value.
    pub fn atomic_test_and_clear(&self, flag: FrameFlag) -> bool {
        self.0.fetch_and(!(flag as u8), Ordering::AcqRel) & flag as u8 != 0
    }
}
