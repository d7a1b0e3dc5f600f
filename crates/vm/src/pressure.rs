//! Memory pressure governor.
//!
//! Tracks free capacity of kernel virtual memory and of physical memory, maps it to a
//! coarse pressure level and lets allocators block until capacity returns.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::{HumanSize, Platform, PressureConfig, VmError, WaitQueue};

/// A pool whose free capacity is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Kernel virtual address space managed by vmem.
    Kern = 0,
    /// Physical frames managed by the buddy allocator.
    Phys = 1,
}

impl MemoryType {
    const ALL: [MemoryType; 2] = [MemoryType::Kern, MemoryType::Phys];
}

bitflags! {
    /// A selection of memory pools.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryTypes: u8 {
        const KERN = 1 << MemoryType::Kern as u8;
        const PHYS = 1 << MemoryType::Phys as u8;
    }
}

impl From<MemoryType> for MemoryTypes {
    fn from(ty: MemoryType) -> Self {
        Self::from_bits_retain(1 << ty as u8)
    }
}

/// Qualitative free-memory level, ordered from least to most constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Low,
    Moderate,
    High,
}

#[derive(Default)]
struct Counter {
    total: AtomicUsize,
    free: AtomicUsize,
    freed: WaitQueue,
}

/// Per-pool free-capacity counters.
///
/// Counters are lock-free; every allocation and free in vmem and the physical allocator
/// is paired with one [`Pressure::add`].
pub struct Pressure {
    config: PressureConfig,
    counters: [Counter; 2],
    changed: WaitQueue,
    platform: Arc<dyn Platform>,
}

impl Pressure {
    pub fn new(config: PressureConfig, platform: Arc<dyn Platform>) -> Self {
        Self {
            config,
            counters: Default::default(),
            changed: WaitQueue::new(),
            platform,
        }
    }

    fn counter(&self, ty: MemoryType) -> &Counter {
        &self.counters[ty as usize]
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    /// Sets the capacity of a pool.
    pub fn init(&self, ty: MemoryType, total: usize, free: usize) {
        assert!(free <= total, "{ty:?} pool starts with more free than total");
        let counter = self.counter(ty);
        counter.total.store(total, Ordering::Release);
        counter.free.store(free, Ordering::Release);
        log::debug!(
            "pressure: {ty:?} pool {} ({} free)",
            HumanSize(total),
            HumanSize(free)
        );
        self.changed.wake_all();
    }

    /// Adjusts the free capacity of a pool by `delta` bytes.
    ///
    /// Freeing wakes waiters of the pool.
    pub fn add(&self, ty: MemoryType, delta: isize) {
        let counter = self.counter(ty);
        let total = counter.total.load(Ordering::Acquire);
        let result = counter
            .free
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| {
                free.checked_add_signed(delta).filter(|&new| new <= total)
            });
        if let Err(free) = result {
            panic!("{ty:?} pressure counter out of range: {free} free of {total}, delta {delta}");
        }
        if delta > 0 {
            counter.freed.wake_all();
        }
        self.changed.wake_all();
    }

    pub fn free(&self, ty: MemoryType) -> usize {
        self.counter(ty).free.load(Ordering::Acquire)
    }

    pub fn total(&self, ty: MemoryType) -> usize {
        self.counter(ty).total.load(Ordering::Acquire)
    }

    /// Pressure level of a single pool. An empty pool is always under high pressure.
    pub fn level(&self, ty: MemoryType) -> PressureLevel {
        let total = self.total(ty);
        let free = self.free(ty);
        if total == 0 {
            return PressureLevel::High;
        }
        // Widen so percentages of large pools cannot overflow on 32-bit targets.
        let free_pct = free as u64 * 100;
        let total = total as u64;
        if free_pct >= total * self.config.low_percent as u64 {
            PressureLevel::Low
        } else if free_pct >= total * self.config.moderate_percent as u64 {
            PressureLevel::Moderate
        } else {
            PressureLevel::High
        }
    }

    /// Highest pressure level among the selected pools.
    pub fn pressure(&self, types: MemoryTypes) -> PressureLevel {
        MemoryType::ALL
            .into_iter()
            .filter(|&ty| types.contains(ty.into()))
            .map(|ty| self.level(ty))
            .max()
            .unwrap_or(PressureLevel::Low)
    }

    /// Blocks until the pressure of the selected pools is at or below `level`.
    pub fn wait(&self, types: MemoryTypes, level: PressureLevel) -> Result<(), VmError> {
        self.changed
            .wait_until(self.platform(), || self.pressure(types) <= level)
    }

    /// Blocks until `pred` holds, re-evaluating it whenever a counter changes.
    pub fn wait_for(&self, mut pred: impl FnMut(&Self) -> bool) -> Result<(), VmError> {
        self.changed.wait_until(self.platform(), || pred(self))
    }

    fn reserve(&self, ty: MemoryType) -> usize {
        match ty {
            MemoryType::Kern => self.config.kern_reserve,
            MemoryType::Phys => self.config.phys_reserve,
        }
    }

    /// Returns true if a request of `size` bytes would have to wait for memory.
    pub fn mem_wait_p(&self, ty: MemoryType, size: usize) -> bool {
        self.free(ty) < size.saturating_add(self.reserve(ty))
    }

    /// Blocks until at least `size` bytes (plus the pool's reserve) are free.
    ///
    /// Fails immediately if the pool could never satisfy the request.
    pub fn mem_wait(&self, ty: MemoryType, size: usize) -> Result<(), VmError> {
        if size.saturating_add(self.reserve(ty)) > self.total(ty) {
            return Err(VmError::OutOfMemory);
        }
        #[cfg(feature = "detailed-logging")]
        log::trace!("pressure: waiting for {} of {ty:?}", HumanSize(size));
        self.counter(ty)
            .freed
            .wait_until(self.platform(), || !self.mem_wait_p(ty, size))
    }

    /// Ticket for [`Pressure::mem_wait_free`]; take it before the failed attempt.
    pub fn free_ticket(&self, ty: MemoryType) -> usize {
        self.counter(ty).freed.ticket()
    }

    /// Blocks until anything is freed to the pool after `ticket` was taken.
    ///
    /// Used when enough memory is free in total but fragmentation defeats the request.
    pub fn mem_wait_free(&self, ty: MemoryType, ticket: usize) -> Result<(), VmError> {
        self.counter(ty)
            .freed
            .wait_for_wake(self.platform(), ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;
    use std::sync::atomic::AtomicBool;

    fn pressure() -> Arc<Pressure> {
        Arc::new(Pressure::new(
            PressureConfig::default(),
            Arc::new(TestPlatform::new(2)),
        ))
    }

    #[test]
    fn levels_follow_thresholds() {
        let p = pressure();
        p.init(MemoryType::Phys, 100, 100);
        assert_eq!(p.level(MemoryType::Phys), PressureLevel::Low);

        p.add(MemoryType::Phys, -51);
        assert_eq!(p.level(MemoryType::Phys), PressureLevel::Moderate);

        p.add(MemoryType::Phys, -20);
        assert_eq!(p.level(MemoryType::Phys), PressureLevel::High);
    }

    #[test]
    fn waits_are_interrupted_by_a_signal() {
        let platform = Arc::new(TestPlatform::new(1));
        let p = Pressure::new(PressureConfig::default(), platform.clone());
        p.init(MemoryType::Phys, 100, 10);
        platform.raise_signal();

        assert_eq!(
            p.wait(MemoryTypes::PHYS, PressureLevel::Moderate),
            Err(VmError::Interrupted)
        );
        assert_eq!(p.mem_wait(MemoryType::Phys, 50), Err(VmError::Interrupted));
        // Conditions that already hold never block.
        assert_eq!(p.wait(MemoryTypes::PHYS, PressureLevel::High), Ok(()));
    }

    #[test]
    fn empty_pool_is_high() {
        let p = pressure();
        assert_eq!(p.level(MemoryType::Kern), PressureLevel::High);
    }

    #[test]
    fn combined_pressure_is_the_worst_pool() {
        let p = pressure();
        p.init(MemoryType::Kern, 100, 100);
        p.init(MemoryType::Phys, 100, 10);
        assert_eq!(p.pressure(MemoryTypes::KERN), PressureLevel::Low);
        assert_eq!(p.pressure(MemoryTypes::all()), PressureLevel::High);
        assert_eq!(p.pressure(MemoryTypes::empty()), PressureLevel::Low);
    }

    #[test]
    #[should_panic(expected = "counter out of range")]
    fn underflow_is_fatal() {
        let p = pressure();
        p.init(MemoryType::Kern, 10, 5);
        p.add(MemoryType::Kern, -6);
    }

    #[test]
    #[should_panic(expected = "counter out of range")]
    fn overflow_past_total_is_fatal() {
        let p = pressure();
        p.init(MemoryType::Kern, 10, 5);
        p.add(MemoryType::Kern, 6);
    }

    #[test]
    fn freeing_unblocks_moderate_waiter() {
        let p = pressure();
        p.init(MemoryType::Phys, 100, 100);
        for _ in 0..8 {
            p.add(MemoryType::Phys, -10);
        }
        assert_eq!(p.pressure(MemoryTypes::PHYS), PressureLevel::High);

        let done = Arc::new(AtomicBool::new(false));
        let waiter = {
            let (p, done) = (p.clone(), done.clone());
            std::thread::spawn(move || {
                let result = p.wait(MemoryTypes::PHYS, PressureLevel::Moderate);
                done.store(true, Ordering::SeqCst);
                result
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst));

        p.add(MemoryType::Phys, 20);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(p.pressure(MemoryTypes::PHYS), PressureLevel::Moderate);
    }

    #[test]
    fn mem_wait_respects_reserve() {
        let platform = Arc::new(TestPlatform::new(1));
        let config = PressureConfig {
            kern_reserve: 4,
            ..PressureConfig::default()
        };
        let p = Pressure::new(config, platform);
        p.init(MemoryType::Kern, 16, 8);
        assert!(!p.mem_wait_p(MemoryType::Kern, 4));
        assert!(p.mem_wait_p(MemoryType::Kern, 5));
        assert_eq!(p.mem_wait(MemoryType::Kern, 4), Ok(()));
        assert_eq!(p.mem_wait(MemoryType::Kern, 13), Err(VmError::OutOfMemory));
    }

    #[test]
    fn mem_wait_free_sees_later_free() {
        let p = pressure();
        p.init(MemoryType::Phys, 64, 0);
        let ticket = p.free_ticket(MemoryType::Phys);
        p.add(MemoryType::Phys, 16);
        assert_eq!(p.mem_wait_free(MemoryType::Phys, ticket), Ok(()));
    }
}
