//! Services the VM core needs from the scheduler and the SMP layer.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{VirtualAddress, VmError};

/// A set of CPUs, one bit per CPU index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuSet(u32);

impl CpuSet {
    /// Largest number of CPUs a set can describe.
    pub const MAX: usize = u32::BITS as usize;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set of CPUs `0..count`.
    pub fn all(count: usize) -> Self {
        assert!(count <= Self::MAX, "too many CPUs");
        match count {
            Self::MAX => Self(u32::MAX),
            n => Self((1u32 << n) - 1),
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < Self::MAX && self.0 & (1 << cpu) != 0
    }

    pub const fn with(self, cpu: usize) -> Self {
        Self(self.0 | (1 << cpu))
    }

    pub const fn without(self, cpu: usize) -> Self {
        Self(self.0 & !(1 << cpu))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..Self::MAX).filter(move |&cpu| self.contains(cpu))
    }
}

/// Scheduler and interprocessor services supplied by the kernel embedding the VM.
pub trait Platform: Send + Sync {
    /// Index of the CPU the caller runs on.
    fn cpu_id(&self) -> usize;

    fn cpu_count(&self) -> usize;

    /// Gives up the CPU while a blocking operation waits.
    fn yield_now(&self);

    /// Returns true if the current thread has a signal that should abort a blocking wait.
    fn signal_pending(&self) -> bool {
        false
    }

    /// Invalidates `[addr, addr + size)` in the TLBs of `cpus` and returns only once
    /// every target has done so.
    fn shootdown(&self, cpus: CpuSet, addr: VirtualAddress, size: usize);
}

/// A wait queue for blocking VM operations.
///
/// Waiters poll their condition and yield between polls; wakers bump a generation
/// counter so a waiter can also block until "something happened" without a condition.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: AtomicUsize,
    waiters: AtomicUsize,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Snapshot to pass to [`WaitQueue::wait_for_wake`]. Take it before checking the
    /// condition that made the caller decide to wait, or a wake may be missed.
    pub fn ticket(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Wakes every current waiter.
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of threads blocked on this queue.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Blocks until `cond` holds. A pending signal aborts the wait.
    pub fn wait_until(
        &self,
        platform: &dyn Platform,
        mut cond: impl FnMut() -> bool,
    ) -> Result<(), VmError> {
        let _guard = self.enter();
        loop {
            if cond() {
                return Ok(());
            }
            if platform.signal_pending() {
                return Err(VmError::Interrupted);
            }
            platform.yield_now();
        }
    }

    /// Blocks until `cond` holds, ignoring signals. Used where giving up would leave a
    /// half-finished page operation behind.
    pub fn wait_until_uninterruptible(&self, platform: &dyn Platform, mut cond: impl FnMut() -> bool) {
        let _guard = self.enter();
        while !cond() {
            platform.yield_now();
        }
    }

    /// Blocks until the queue is woken after `ticket` was taken.
    pub fn wait_for_wake(&self, platform: &dyn Platform, ticket: usize) -> Result<(), VmError> {
        self.wait_until(platform, || self.ticket() != ticket)
    }

    fn enter(&self) -> WaiterGuard<'_> {
        self.waiters.fetch_add(1, Ordering::Relaxed);
        WaiterGuard(&self.waiters)
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn cpu_sets() {
        let set = CpuSet::all(3);
        assert!(set.contains(0) && set.contains(2));
        assert!(!set.contains(3));
        assert_eq!(set.without(1).iter().collect::<Vec<_>>(), vec![0, 2]);
        assert!(CpuSet::empty().is_empty());
        assert_eq!(CpuSet::all(32).bits(), u32::MAX);
    }

    #[test]
    fn wake_releases_waiter() {
        let platform = Arc::new(TestPlatform::new(2));
        let queue = Arc::new(WaitQueue::new());
        let ticket = queue.ticket();

        let waiter = {
            let (platform, queue) = (platform.clone(), queue.clone());
            std::thread::spawn(move || queue.wait_for_wake(&*platform, ticket))
        };
        while queue.waiters() == 0 {
            std::thread::yield_now();
        }
        queue.wake_all();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn pending_signal_interrupts_wait() {
        let platform = TestPlatform::new(1);
        platform.raise_signal();
        let queue = WaitQueue::new();
        let never = AtomicBool::new(false);
        assert_eq!(
            queue.wait_until(&platform, || never.load(Ordering::Relaxed)),
            Err(VmError::Interrupted)
        );
    }
}
