//! Boot-stage tracking.

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Initialization stages, completed in declaration order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InitFlags: u8 {
        /// Segments registered; early allocation and early mapping are usable.
        const PHYS_EARLY = 1 << 0;
        /// The kernel MMU context exists.
        const MMU = 1 << 1;
        /// The kernel virtual memory allocator is usable.
        const VMEM = 1 << 2;
        /// The kernel heap is usable.
        const KMALLOC = 1 << 3;
        /// The buddy allocator owns all free memory.
        const PHYS = 1 << 4;
    }
}

/// The set of completed init stages.
#[derive(Debug, Default)]
pub struct InitState(AtomicU8);

impl InitState {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Records that `stage` has completed. Completing a stage twice is fatal.
    pub fn mark(&self, stage: InitFlags) {
        let old = InitFlags::from_bits_retain(self.0.fetch_or(stage.bits(), Ordering::AcqRel));
        assert!(!old.intersects(stage), "init stage {stage:?} completed twice");
        log::debug!("vm init: {stage:?} ready");
    }

    pub fn is_ready(&self, stages: InitFlags) -> bool {
        self.current().contains(stages)
    }

    pub fn current(&self) -> InitFlags {
        InitFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Panics unless every stage in `stages` has completed.
    #[track_caller]
    pub fn assert_ready(&self, stages: InitFlags) {
        let current = self.current();
        assert!(
            current.contains(stages),
            "vm used before {:?} init (ready: {current:?})",
            stages - current
        );
    }

    /// Panics if any stage in `stages` has already completed.
    #[track_caller]
    pub fn assert_not_ready(&self, stages: InitFlags) {
        let current = self.current();
        assert!(
            !current.intersects(stages),
            "vm stage {:?} already initialized",
            current & stages
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_accumulate() {
        let init = InitState::new();
        init.mark(InitFlags::PHYS_EARLY);
        init.mark(InitFlags::MMU);
        assert!(init.is_ready(InitFlags::PHYS_EARLY | InitFlags::MMU));
        assert!(!init.is_ready(InitFlags::VMEM));
        init.assert_not_ready(InitFlags::VMEM);
    }

    #[test]
    #[should_panic(expected = "vm used before")]
    fn misordered_use_is_fatal() {
        let init = InitState::new();
        init.mark(InitFlags::PHYS_EARLY);
        init.assert_ready(InitFlags::PHYS_EARLY | InitFlags::KMALLOC);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_init_is_fatal() {
        let init = InitState::new();
        init.mark(InitFlags::MMU);
        init.mark(InitFlags::MMU);
    }
}
