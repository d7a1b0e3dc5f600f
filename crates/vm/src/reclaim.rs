//! Reclaim callback registry.
//!
//! Subsystems holding reclaimable memory (page caches, object pools) register a
//! callback that tries to free some of it and reports whether it did. Callbacks run
//! round-robin so no single cache is drained first every time.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{MemoryTypes, Pressure, PressureLevel};

/// Handle returned by [`Reclaim::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimId(u64);

type ReclaimFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct Reclaimer {
    id: ReclaimId,
    name: &'static str,
    func: ReclaimFn,
}

#[derive(Default)]
pub struct Reclaim {
    reclaimers: spin::Mutex<VecDeque<Reclaimer>>,
    next_id: AtomicU64,
}

impl Reclaim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. It returns true if it freed anything.
    pub fn add(&self, name: &'static str, func: impl Fn() -> bool + Send + Sync + 'static) -> ReclaimId {
        let id = ReclaimId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.reclaimers.lock().push_back(Reclaimer {
            id,
            name,
            func: Arc::new(func),
        });
        log::debug!("reclaim: registered {name}");
        id
    }

    /// Unregisters a callback. Returns false if it was not registered.
    pub fn remove(&self, id: ReclaimId) -> bool {
        let mut reclaimers = self.reclaimers.lock();
        match reclaimers.iter().position(|r| r.id == id) {
            Some(pos) => {
                reclaimers.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.reclaimers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the registered callbacks in the order they will next run.
    pub fn names(&self) -> Vec<&'static str> {
        self.reclaimers.lock().iter().map(|r| r.name).collect()
    }

    /// Runs callbacks in turn until one makes progress. Returns false if none did.
    ///
    /// The next call resumes with the callback after the last one run.
    pub fn run_once(&self) -> bool {
        for _ in 0..self.len() {
            let next = {
                let mut reclaimers = self.reclaimers.lock();
                let Some(reclaimer) = reclaimers.pop_front() else {
                    return false;
                };
                let next = (reclaimer.name, reclaimer.func.clone());
                reclaimers.push_back(reclaimer);
                next
            };
            let (name, func) = next;
            if func() {
                #[cfg(feature = "detailed-logging")]
                log::trace!("reclaim: {name} made progress");
                return true;
            }
            log::debug!("reclaim: {name} found nothing to free");
        }
        false
    }

    /// Reclaim loop for a dedicated kernel thread.
    ///
    /// Sleeps until some pool is under at least moderate pressure, then runs callbacks,
    /// yielding between passes once pressure is back to moderate. Returns when `stop` is
    /// set or the wait is interrupted.
    pub fn launch(&self, pressure: &Pressure, stop: &AtomicBool) {
        log::info!("reclaim: worker started with {} callbacks", self.len());
        loop {
            let woke = pressure.wait_for(|p| {
                stop.load(Ordering::Acquire) || p.pressure(MemoryTypes::all()) >= PressureLevel::Moderate
            });
            if let Err(err) = woke {
                log::warn!("reclaim: worker wait failed: {err}");
                return;
            }
            if stop.load(Ordering::Acquire) {
                log::info!("reclaim: worker stopped");
                return;
            }
            let progress = self.run_once();
            if !progress || pressure.pressure(MemoryTypes::all()) <= PressureLevel::Moderate {
                pressure.platform().yield_now();
            }
        }
    }
}
