//! Page fault entry.
//!
//! The trap layer calls [`Vm::trap`] with the faulting address and access. Faults are
//! resolved against the kernel address space for kernel addresses and against the
//! current thread's address space otherwise. Kernel-mode faults on user memory are
//! only legal inside a [`MayFault`] region, which user-copy helpers open.

use alloc::sync::Arc;
use core::cell::Cell;
use core::sync::atomic::Ordering;

use crate::{Vas, VirtualAddress, Vm, VmError, VmFlags};

/// A page fault as reported by the trap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: VirtualAddress,
    /// `RD` or `WR`, plus `KERN` if the fault was taken in kernel mode.
    pub access: VmFlags,
    /// Faulting instruction, for diagnostics.
    pub ip: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Access to an address with no mapping, or one the mapping does not permit.
    Segv,
    /// The mapping exists but its backing store could not supply the page.
    Bus,
}

/// What the trap layer must do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The translation is installed; restart the instruction.
    Resolved,
    /// A kernel fault inside a may-fault region failed; unwind to its recovery point.
    Recovered,
    /// Deliver a signal to the faulting user thread.
    Signal { signal: Signal, addr: VirtualAddress },
}

/// Per-thread state the fault handler needs.
pub struct ThreadContext {
    vas: Option<Arc<Vas>>,
    may_fault: Cell<usize>,
}

impl ThreadContext {
    pub fn new(vas: Option<Arc<Vas>>) -> Self {
        Self {
            vas,
            may_fault: Cell::new(0),
        }
    }

    /// A kernel thread with no user address space.
    pub fn kernel() -> Self {
        Self::new(None)
    }

    pub fn vas(&self) -> Option<&Arc<Vas>> {
        self.vas.as_ref()
    }

    pub fn set_vas(&mut self, vas: Option<Arc<Vas>>) {
        self.vas = vas;
    }

    /// Returns true inside a [`MayFault`] region.
    pub fn may_fault(&self) -> bool {
        self.may_fault.get() > 0
    }

    /// Opens a region in which kernel-mode faults on user memory are recoverable.
    pub fn may_fault_guard(&self) -> MayFault<'_> {
        self.may_fault.set(self.may_fault.get() + 1);
        MayFault(self)
    }
}

/// RAII guard for a may-fault region. Regions nest.
pub struct MayFault<'a>(&'a ThreadContext);

impl Drop for MayFault<'_> {
    fn drop(&mut self) {
        let depth = self.0.may_fault.get();
        assert!(depth > 0, "unbalanced may-fault region");
        self.0.may_fault.set(depth - 1);
    }
}

impl Vm {
    /// Resolves a fault at `addr`. `access` must hold exactly one of `RD` and `WR`.
    pub fn fault(&self, addr: VirtualAddress, access: VmFlags, thread: &ThreadContext) -> Result<(), VmError> {
        let rw = access & VmFlags::RW;
        assert!(
            rw == VmFlags::RD || rw == VmFlags::WR,
            "fault access {access:?} must be exactly one of RD and WR"
        );
        let kernel_mode = access.contains(VmFlags::KERN);

        if addr.is_kernel() {
            if !kernel_mode {
                return Err(VmError::ProtectionViolation);
            }
            return self.kernel_vas().fault(addr, access);
        }
        if kernel_mode && !thread.may_fault() {
            return Err(VmError::ProtectionViolation);
        }
        thread.vas().ok_or(VmError::NoMapping)?.fault(addr, access)
    }

    /// Handles a fault reported by the trap layer.
    ///
    /// Running out of memory runs one reclaim pass, and the fault is retried once if
    /// the pass freed anything.
    ///
    /// # Panics
    ///
    /// Panics on an unresolvable kernel-mode fault outside a may-fault region.
    pub fn trap(&self, fault: &PageFault, thread: &ThreadContext) -> FaultOutcome {
        self.faults.fetch_add(1, Ordering::Relaxed);
        let mut result = self.fault(fault.addr, fault.access, thread);
        if result == Err(VmError::OutOfMemory) && self.reclaim().run_once() {
            log::debug!("fault: retrying {:?} after reclaim", fault.addr);
            result = self.fault(fault.addr, fault.access, thread);
        }

        let err = match result {
            Ok(()) => return FaultOutcome::Resolved,
            Err(err) => err,
        };
        if fault.access.contains(VmFlags::KERN) {
            if thread.may_fault() {
                log::debug!("fault: recovered kernel fault at {:?}: {err}", fault.addr);
                return FaultOutcome::Recovered;
            }
            log::error!(
                "fault: kernel {:?} access at {:?} (ip {:#x}) failed: {err}",
                fault.access,
                fault.addr,
                fault.ip
            );
            panic!("unresolvable kernel page fault at {:?}: {err}", fault.addr);
        }

        let signal = match err {
            VmError::Io | VmError::OutOfMemory => Signal::Bus,
            _ => Signal::Segv,
        };
        log::info!(
            "fault: {:?} for user {:?} access at {:?} (ip {:#x}): {err}",
            signal,
            fault.access,
            fault.addr,
            fault.ip
        );
        FaultOutcome::Signal {
            signal,
            addr: fault.addr,
        }
    }

    /// Number of faults handled since boot.
    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }
}
