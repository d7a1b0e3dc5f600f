#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # VM core
//!
//! The virtual memory core of a 32-bit x86 kernel. It provides:
//!
//! - A buddy allocator for physical frames, with early boot allocation before it exists.
//! - A page-hash index from (object, offset) to resident pages.
//! - VM objects backed by pagers, with shadow objects for copy-on-write.
//! - Address spaces bound to MMU contexts, with TLB shootdown on change.
//! - A kernel virtual memory allocator, memory pressure tracking and reclaim.
//! - Page fault resolution and fault-safe copies to and from user memory.
//!
//! Everything hangs off a [`Vm`] built at boot. The `software-emulation` feature (and
//! every test build) swaps the i386 page tables for a scale model with 16-byte pages
//! and emulated physical memory.

extern crate alloc;

mod address;
mod arch;
mod config;
mod early;
mod error;
mod fault;
mod flags;
mod frame;
mod human_size;
mod init;
mod kern;
mod mmu;
mod numbers;
mod object;
mod pager;
mod pghash;
mod phys;
mod platform;
mod pressure;
mod reclaim;
mod shadow;
mod uaccess;
mod vas;
mod vm;
mod vmem;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use config::{PressureConfig, VmConfig};
pub use early::{BootMemoryRegion, EarlyAllocator, MAX_RESERVED, MAX_SEGMENTS, MemoryRegion};
pub use error::VmError;
pub use fault::{FaultOutcome, MayFault, PageFault, Signal, ThreadContext};
pub use flags::{PagerFlags, VmFlags};
pub use frame::{Frame, FrameFlag, FrameFlags, FrameState};
pub use human_size::HumanSize;
pub use init::{InitFlags, InitState};
pub use mmu::Mmu;
pub use numbers::{FrameNumber, PageNumber};
pub use object::{ObjectKind, VmObject};
pub use pager::{AnonPager, Pager};
pub use pghash::{NodeKind, ObjectId, PageHash, PghashNode};
pub use phys::{MAX_ORDER, Page, PhysicalAllocator};
pub use platform::{CpuSet, Platform, WaitQueue};
pub use pressure::{MemoryType, MemoryTypes, Pressure, PressureLevel};
pub use reclaim::{Reclaim, ReclaimId};
pub use vas::{Map, Vas};
pub use vm::Vm;
pub use vmem::Vmem;

pub use arch::{KERNEL_VM_START, PAGE_SHIFT, PAGE_SIZE, USER_VM_END, USER_VM_START};
