//! Tunables fixed at boot.

use crate::arch;

/// Free-memory thresholds and reserves used by the pressure governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureConfig {
    /// Pressure is low while at least this percentage of a pool is free.
    pub low_percent: usize,
    /// Pressure is moderate while at least this percentage is free; below it, high.
    pub moderate_percent: usize,
    /// Bytes of kernel virtual memory that `mem_wait` keeps in reserve.
    pub kern_reserve: usize,
    /// Bytes of physical memory that `mem_wait` keeps in reserve.
    pub phys_reserve: usize,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            low_percent: 50,
            moderate_percent: 30,
            kern_reserve: 0,
            phys_reserve: 0,
        }
    }
}

/// Boot-time configuration of the VM core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub pressure: PressureConfig,
    /// One page-hash bucket per `2^pghash_shift` resident pages.
    pub pghash_shift: usize,
    /// Number of CPUs with an active-VAS record.
    pub cpus: usize,
    /// Offset of the kernel's linear mapping of physical memory.
    pub direct_map_offset: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            pressure: PressureConfig::default(),
            pghash_shift: 8,
            cpus: 1,
            direct_map_offset: arch::KERNEL_VM_START,
        }
    }
}

impl VmConfig {
    /// Panics if the configuration is inconsistent.
    pub fn validate(&self) {
        let p = &self.pressure;
        assert!(
            p.moderate_percent <= p.low_percent && p.low_percent <= 100,
            "pressure thresholds must satisfy moderate <= low <= 100"
        );
        assert!(self.cpus > 0, "at least one CPU is required");
        assert!(self.pghash_shift < usize::BITS as usize, "page-hash shift too large");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = VmConfig::default();
        config.validate();
        assert_eq!(config.pressure.low_percent, 50);
        assert_eq!(config.pressure.moderate_percent, 30);
    }

    #[test]
    #[should_panic(expected = "moderate <= low")]
    fn inverted_thresholds_are_rejected() {
        let mut config = VmConfig::default();
        config.pressure.moderate_percent = 60;
        config.validate();
    }
}
