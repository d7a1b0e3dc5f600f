//! Recoverable failures reported by the VM core.

use core::fmt;

/// Errors returned by fallible VM operations.
///
/// Corruption and misuse (double free, misaligned sizes, calls before the relevant
/// init stage) are not represented here; those panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No frame or address range is available.
    OutOfMemory,
    /// The backing store failed to read or write a page.
    Io,
    /// The access is not allowed by the mapping's protection.
    ProtectionViolation,
    /// No mapping covers the address.
    NoMapping,
    /// The offset lies beyond the end of the object.
    OutOfRange,
    /// The pager has no data for the offset and the page must be zero-filled.
    NotResident,
    /// A blocking wait was interrupted by a pending signal.
    Interrupted,
    /// An argument is outside what the operation accepts.
    InvalidArgument,
    /// A user-memory copy touched an address that could not be resolved.
    BadAddress,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::Io => "pager I/O error",
            Self::ProtectionViolation => "protection violation",
            Self::NoMapping => "no mapping at address",
            Self::OutOfRange => "offset beyond end of object",
            Self::NotResident => "page not resident",
            Self::Interrupted => "interrupted",
            Self::InvalidArgument => "invalid argument",
            Self::BadAddress => "bad address",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for VmError {}
