//! Human-readable size formatting for memory values.

use core::fmt;

/// Wraps a size in bytes and formats it with binary prefixes.
///
/// Values are shown with up to two decimal places, truncated, with trailing zeros
/// omitted. Only integer arithmetic is used, so the formatter is safe to call from
/// contexts where the FPU state must not be touched.
///
/// # Examples
///
/// ```
/// use vm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(1023)), "1023B");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize(4 << 20)), "4MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let bytes = self.0 as u128;
        let mut unit = 0;
        while unit < UNITS.len() - 1 && bytes >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }
        if unit == 0 {
            return write!(f, "{}B", bytes);
        }

        let scale = 1u128 << (10 * unit);
        let whole = bytes / scale;
        let hundredths = (bytes % scale) * 100 / scale;
        match hundredths {
            0 => write!(f, "{}{}", whole, UNITS[unit]),
            h if h % 10 == 0 => write!(f, "{}.{}{}", whole, h / 10, UNITS[unit]),
            h => write!(f, "{}.{:02}{}", whole, h, UNITS[unit]),
        }
    }
}
