//! Backing-store interface for VM objects.

use crate::{PagerFlags, PghashNode, VmError};

/// A backing store that fills pages on demand and accepts dirty pages back.
///
/// Implemented by filesystems for file-backed objects and by the VM itself for
/// anonymous memory. Calls are made without any VM lock held and with the page busy, so
/// implementations may block.
pub trait Pager: Send + Sync {
    fn flags(&self) -> PagerFlags {
        PagerFlags::empty()
    }

    /// Fills `page` with the contents at `offset`.
    ///
    /// `node` is the pager-private node a previous [`Pager::pageout`] left behind for
    /// this offset, if any.
    fn pagein(&self, offset: u64, node: Option<&PghashNode>, page: &mut [u8]) -> Result<(), VmError>;

    /// Writes a dirty page back.
    ///
    /// On success the pager may return a handle to keep in a pager-private node (for
    /// example a swap slot); it is passed back to the next [`Pager::pagein`].
    fn pageout(&self, offset: u64, page: &[u8]) -> Result<Option<usize>, VmError>;
}

/// Pager for anonymous and shadow memory.
///
/// Absent offsets are zero-filled by the object itself, and with no backing store
/// there is nothing to page in from or out to.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonPager;

impl Pager for AnonPager {
    fn flags(&self) -> PagerFlags {
        PagerFlags::PGHASH
    }

    fn pagein(&self, _offset: u64, _node: Option<&PghashNode>, _page: &mut [u8]) -> Result<(), VmError> {
        Err(VmError::NotResident)
    }

    fn pageout(&self, _offset: u64, _page: &[u8]) -> Result<Option<usize>, VmError> {
        Err(VmError::InvalidArgument)
    }
}
