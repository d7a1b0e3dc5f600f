//! Copies between kernel buffers and user memory.
//!
//! Both directions walk the user range one page at a time, faulting in missing or
//! read-only translations on the thread's behalf inside a may-fault region. Each page
//! stays pinned while its bytes are copied, so reclaim cannot free it underneath the
//! copy. A fault that cannot be resolved aborts the copy with
//! [`VmError::BadAddress`]; bytes already copied stay copied.

use crate::arch::{PAGE_SIZE, USER_VM_END, USER_VM_START};
use crate::{FaultOutcome, Page, PageFault, ThreadContext, VirtualAddress, Vm, VmError, VmFlags};

impl Vm {
    /// Copies `buf.len()` bytes from user address `src` into `buf`.
    pub fn copy_in(&self, thread: &ThreadContext, buf: &mut [u8], src: VirtualAddress) -> Result<(), VmError> {
        check_user_range(src, buf.len())?;
        let _guard = thread.may_fault_guard();
        let mut done = 0;
        while done < buf.len() {
            let addr = src + done;
            let chunk = (PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            let page = self.user_page(thread, addr, VmFlags::RD)?;
            self.phys().read(page, addr.page_offset(), &mut buf[done..done + chunk]);
            self.phys().unpin(page);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` to user address `dst`.
    pub fn copy_out(&self, thread: &ThreadContext, dst: VirtualAddress, data: &[u8]) -> Result<(), VmError> {
        check_user_range(dst, data.len())?;
        let _guard = thread.may_fault_guard();
        let mut done = 0;
        while done < data.len() {
            let addr = dst + done;
            let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
            let page = self.user_page(thread, addr, VmFlags::WR)?;
            self.phys().write(page, addr.page_offset(), &data[done..done + chunk]);
            self.phys().unpin(page);
            done += chunk;
        }
        Ok(())
    }

    /// The page behind `addr`, pinned and mapped for `access`.
    ///
    /// A failed lookup is handed to [`Vm::trap`] as a kernel fault inside the
    /// may-fault region, which gives reclaim its chance on out-of-memory.
    fn user_page(&self, thread: &ThreadContext, addr: VirtualAddress, access: VmFlags) -> Result<Page, VmError> {
        let vas = thread.vas().ok_or(VmError::BadAddress)?;
        if let Ok(page) = vas.fault_pinned(addr, access) {
            return Ok(page);
        }

        let fault = PageFault {
            addr,
            access: access | VmFlags::KERN,
            ip: 0,
        };
        if self.trap(&fault, thread) != FaultOutcome::Resolved {
            return Err(VmError::BadAddress);
        }
        vas.fault_pinned(addr, access).map_err(|_| VmError::BadAddress)
    }
}

fn check_user_range(addr: VirtualAddress, len: usize) -> Result<(), VmError> {
    let start = addr.as_usize();
    match start.checked_add(len) {
        _ if len == 0 => Ok(()),
        Some(end) if start >= USER_VM_START && end - 1 <= USER_VM_END => Ok(()),
        _ => Err(VmError::BadAddress),
    }
}
