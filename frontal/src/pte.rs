//! Page-table entries and the descriptors used to track code pages.

use std::ptr::NonNull;

/// Size of a tracked page.
pub const PAGE_SIZE: usize = 0x1000;

/// Number of 4KiB pages covered by a single PMD entry.
pub const PAGES_PER_PMD: usize = 512;

/// The level of the paging hierarchy an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLevel {
    Pte,
    Pmd,
}

/// An x86-64 page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteEntry(pub u64);
impl PteEntry {
    const PRESENT: u64 = 1 << 0;
    const ACCESSED: u64 = 1 << 5;
    const DIRTY: u64 = 1 << 6;
    const EXECUTE_DISABLE: u64 = 1 << 63;

    pub fn present(&self) -> bool { (self.0 & Self::PRESENT) != 0 }
    pub fn accessed(&self) -> bool { (self.0 & Self::ACCESSED) != 0 }
    pub fn dirty(&self) -> bool { (self.0 & Self::DIRTY) != 0 }
    pub fn execute_disabled(&self) -> bool {
        (self.0 & Self::EXECUTE_DISABLE) != 0
    }
    pub fn pfn(&self) -> usize {
        ((self.0 & 0x000f_ffff_ffff_f000) >> 12) as usize
    }

    pub fn mark_not_accessed(self) -> Self { Self(self.0 & !Self::ACCESSED) }
    pub fn mark_accessed(self) -> Self { Self(self.0 | Self::ACCESSED) }
    pub fn mark_execute_disabled(self, disabled: bool) -> Self {
        if disabled {
            Self(self.0 | Self::EXECUTE_DISABLE)
        } else {
            Self(self.0 & !Self::EXECUTE_DISABLE)
        }
    }
}

/// Handle to a single page-table entry covering code in the protected domain.
///
/// Descriptors are handed out once by the remapping collaborator (see
/// [`crate::platform::PageRemapper`]) and are only ever borrowed by this
/// crate. All operations take `&self`; the entry lives in memory shared with
/// the MMU, not in the descriptor.
pub trait PageDescriptor {
    /// Returns true if the processor has referenced the page since the
    /// accessed bit was last cleared.
    fn read_accessed(&self) -> bool;

    /// Clear the accessed bit.
    fn clear_accessed(&self);

    /// Set or clear the execute-disable bit.
    fn set_execute_disabled(&self, disabled: bool);
}

/// A page-table entry that has been remapped into our address space.
///
/// All accesses are volatile; the processor updates the accessed bit behind
/// our back.
#[derive(Debug)]
pub struct MappedPte {
    ptr: NonNull<u64>,
}
impl MappedPte {
    /// Wrap a pointer to a remapped page-table entry.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mapped, aligned page-table entry which remains
    /// valid for the lifetime of the returned descriptor.
    pub unsafe fn from_raw(ptr: NonNull<u64>) -> Self {
        Self { ptr }
    }

    /// Read the current value of the entry.
    pub fn read(&self) -> PteEntry {
        PteEntry(unsafe { self.ptr.as_ptr().read_volatile() })
    }

    fn write(&self, val: PteEntry) {
        unsafe { self.ptr.as_ptr().write_volatile(val.0) }
    }
}
impl PageDescriptor for MappedPte {
    fn read_accessed(&self) -> bool { self.read().accessed() }
    fn clear_accessed(&self) {
        self.write(self.read().mark_not_accessed());
    }
    fn set_execute_disabled(&self, disabled: bool) {
        self.write(self.read().mark_execute_disabled(disabled));
    }
}

/// Return the number of code pages spanned by `[start, end]` plus one
/// trailing sentinel page.
///
/// The sentinel never contains measured code; it only exists so that the
/// last real page always has a successor in the tracking window.
pub fn tracked_page_count(start: usize, end: usize) -> usize {
    let first = start & !(PAGE_SIZE - 1);
    let last = end & !(PAGE_SIZE - 1);
    1 + (last.saturating_sub(first) / PAGE_SIZE) + 1
}
