//! Physical Page Handles
//!
//! An owned handle to one physical page drawn from the host allocator.
//! Ownership moves exactly once between the page cache, the pmap while
//! the page is mapped, and the release path; dropping a handle gives
//! the page back to the host.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Mask selecting the page-aligned part of an address
pub const PAGE_MASK: u64 = !(PAGE_SIZE as u64 - 1);

/// Round an address down to its page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Round an address up to the next page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & PAGE_MASK
}

// ============================================================================
// Zone Identity
// ============================================================================

/// Memory zone identity, reported to the accounting hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneId(pub u32);

impl ZoneId {
    pub const NORMAL: Self = Self(0);
}

// ============================================================================
// Allocation Mode
// ============================================================================

/// How an allocation is allowed to behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Ordinary path; the caller may sleep
    Kernel,
    /// Fault path; must never sleep, draws on emergency reserves
    Atomic,
}

// ============================================================================
// Page
// ============================================================================

const fn page_layout() -> Layout {
    // Size and alignment are both the page size, valid by construction
    unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) }
}

/// An owned physical page
#[derive(Debug)]
pub struct Page {
    frame: NonNull<u8>,
}

// Page handles move between the fault path, the cache, and background
// work; the backing frame has a single owner at any time.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Allocate one zeroed page from the host
    pub fn alloc(mode: AllocMode) -> Option<Page> {
        if mode == AllocMode::Atomic && atomic_denied() {
            return None;
        }
        let ptr = unsafe { alloc_zeroed(page_layout()) };
        NonNull::new(ptr).map(|frame| Page { frame })
    }

    /// Clear the page content
    pub fn zero(&mut self) {
        unsafe {
            core::ptr::write_bytes(self.frame.as_ptr(), 0, PAGE_SIZE);
        }
    }

    /// Frame address, for diagnostics only
    pub fn frame_addr(&self) -> u64 {
        self.frame.as_ptr() as u64
    }

    /// Zone this page was drawn from
    pub fn zone(&self) -> ZoneId {
        ZoneId::NORMAL
    }

    #[cfg(test)]
    pub fn read_byte(&self, offset: usize) -> u8 {
        assert!(offset < PAGE_SIZE);
        unsafe { *self.frame.as_ptr().add(offset) }
    }

    #[cfg(test)]
    pub fn write_byte(&mut self, offset: usize, value: u8) {
        assert!(offset < PAGE_SIZE);
        unsafe { *self.frame.as_ptr().add(offset) = value }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        unsafe { dealloc(self.frame.as_ptr(), page_layout()) }
    }
}

// ============================================================================
// Emergency Reserve Control
// ============================================================================

// Emergency allocations can be denied in tests to exercise the fault
// path with the reserves gone.
#[cfg(test)]
static DENY_ATOMIC: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

#[cfg(test)]
pub fn deny_atomic_allocs(deny: bool) {
    DENY_ATOMIC.store(deny, core::sync::atomic::Ordering::SeqCst);
}

fn atomic_denied() -> bool {
    #[cfg(test)]
    {
        DENY_ATOMIC.load(core::sync::atomic::Ordering::SeqCst)
    }
    #[cfg(not(test))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed() {
        let page = Page::alloc(AllocMode::Kernel).expect("page allocation");
        assert_eq!(page.read_byte(0), 0);
        assert_eq!(page.read_byte(PAGE_SIZE - 1), 0);
    }

    #[test]
    fn test_zero_clears_content() {
        let mut page = Page::alloc(AllocMode::Kernel).expect("page allocation");
        page.write_byte(17, 0xAB);
        assert_eq!(page.read_byte(17), 0xAB);

        page.zero();
        assert_eq!(page.read_byte(17), 0);
    }

    #[test]
    fn test_page_utils() {
        assert_eq!(trunc_page(0x5678), 0x5000);
        assert_eq!(round_page(0x5001), 0x6000);
        assert_eq!(round_page(0x5000), 0x5000);
    }
}
