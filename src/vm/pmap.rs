//! Pmap - Arena Page Mappings
//!
//! The one interface through which the allocator touches translation
//! state: install a mapping, remove one (getting the page back), ask
//! whether an address is mapped. This software pmap keeps the mappings
//! in an ordered map and owns the mapped pages; a hardware port writes
//! leaf entries instead and tracks ownership beside them. The
//! translation cache is invalidated one page at a time on every
//! install and remove.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::vm::page::{trunc_page, Page};

/// Arena page mappings
#[derive(Debug)]
pub struct Pmap {
    /// Mapped pages keyed by page-aligned virtual address
    mappings: Mutex<BTreeMap<u64, Page>>,

    /// Number of resident pages
    resident: AtomicU32,
}

impl Pmap {
    pub fn new() -> Self {
        Self {
            mappings: Mutex::new(BTreeMap::new()),
            resident: AtomicU32::new(0),
        }
    }

    /// Install a mapping for the page containing `vaddr`
    pub fn enter(&self, vaddr: u64, page: Page) {
        let prev = self.mappings.lock().insert(trunc_page(vaddr), page);
        match prev {
            None => {
                self.resident.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                // A double install loses a page; report it and drop the old one
                crate::println!(
                    "vstack: pmap: replaced live mapping at {:#x}",
                    trunc_page(vaddr)
                );
            }
        }
        flush_tlb_page(vaddr);
    }

    /// Remove the mapping for the page containing `vaddr`, returning the page
    pub fn remove(&self, vaddr: u64) -> Option<Page> {
        let page = self.mappings.lock().remove(&trunc_page(vaddr))?;
        self.resident.fetch_sub(1, Ordering::Relaxed);
        flush_tlb_page(vaddr);
        Some(page)
    }

    /// Is the page containing `vaddr` mapped?
    pub fn is_mapped(&self, vaddr: u64) -> bool {
        self.mappings.lock().contains_key(&trunc_page(vaddr))
    }

    /// Number of resident pages
    pub fn resident(&self) -> u32 {
        self.resident.load(Ordering::Relaxed)
    }
}

/// Invalidate the translation cache for one page
fn flush_tlb_page(vaddr: u64) {
    #[cfg(all(not(test), target_arch = "x86_64"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr);
    }

    #[cfg(all(not(test), target_arch = "aarch64"))]
    unsafe {
        // TLBI VAAE1IS - invalidate by VA, EL1, inner shareable
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1is, {}",
            "dsb ish",
            "isb",
            in(reg) vaddr >> 12,
        );
    }

    #[cfg(any(test, not(any(target_arch = "x86_64", target_arch = "aarch64"))))]
    let _ = vaddr;
}
