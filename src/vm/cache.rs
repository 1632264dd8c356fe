//! Stack Page Cache
//!
//! Pre-allocated free pages the fault handler can draw from without
//! ever allocating. The cache has its own lock, separate from the slot
//! bitmap, so fault-time draws never contend with slot bookkeeping. A
//! background maintain pass tops it back up to the target and
//! reschedules itself; when the cache runs low the pass is expedited.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::vm::page::{AllocMode, Page};

/// Most pages a cache can be configured to hold
pub const CACHE_PAGES_MAX: usize = 256;

/// Cache of ready stack pages
#[derive(Debug)]
pub struct PageCache {
    /// The pages themselves
    list: Mutex<VecDeque<Page>>,

    /// Mirror of the list length, readable without the lock
    cached: AtomicU32,

    /// Fill target; the cache never holds more
    target: u32,
}

impl PageCache {
    pub fn new(target: u32) -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            cached: AtomicU32::new(0),
            target,
        }
    }

    /// Pop one page; also reports how many remain
    pub fn take(&self) -> Option<(Page, u32)> {
        let mut list = self.list.lock();
        let page = list.pop_front()?;
        let remain = list.len() as u32;
        self.cached.store(remain, Ordering::Release);
        Some((page, remain))
    }

    /// Return a page for reuse; content is cleared before it goes in.
    /// Hands the page back when the cache is already full.
    pub fn give_back(&self, mut page: Page) -> Result<(), Page> {
        page.zero();
        let mut list = self.list.lock();
        if (list.len() as u32) < self.target {
            list.push_back(page);
            self.cached.store(list.len() as u32, Ordering::Release);
            Ok(())
        } else {
            Err(page)
        }
    }

    /// Splice a freshly allocated batch in with one lock acquisition.
    /// Pages beyond the target are dropped back to the host.
    pub fn splice(&self, batch: &mut heapless::Vec<Page, CACHE_PAGES_MAX>) {
        let mut list = self.list.lock();
        while let Some(page) = batch.pop() {
            if (list.len() as u32) < self.target {
                list.push_back(page);
            }
        }
        self.cached.store(list.len() as u32, Ordering::Release);
    }

    /// Pages currently cached
    pub fn len(&self) -> u32 {
        self.cached.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill target
    pub fn target(&self) -> u32 {
        self.target
    }

    /// At or below half target, time to expedite the maintain pass
    pub fn is_low(&self) -> bool {
        self.len() <= self.target / 2
    }

    /// Fill to target at bring-up; all or nothing
    pub fn prefill(&self) -> bool {
        for _ in 0..self.target {
            match Page::alloc(AllocMode::Kernel) {
                Some(page) => {
                    let mut list = self.list.lock();
                    list.push_back(page);
                    self.cached.store(list.len() as u32, Ordering::Release);
                }
                None => return false,
            }
        }
        true
    }

    /// Maintain pass: allocate up to the shortfall and splice it in.
    /// Best effort; a short batch is accepted and retried next cycle.
    /// Returns the number of pages added.
    pub fn maintain(&self) -> u32 {
        let count = self.len();
        if count >= self.target {
            return 0;
        }

        let want = self.target - count;
        let mut batch: heapless::Vec<Page, CACHE_PAGES_MAX> = heapless::Vec::new();
        for _ in 0..want {
            match Page::alloc(AllocMode::Kernel) {
                Some(page) => {
                    if batch.push(page).is_err() {
                        break;
                    }
                }
                None => {
                    crate::println!(
                        "vstack: cache refill short, got {} of {}",
                        batch.len(),
                        want
                    );
                    break;
                }
            }
        }

        let added = batch.len() as u32;
        self.splice(&mut batch);
        added
    }
}
