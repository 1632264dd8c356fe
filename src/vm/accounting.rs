//! Stack Accounting
//!
//! A signed counter of currently mapped stack pages, adjusted on every
//! map and unmap, with a hook fired per change so a wider memory
//! reporting subsystem can fold the numbers into its own. Per-context
//! kernel-stack bookkeeping and a rate-limited usage line sit on top.
//! All of it is reporting only; nothing here drives policy.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::context::ContextId;
use crate::kern::work::TICKS_PER_SECOND;
use crate::vm::page::{ZoneId, PAGE_SIZE};

/// Ticks between usage report lines
pub const REPORT_INTERVAL: u64 = 5 * TICKS_PER_SECOND;

/// Hook invoked on every mapped-page-count change
pub type AccountingHook = fn(delta: i64, zone: ZoneId);

/// Per-system accounting state
#[derive(Debug)]
pub struct Accounting {
    /// Currently mapped stack pages, signed delta
    mapped: AtomicI64,

    /// Kernel stack KiB charged per context
    stack_kb: Mutex<BTreeMap<ContextId, i64>>,

    /// Registered reporting hook
    hook: Mutex<Option<AccountingHook>>,

    /// Tick of the last usage line
    last_report: AtomicU64,
}

impl Accounting {
    pub fn new() -> Self {
        Self {
            mapped: AtomicI64::new(0),
            stack_kb: Mutex::new(BTreeMap::new()),
            hook: Mutex::new(None),
            last_report: AtomicU64::new(0),
        }
    }

    /// Register the reporting hook
    pub fn set_hook(&self, hook: AccountingHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Adjust the mapped page count; the hook fires outside its lock
    pub fn update_mapped(&self, diff: i64, zone: ZoneId) {
        self.mapped.fetch_add(diff, Ordering::Relaxed);
        let hook = *self.hook.lock();
        if let Some(hook) = hook {
            hook(diff, zone);
        }
    }

    /// Currently mapped stack pages
    pub fn mapped(&self) -> i64 {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Charge or release one slot's worth of kernel stack for a context
    pub fn account_stack(&self, ctx: ContextId, slot_pages: usize, sign: i64) {
        let kb = (slot_pages * PAGE_SIZE / 1024) as i64 * sign;
        let mut map = self.stack_kb.lock();
        let total = {
            let entry = map.entry(ctx).or_insert(0);
            *entry += kb;
            *entry
        };
        if total == 0 {
            map.remove(&ctx);
        }
    }

    /// Kernel stack KiB charged to a context
    pub fn context_kb(&self, ctx: ContextId) -> i64 {
        self.stack_kb.lock().get(&ctx).copied().unwrap_or(0)
    }

    /// Emit a usage line, at most once per report interval
    pub fn report(&self, cached_pages: u32, now: u64) {
        let last = self.last_report.load(Ordering::Relaxed);
        if now.saturating_sub(last) < REPORT_INTERVAL {
            return;
        }
        if self
            .last_report
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        crate::println!(
            "vstack: stacks {} KiB mapped, {} KiB cached",
            self.mapped() * (PAGE_SIZE / 1024) as i64,
            cached_pages as usize * PAGE_SIZE / 1024
        );
    }
}

// ============================================================================
// Installed-System Accessors
// ============================================================================

/// Mapped stack pages of the installed system
pub fn mapped_pages() -> i64 {
    match crate::vm::stack::system() {
        Some(sys) => sys.accounting().mapped(),
        None => 0,
    }
}

/// Register the reporting hook on the installed system
pub fn register_hook(hook: AccountingHook) -> bool {
    match crate::vm::stack::system() {
        Some(sys) => {
            sys.accounting().set_hook(hook);
            true
        }
        None => false,
    }
}
