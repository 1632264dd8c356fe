//! Stack Lifecycle and the System Instance
//!
//! One `VstackSystem` owns the arena, the slot bitmap, the page cache,
//! the pmap, the shrinker, and the accounting for the whole feature.
//! It is built once at startup; failure at any bring-up step unwinds
//! everything built so far and leaves the feature disabled, in which
//! case stack callers fall back to their ordinary provisioning.
//!
//! Allocation binds a free slot to the owner and maps only the top
//! page; the rest of the slot fills in through the fault handler.
//! Release walks the mapped pages back into the cache and returns the
//! slot index, rewinding the allocator cursor.

use spin::Mutex;

use crate::kern::context::ExecutionContext;
use crate::kern::work::{self, WorkKind, TICKS_PER_SECOND};
use crate::vm::accounting::Accounting;
use crate::vm::arena::{Arena, SlotError, SlotTable};
use crate::vm::cache::{PageCache, CACHE_PAGES_MAX};
use crate::vm::fault::{self, FaultFrame, FaultOutcome};
use crate::vm::page::{AllocMode, Page, PAGE_SIZE};
use crate::vm::pmap::Pmap;
use crate::vm::shrink::{self, StackShrinker};

// ============================================================================
// Configuration
// ============================================================================

/// Default base of the reserved stack arena
pub const VSTACK_BASE: u64 = 0xffff_9000_0000_0000;

/// Ceiling on the configurable slot count
pub const MAX_SLOT_COUNT: usize = 4096;

/// Default delay between cache maintain passes, in ticks
pub const CACHE_MAINTAIN_DELAY: u64 = 100;

/// Subsystem configuration
#[derive(Debug, Clone, Copy)]
pub struct VstackConfig {
    /// Base of the reserved virtual range, page aligned
    pub arena_base: u64,
    /// Number of stack slots
    pub max_slots: usize,
    /// Pages per slot
    pub pages_per_slot: usize,
    /// Page cache fill target
    pub cache_target: u32,
    /// Delay between cache maintain passes, in ticks
    pub maintain_delay: u64,
    /// Minimum ticks between reclaim scans
    pub shrink_cooldown: u64,
    /// Minimum idle depth, in bytes, before a stack is shrunk
    pub shrink_threshold: u64,
}

impl VstackConfig {
    pub const fn new() -> Self {
        Self {
            arena_base: VSTACK_BASE,
            max_slots: 1024,
            pages_per_slot: 4,
            cache_target: 64,
            maintain_delay: CACHE_MAINTAIN_DELAY,
            shrink_cooldown: 2 * TICKS_PER_SECOND,
            shrink_threshold: 2 * PAGE_SIZE as u64,
        }
    }

    fn validate(&self) -> Result<(), InitError> {
        if self.arena_base == 0
            || self.arena_base % PAGE_SIZE as u64 != 0
            || self.max_slots == 0
            || self.max_slots > MAX_SLOT_COUNT
            || self.pages_per_slot < 2
            || self.cache_target == 0
            || self.cache_target as usize > CACHE_PAGES_MAX
        {
            return Err(InitError::BadConfig);
        }
        Ok(())
    }
}

impl Default for VstackConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from stack allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAllocError {
    /// The subsystem never came up; use ordinary provisioning
    Disabled,
    /// No free slot
    Exhausted,
    /// Page allocation failed
    NoMemory,
}

/// Errors from bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    AlreadyInitialized,
    BadConfig,
    NoMemory,
}

// ============================================================================
// System Instance
// ============================================================================

/// The whole feature: arena, slots, cache, mappings, reclaim, counters
pub struct VstackSystem {
    arena: Arena,
    slots: Mutex<SlotTable>,
    cache: PageCache,
    pmap: Pmap,
    shrink: StackShrinker,
    accounting: Accounting,
    config: VstackConfig,
}

impl VstackSystem {
    /// Build a system instance. Every resource acquired here unwinds
    /// through `Drop` if a later step fails.
    pub fn new(config: VstackConfig) -> Result<Self, InitError> {
        config.validate()?;

        let sys = Self {
            arena: Arena::new(config.arena_base, config.max_slots, config.pages_per_slot),
            slots: Mutex::new(SlotTable::new(config.max_slots)),
            cache: PageCache::new(config.cache_target),
            pmap: Pmap::new(),
            shrink: StackShrinker::new(),
            accounting: Accounting::new(),
            config,
        };

        if !sys.cache.prefill() {
            return Err(InitError::NoMemory);
        }
        Ok(sys)
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    pub fn shrinker(&self) -> &StackShrinker {
        &self.shrink
    }

    pub fn accounting(&self) -> &Accounting {
        &self.accounting
    }

    pub fn config(&self) -> &VstackConfig {
        &self.config
    }

    /// Number of slots currently bound to contexts
    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().in_use()
    }

    /// Bind a free slot to `ctx` and map its top page.
    ///
    /// This path may sleep; the cache is preferred but the ordinary
    /// allocator backs it up. Any failure rolls the slot back.
    pub fn allocate_stack(&self, ctx: &ExecutionContext) -> Result<u64, StackAllocError> {
        let index = match self.slots.lock().acquire() {
            Ok(index) => index,
            Err(SlotError::Exhausted) => {
                crate::println!("vstack: stack slots exhausted");
                return Err(StackAllocError::Exhausted);
            }
        };

        let page = match self.cache.take() {
            Some((page, remain)) => {
                if remain <= self.cache.target() / 2 {
                    work::expedite(WorkKind::CacheMaintain);
                }
                page
            }
            None => match Page::alloc(AllocMode::Kernel) {
                Some(page) => page,
                None => {
                    self.slots.lock().release(index);
                    crate::println!("vstack: stack page allocation failed");
                    return Err(StackAllocError::NoMemory);
                }
            },
        };

        let base = self.arena.slot_base(index);
        let zone = page.zone();
        // Top page only; growth below it is fault driven
        self.pmap.enter(self.arena.top_page(index), page);
        self.accounting.update_mapped(1, zone);
        self.accounting.account_stack(ctx.id, self.config.pages_per_slot, 1);
        self.accounting.report(self.cache.len(), work::ticks());
        ctx.set_stack_base(base);
        Ok(base)
    }

    /// Unmap everything the slot accumulated and release the index.
    ///
    /// Pages go back to the cache while it has room, otherwise straight
    /// to the host.
    pub fn free_stack(&self, ctx: &ExecutionContext) {
        let base = ctx.stack_base();
        if base == 0 || !self.arena.contains(base) {
            return;
        }

        let index = self.arena.slot_index(base);
        let mut addr = self.arena.top_page(index);
        // Stop at the first hole; below it the slot was never touched
        loop {
            let page = match self.pmap.remove(addr) {
                Some(page) => page,
                None => break,
            };
            let zone = page.zone();
            if let Err(page) = self.cache.give_back(page) {
                drop(page);
            }
            self.accounting.update_mapped(-1, zone);
            if addr == base {
                break;
            }
            addr -= PAGE_SIZE as u64;
        }

        self.accounting.account_stack(ctx.id, self.config.pages_per_slot, -1);
        ctx.set_stack_base(0);
        self.slots.lock().release(index);
    }

    /// Handle a stack fault against this instance
    pub fn handle_fault(&self, addr: u64, syndrome: u64, frame: &FaultFrame) -> FaultOutcome {
        fault::vstack_fault(self, addr, syndrome, frame)
    }

    /// Pages a reclaim pass could give back, for pressure accounting
    pub fn reclaim_estimate(&self) -> usize {
        self.shrink.count(self)
    }

    /// Run one reclaim pass at time `now`
    pub fn reclaim_scan(&self, pressure: usize, now: u64) -> usize {
        self.shrink.scan(self, pressure, now)
    }
}

// ============================================================================
// Global State
// ============================================================================

static VSTACK: spin::Once<VstackSystem> = spin::Once::new();

/// Bring the feature up. On any failure everything built so far is
/// dropped and the feature stays disabled.
pub fn init(config: VstackConfig) -> Result<(), InitError> {
    if VSTACK.get().is_some() {
        return Err(InitError::AlreadyInitialized);
    }

    let sys = VstackSystem::new(config)?;

    let mut installed = false;
    VSTACK.call_once(|| {
        installed = true;
        sys
    });
    if !installed {
        // Lost a bring-up race; the loser's pages unwind on drop
        return Err(InitError::AlreadyInitialized);
    }

    shrink::register();
    work::schedule(WorkKind::CacheMaintain, config.maintain_delay);

    let end = config.arena_base
        + (config.max_slots * config.pages_per_slot * PAGE_SIZE) as u64;
    crate::println!(
        "vstack: arena {:#x}..{:#x}, {} slots of {} pages, cache {}",
        config.arena_base,
        end,
        config.max_slots,
        config.pages_per_slot,
        config.cache_target
    );
    Ok(())
}

/// Did the feature come up?
pub fn is_enabled() -> bool {
    VSTACK.get().is_some()
}

/// The installed system, if any
pub fn system() -> Option<&'static VstackSystem> {
    VSTACK.get()
}

/// Allocate a stack for `ctx` from the installed system
pub fn allocate_stack(ctx: &ExecutionContext) -> Result<u64, StackAllocError> {
    match system() {
        Some(sys) => sys.allocate_stack(ctx),
        None => Err(StackAllocError::Disabled),
    }
}

/// Free the stack bound to `ctx`
pub fn free_stack(ctx: &ExecutionContext) {
    if let Some(sys) = system() {
        sys.free_stack(ctx);
    }
}

/// Delayed-work entry: top the cache up and reschedule
pub fn cache_maintain_work() {
    if let Some(sys) = system() {
        sys.cache().maintain();
        work::schedule(WorkKind::CacheMaintain, sys.config().maintain_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::context::ContextId;
    use crate::vm::fault::FaultOutcome;

    fn test_config(offset: u64) -> VstackConfig {
        VstackConfig {
            arena_base: 0xffff_c000_0000_0000 + offset * 0x1000_0000,
            max_slots: 4,
            pages_per_slot: 4,
            cache_target: 8,
            ..VstackConfig::new()
        }
    }

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_bad_config_rejected() {
        let mut config = test_config(1);
        config.pages_per_slot = 1;
        assert_eq!(VstackSystem::new(config).err(), Some(InitError::BadConfig));

        let mut config = test_config(1);
        config.cache_target = 0;
        assert_eq!(VstackSystem::new(config).err(), Some(InitError::BadConfig));

        let mut config = test_config(1);
        config.arena_base = 0x123; // not page aligned
        assert_eq!(VstackSystem::new(config).err(), Some(InitError::BadConfig));
    }

    #[test]
    fn test_allocate_maps_top_page_only() {
        let sys = VstackSystem::new(test_config(2)).expect("system bring-up");
        let ctx = ExecutionContext::new(ContextId(10));

        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        assert_eq!(base, sys.arena().slot_base(0));
        assert_eq!(ctx.stack_base(), base);

        assert!(sys.pmap().is_mapped(base + 3 * PAGE));
        assert!(!sys.pmap().is_mapped(base + 2 * PAGE));
        assert!(!sys.pmap().is_mapped(base));
        assert_eq!(sys.accounting().mapped(), 1);
        assert_eq!(sys.accounting().context_kb(ctx.id), 16);
    }

    #[test]
    fn test_unique_slots_and_reuse() {
        let sys = VstackSystem::new(test_config(3)).expect("system bring-up");
        let contexts: alloc::vec::Vec<_> =
            (0..4).map(|i| ExecutionContext::new(ContextId(20 + i))).collect();

        let mut bases = alloc::vec::Vec::new();
        for ctx in &contexts {
            let base = sys.allocate_stack(ctx).expect("stack allocation");
            assert!(!bases.contains(&base), "base {:#x} handed out twice", base);
            bases.push(base);
        }

        let extra = ExecutionContext::new(ContextId(30));
        assert_eq!(sys.allocate_stack(&extra), Err(StackAllocError::Exhausted));

        // A freed low slot is the next one handed out
        sys.free_stack(&contexts[1]);
        let base = sys.allocate_stack(&extra).expect("stack allocation");
        assert_eq!(base, sys.arena().slot_base(1));
    }

    #[test]
    fn test_free_returns_pages_to_cache() {
        let sys = VstackSystem::new(test_config(4)).expect("system bring-up");
        let ctx = ExecutionContext::new(ContextId(40));

        let before = sys.cache().len();
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        assert_eq!(sys.cache().len(), before - 1);

        sys.free_stack(&ctx);
        assert_eq!(sys.cache().len(), before);
        assert_eq!(sys.accounting().mapped(), 0);
        assert_eq!(sys.accounting().context_kb(ctx.id), 0);
        assert_eq!(ctx.stack_base(), 0);
        assert!(!sys.pmap().is_mapped(base + 3 * PAGE));
        assert_eq!(sys.slots_in_use(), 0);
    }

    #[test]
    fn test_allocate_with_empty_cache_falls_back() {
        let sys = VstackSystem::new(test_config(5)).expect("system bring-up");
        while let Some((page, _)) = sys.cache().take() {
            drop(page);
        }

        let ctx = ExecutionContext::new(ContextId(50));
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        assert!(sys.pmap().is_mapped(base + 3 * PAGE));
    }

    #[test]
    fn test_lifecycle_scenario() {
        // Four slots of four pages, cache of eight
        let sys = VstackSystem::new(test_config(6)).expect("system bring-up");
        let ctx = ExecutionContext::new(ContextId(60));
        let frame = FaultFrame::default();

        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        assert_eq!(base, sys.arena().slot_base(0));
        assert_eq!(sys.pmap().resident(), 1);

        // Touch page 2: mapped on demand
        let mapped_before = sys.accounting().mapped();
        assert_eq!(
            sys.handle_fault(base + 2 * PAGE + 8, 0, &frame),
            FaultOutcome::Resolved
        );
        assert!(sys.pmap().is_mapped(base + 2 * PAGE));
        assert_eq!(sys.accounting().mapped(), mapped_before + 1);

        // The floor with page 1 still unmapped is an overrun
        assert_eq!(
            sys.handle_fault(base, 0, &frame),
            FaultOutcome::FatalOutOfRange
        );

        // Release: pages 3 and 2 drain back into the cache
        let cached_before = sys.cache().len();
        sys.free_stack(&ctx);
        assert_eq!(sys.cache().len(), cached_before + 2);
        assert_eq!(sys.accounting().mapped(), 0);

        // The slot is immediately reusable
        let ctx2 = ExecutionContext::new(ContextId(61));
        assert_eq!(sys.allocate_stack(&ctx2), Ok(base));
    }

    #[test]
    fn test_disabled_feature_rejects_allocation() {
        // The test suite never initializes the global system
        let ctx = ExecutionContext::new(ContextId(70));
        assert_eq!(allocate_stack(&ctx), Err(StackAllocError::Disabled));
        assert!(!is_enabled());
        free_stack(&ctx); // no-op either way
    }

    #[test]
    fn test_free_without_stack_is_noop() {
        let sys = VstackSystem::new(test_config(7)).expect("system bring-up");
        let ctx = ExecutionContext::new(ContextId(80));

        sys.free_stack(&ctx);
        assert_eq!(sys.accounting().mapped(), 0);
        assert_eq!(sys.slots_in_use(), 0);
    }
}
