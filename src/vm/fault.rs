//! Stack Fault Handling
//!
//! Entry point for the host's exception path when a stack address
//! misses translation. Runs with interrupts off and must never sleep:
//! the page comes from the cache, or from the emergency reserves when
//! the cache is dry. A fault on a slot's floor page with nothing
//! mapped above it means the stack ran past its reserved range; that
//! is reported as fatal, never mapped.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kern::work::{self, WorkKind};
use crate::vm::page::{trunc_page, AllocMode, Page, PAGE_SIZE};
use crate::vm::stack::{self, VstackSystem};

// ============================================================================
// Fault Result
// ============================================================================

/// Result of a stack fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Fault resolved; one page was mapped
    Resolved,
    /// Address is not ours; let the host keep looking
    NotMine,
    /// The stack ran past its reserved range; fatal for the owner
    FatalOutOfRange,
    /// Cache dry and emergency reserves denied; fault unresolved
    NoMemory,
}

/// Register snapshot from the exception path, for diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultFrame {
    pub pc: u64,
    pub lr: u64,
    pub sp: u64,
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics
static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Faults resolved by mapping a page
    pub resolved: AtomicU64,
    /// Addresses outside the arena
    pub not_mine: AtomicU64,
    /// Fatal out-of-range faults
    pub out_of_range: AtomicU64,
    /// Floor-page mappings (stack nearly exhausted)
    pub near_overflow: AtomicU64,
    /// Faults that found the cache empty
    pub cache_empty: AtomicU64,
    /// Faults the emergency reserves could not feed
    pub no_memory: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            resolved: AtomicU64::new(0),
            not_mine: AtomicU64::new(0),
            out_of_range: AtomicU64::new(0),
            near_overflow: AtomicU64::new(0),
            cache_empty: AtomicU64::new(0),
            no_memory: AtomicU64::new(0),
        }
    }

    pub fn incr_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_not_mine(&self) {
        self.not_mine.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_out_of_range(&self) {
        self.out_of_range.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_near_overflow(&self) {
        self.near_overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cache_empty(&self) {
        self.cache_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_no_memory(&self) {
        self.no_memory.fetch_add(1, Ordering::Relaxed);
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Fault Handling
// ============================================================================

/// Handle a stack fault against a specific system instance.
///
/// Interrupts are off on entry; nothing here may sleep or block.
pub fn vstack_fault(
    sys: &VstackSystem,
    addr: u64,
    syndrome: u64,
    frame: &FaultFrame,
) -> FaultOutcome {
    if !sys.arena().contains(addr) {
        FAULT_STATS.incr_not_mine();
        return FaultOutcome::NotMine;
    }

    let vaddr = trunc_page(addr);

    // The floor page with nothing mapped above it means the faulting
    // context blew through every page of its slot
    if sys.arena().is_floor_page(addr) && !sys.pmap().is_mapped(vaddr + PAGE_SIZE as u64) {
        crate::println!(
            "vstack: address {:#x} out of range, slot {} (syndrome {:#x})",
            addr,
            sys.arena().slot_index(addr),
            syndrome
        );
        crate::println!(
            "vstack: pc:{:#x} lr:{:#x} sp:{:#x}",
            frame.pc,
            frame.lr,
            frame.sp
        );
        FAULT_STATS.incr_out_of_range();
        return FaultOutcome::FatalOutOfRange;
    }

    let page = match sys.cache().take() {
        Some((page, remain)) => {
            if remain <= sys.cache().target() / 2 {
                work::expedite(WorkKind::CacheMaintain);
            }
            page
        }
        None => {
            // Running dry here is an anomaly worth reporting, but the
            // fault can still be fed from the emergency reserves
            FAULT_STATS.incr_cache_empty();
            crate::println!("vstack: page cache empty at fault, addr {:#x}", addr);
            work::expedite(WorkKind::CacheMaintain);
            match Page::alloc(AllocMode::Atomic) {
                Some(page) => page,
                None => {
                    FAULT_STATS.incr_no_memory();
                    crate::println!("vstack: no memory for stack fault at {:#x}", addr);
                    return FaultOutcome::NoMemory;
                }
            }
        }
    };

    let zone = page.zone();
    sys.pmap().enter(vaddr, page);
    sys.accounting().update_mapped(1, zone);

    // Mapping the floor page is legal growth, but it is the last page
    // the slot has to give
    if sys.arena().pages_per_slot() > 1 && sys.arena().is_floor_page(addr) {
        FAULT_STATS.incr_near_overflow();
        crate::println!(
            "vstack: stack near exhaustion, slot {} addr {:#x}",
            sys.arena().slot_index(addr),
            addr
        );
    }

    FAULT_STATS.incr_resolved();
    FaultOutcome::Resolved
}

/// Handle a stack fault against the installed system.
///
/// `NotMine` when the feature never came up, so the host's exception
/// path falls through to its other handlers.
pub fn handle_fault(addr: u64, syndrome: u64, frame: &FaultFrame) -> FaultOutcome {
    match stack::system() {
        Some(sys) => vstack_fault(sys, addr, syndrome, frame),
        None => FaultOutcome::NotMine,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::context::{ContextId, ExecutionContext};
    use crate::vm::page;
    use crate::vm::stack::VstackConfig;

    fn test_system(offset: u64) -> VstackSystem {
        let config = VstackConfig {
            arena_base: 0xffff_b000_0000_0000 + offset * 0x1000_0000,
            max_slots: 4,
            pages_per_slot: 4,
            cache_target: 8,
            ..VstackConfig::new()
        };
        VstackSystem::new(config).expect("system bring-up")
    }

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn test_not_mine_outside_arena() {
        let sys = test_system(1);
        let frame = FaultFrame::default();

        assert_eq!(
            vstack_fault(&sys, 0x1234, 0, &frame),
            FaultOutcome::NotMine
        );
        assert_eq!(
            vstack_fault(&sys, sys.arena().base() + sys.arena().size(), 0, &frame),
            FaultOutcome::NotMine
        );
    }

    #[test]
    fn test_resolved_maps_one_page() {
        let sys = test_system(2);
        let ctx = ExecutionContext::new(ContextId(1));
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        let frame = FaultFrame::default();

        let mapped_before = sys.accounting().mapped();
        let target = base + 2 * PAGE + 0x40;
        assert_eq!(vstack_fault(&sys, target, 0x96000047, &frame), FaultOutcome::Resolved);
        assert!(sys.pmap().is_mapped(base + 2 * PAGE));
        assert_eq!(sys.accounting().mapped(), mapped_before + 1);
    }

    #[test]
    fn test_fatal_on_floor_with_hole_above() {
        let sys = test_system(3);
        let ctx = ExecutionContext::new(ContextId(2));
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        let frame = FaultFrame { pc: 0x4100, lr: 0x4200, sp: base };

        // Only the top page is mapped, so the floor has a hole above it
        assert_eq!(
            vstack_fault(&sys, base, 0, &frame),
            FaultOutcome::FatalOutOfRange
        );
        assert!(!sys.pmap().is_mapped(base));
    }

    #[test]
    fn test_near_overflow_on_floor_growth() {
        let sys = test_system(4);
        let ctx = ExecutionContext::new(ContextId(3));
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        let frame = FaultFrame::default();

        // Grow the stack down one page at a time
        assert_eq!(vstack_fault(&sys, base + 2 * PAGE, 0, &frame), FaultOutcome::Resolved);
        assert_eq!(vstack_fault(&sys, base + PAGE, 0, &frame), FaultOutcome::Resolved);

        let warned_before = stats().near_overflow.load(Ordering::Relaxed);
        assert_eq!(vstack_fault(&sys, base, 0, &frame), FaultOutcome::Resolved);
        assert!(sys.pmap().is_mapped(base));
        assert!(stats().near_overflow.load(Ordering::Relaxed) >= warned_before + 1);
    }

    #[test]
    fn test_empty_cache_paths() {
        let sys = test_system(5);
        let ctx = ExecutionContext::new(ContextId(4));
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        let frame = FaultFrame::default();

        while let Some((page, _)) = sys.cache().take() {
            drop(page);
        }

        // Dry cache still resolves through the emergency reserves
        let empty_before = stats().cache_empty.load(Ordering::Relaxed);
        assert_eq!(vstack_fault(&sys, base + 2 * PAGE, 0, &frame), FaultOutcome::Resolved);
        assert!(stats().cache_empty.load(Ordering::Relaxed) >= empty_before + 1);

        // With the reserves denied too, the fault stays unresolved
        page::deny_atomic_allocs(true);
        let outcome = vstack_fault(&sys, base + PAGE, 0, &frame);
        page::deny_atomic_allocs(false);

        assert_eq!(outcome, FaultOutcome::NoMemory);
        assert!(!sys.pmap().is_mapped(base + PAGE));
    }

    #[test]
    fn test_low_cache_expedites_refill() {
        let sys = test_system(6);
        let ctx = ExecutionContext::new(ContextId(5));
        let base = sys.allocate_stack(&ctx).expect("stack allocation");
        let frame = FaultFrame::default();

        // Drain to just above the low watermark, then fault across it
        while sys.cache().len() > sys.cache().target() / 2 + 1 {
            drop(sys.cache().take());
        }
        assert_eq!(vstack_fault(&sys, base + 2 * PAGE, 0, &frame), FaultOutcome::Resolved);

        assert!(crate::kern::work::pending(WorkKind::CacheMaintain));
    }

    #[test]
    fn test_disabled_system_is_not_mine() {
        // The global system is never initialized by the test suite
        let frame = FaultFrame::default();
        assert_eq!(handle_fault(0xffff_b000_0000_0000, 0, &frame), FaultOutcome::NotMine);
    }
}
