//! Stack Shrinker
//!
//! Memory-pressure reclaim over every live execution context: walk a
//! context's stack from its saved stack pointer down to the lowest
//! page still mapped, and when the idle gap is deep enough, unmap it
//! and hand the pages straight back to the host. Running contexts are
//! skipped, never waited for, and a cooldown keeps sustained pressure
//! from rescanning constantly.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::kern::context::{self, RunState};
use crate::kern::work;
use crate::vm::page::{trunc_page, PAGE_SIZE};
use crate::vm::stack::{self, VstackSystem};

// ============================================================================
// Shrink Statistics
// ============================================================================

/// Reclaim pass statistics
#[derive(Debug)]
pub struct ShrinkStats {
    /// Passes that actually scanned
    pub scans: AtomicU64,
    /// Pages handed back to the host
    pub reclaimed: AtomicU64,
    /// Contexts skipped because they were running
    pub skipped_running: AtomicU64,
    /// Contexts skipped because their state lock was held
    pub skipped_contended: AtomicU64,
}

impl ShrinkStats {
    pub const fn new() -> Self {
        Self {
            scans: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            skipped_running: AtomicU64::new(0),
            skipped_contended: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Shrinker
// ============================================================================

/// The reclaim scanner
#[derive(Debug)]
pub struct StackShrinker {
    enabled: AtomicBool,
    last_scan: AtomicU64,
    pub stats: ShrinkStats,
}

impl StackShrinker {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            last_scan: AtomicU64::new(0),
            stats: ShrinkStats::new(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Estimate of reclaimable pages, for the host's pressure accounting
    pub fn count(&self, sys: &VstackSystem) -> usize {
        sys.accounting().mapped().max(0) as usize
    }

    /// One reclaim pass at time `now`. `pressure` is advisory; every
    /// eligible context is visited once. Returns pages reclaimed.
    pub fn scan(&self, sys: &VstackSystem, _pressure: usize, now: u64) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        // Back off under sustained pressure
        if now.saturating_sub(self.last_scan.load(Ordering::Acquire))
            <= sys.config().shrink_cooldown
        {
            return 0;
        }

        let mut reclaimed = 0;
        for ctx in context::all_contexts() {
            let sp = ctx.saved_sp();
            if ctx.stack_base() == 0 || !sys.arena().contains(sp) {
                continue;
            }
            let floor = stack_floor(sys, sp);
            if floor > sp {
                continue;
            }

            // Racing the owner's own growth is only safe while the
            // context is off-processor; poll its state lock, never wait
            if !ctx.state_lock().try_lock() {
                self.stats.skipped_contended.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if ctx.run_state() == RunState::Running {
                ctx.state_lock().unlock();
                self.stats.skipped_running.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if sp - floor >= sys.config().shrink_threshold {
                reclaimed += release_range(sys, floor, sp);
            }
            ctx.state_lock().unlock();
        }

        // Stamp even an empty pass so the cooldown holds
        self.last_scan.store(now, Ordering::Release);
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        self.stats.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }
}

/// Lowest mapped page at or below the saved stack pointer.
///
/// Returns an address above `sp` when not even the pointer's own page
/// is mapped; callers treat that as nothing to reclaim.
fn stack_floor(sys: &VstackSystem, sp: u64) -> u64 {
    let slot_base = sys.arena().slot_base(sys.arena().slot_index(sp));
    let mut addr = trunc_page(sp);
    while addr >= slot_base {
        if !sys.pmap().is_mapped(addr) {
            break;
        }
        addr -= PAGE_SIZE as u64;
    }
    addr + PAGE_SIZE as u64
}

/// Unmap `[low, page of sp)` and free straight to the host.
///
/// Bulk reclaim bypasses the page cache; this memory is wanted by the
/// rest of the system, not by the next stack fault.
fn release_range(sys: &VstackSystem, low: u64, sp: u64) -> usize {
    let mut pages = 0;
    let mut addr = low;
    while addr < trunc_page(sp) {
        if let Some(page) = sys.pmap().remove(addr) {
            let zone = page.zone();
            drop(page);
            sys.accounting().update_mapped(-1, zone);
            pages += 1;
        }
        addr += PAGE_SIZE as u64;
    }
    pages
}

// ============================================================================
// Pressure Callback
// ============================================================================

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Register with the host's pressure machinery and enable scanning
pub fn register() {
    if let Some(sys) = stack::system() {
        sys.shrinker().set_enabled(true);
    }
    REGISTERED.store(true, Ordering::Release);
}

pub fn is_registered() -> bool {
    REGISTERED.load(Ordering::Acquire)
}

/// Host pressure callback: how much could a scan give back?
pub fn pressure_count() -> usize {
    match stack::system() {
        Some(sys) => sys.reclaim_estimate(),
        None => 0,
    }
}

/// Host pressure callback: reclaim now
pub fn pressure_scan(pressure: usize) -> usize {
    match stack::system() {
        Some(sys) => sys.reclaim_scan(pressure, work::ticks()),
        None => 0,
    }
}
