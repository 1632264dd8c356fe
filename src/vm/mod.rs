//! Virtual Stack Subsystem
//!
//! On-demand stacks for execution contexts:
//! - page: owned physical page handles
//! - pmap: virtual-to-physical mappings over the arena
//! - arena: the reserved range and the slot bitmap
//! - cache: pre-allocated free pages plus the replenisher
//! - fault: lazy mapping on first touch
//! - stack: slot lifecycle and the system instance
//! - shrink: reclaim of idle stack depth under pressure
//! - accounting: mapped-page counters and reporting

pub mod accounting;
pub mod arena;
pub mod cache;
pub mod fault;
pub mod page;
pub mod pmap;
pub mod shrink;
pub mod stack;

pub use accounting::{mapped_pages, register_hook, Accounting, AccountingHook};
pub use arena::{Arena, SlotError, SlotTable};
pub use cache::{PageCache, CACHE_PAGES_MAX};
pub use fault::{handle_fault, FaultFrame, FaultOutcome};
pub use page::{AllocMode, Page, ZoneId, PAGE_SHIFT, PAGE_SIZE};
pub use pmap::Pmap;
pub use shrink::{pressure_count, pressure_scan, StackShrinker};
pub use stack::{allocate_stack, free_stack, InitError, StackAllocError, VstackConfig, VstackSystem};

/// Initialize the virtual stack subsystem
pub fn init(config: stack::VstackConfig) -> Result<(), stack::InitError> {
    stack::init(config)
}
