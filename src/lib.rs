//! Vstack - On-demand virtual stacks for execution contexts
//!
//! Reserves one large virtual arena, slices it into fixed-size stack
//! slots, maps only the top page of a slot up front, and maps the rest
//! lazily from a cache of pre-allocated pages the first time each page
//! is touched. A background pass keeps the cache topped up, and a
//! pressure-driven scanner takes idle stack depth back.

#![no_std]
// Kernel types often have specialized construction that doesn't fit Default
#![allow(clippy::new_without_default)]
// Manual ceiling division is clearer in memory allocation contexts
#![allow(clippy::manual_div_ceil)]

// Standard library replacement for no_std
extern crate alloc;

pub mod console;
pub mod kern;
pub mod vm;

/// Subsystem version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Subsystem name
pub const NAME: &str = "vstack";

/// Initialize the subsystem: host primitives first, then the stack
/// allocator itself. On failure the feature stays disabled and stack
/// callers fall back to their ordinary provisioning.
pub fn init(config: vm::stack::VstackConfig) -> Result<(), vm::stack::InitError> {
    kern::init();
    vm::init(config)
}
