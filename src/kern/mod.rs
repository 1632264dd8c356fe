//! Kern subsystem - Host-side kernel primitives
//!
//! The pieces of the host kernel the stack allocator leans on: short
//! spin locks, the system tick with delayed background work, and the
//! registry of live execution contexts.

pub mod context;
pub mod lock;
pub mod work;

pub use context::{all_contexts, context_create, context_find, context_remove, ContextId, ExecutionContext, RunState};
pub use lock::SimpleLock;
pub use work::{timer_tick, WorkKind};

/// Initialize the kern subsystem
pub fn init() {
    work::init();
    context::init();
}
