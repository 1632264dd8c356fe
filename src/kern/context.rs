//! Execution Contexts
//!
//! The registry of live execution contexts the stack allocator serves.
//! Each context carries its saved stack pointer, its run state behind a
//! short state lock, and the base of the stack slot bound to it. The
//! reclaim scanner enumerates these; everything else goes through the
//! owning context.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::kern::lock::SimpleLock;

// ============================================================================
// Context Identifier
// ============================================================================

/// Context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u64);

impl ContextId {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

// ============================================================================
// Run State
// ============================================================================

/// Run state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RunState {
    /// Off-processor; the stack is quiescent
    Idle = 0,
    /// On a processor or runnable; the stack is volatile
    Running = 1,
}

// ============================================================================
// Execution Context
// ============================================================================

/// A live execution context
#[derive(Debug)]
pub struct ExecutionContext {
    /// Context identifier
    pub id: ContextId,

    /// Run state (`RunState` as u32)
    state: AtomicU32,

    /// Stack pointer captured at the last switch-out
    saved_sp: AtomicU64,

    /// Base address of the stack slot bound to this context (0 = none)
    stack_base: AtomicU64,

    /// State lock; transitions take it, the reclaim scanner polls it
    lock: SimpleLock,
}

impl ExecutionContext {
    /// Create a new idle context
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            state: AtomicU32::new(RunState::Idle as u32),
            saved_sp: AtomicU64::new(0),
            stack_base: AtomicU64::new(0),
            lock: SimpleLock::new(),
        }
    }

    /// Current run state
    pub fn run_state(&self) -> RunState {
        if self.state.load(Ordering::Acquire) == RunState::Running as u32 {
            RunState::Running
        } else {
            RunState::Idle
        }
    }

    /// Transition run state under the state lock
    pub fn set_run_state(&self, state: RunState) {
        self.lock.lock();
        self.state.store(state as u32, Ordering::Release);
        self.lock.unlock();
    }

    /// Stack pointer saved at the last switch-out
    pub fn saved_sp(&self) -> u64 {
        self.saved_sp.load(Ordering::Acquire)
    }

    /// Record the stack pointer at switch-out
    pub fn set_saved_sp(&self, sp: u64) {
        self.saved_sp.store(sp, Ordering::Release);
    }

    /// Base of the stack slot bound to this context, 0 if none
    pub fn stack_base(&self) -> u64 {
        self.stack_base.load(Ordering::Acquire)
    }

    /// Bind (or unbind, with 0) a stack slot base
    pub fn set_stack_base(&self, base: u64) {
        self.stack_base.store(base, Ordering::Release);
    }

    /// The state lock itself, for callers that must not wait on it
    pub fn state_lock(&self) -> &SimpleLock {
        &self.lock
    }
}

// ============================================================================
// Context Registry
// ============================================================================

/// Registry of live contexts
pub struct ContextTable {
    contexts: BTreeMap<ContextId, Arc<ExecutionContext>>,
    next_id: u64,
}

impl ContextTable {
    pub fn new() -> Self {
        Self {
            contexts: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Create and register a new context
    pub fn create(&mut self) -> Arc<ExecutionContext> {
        let id = ContextId(self.next_id);
        self.next_id += 1;

        let ctx = Arc::new(ExecutionContext::new(id));
        self.contexts.insert(id, Arc::clone(&ctx));
        ctx
    }

    /// Find a context by ID
    pub fn find(&self, id: ContextId) -> Option<Arc<ExecutionContext>> {
        self.contexts.get(&id).cloned()
    }

    /// Remove a context from the registry
    pub fn remove(&mut self, id: ContextId) -> bool {
        self.contexts.remove(&id).is_some()
    }

    /// Every live context
    pub fn all(&self) -> Vec<Arc<ExecutionContext>> {
        self.contexts.values().cloned().collect()
    }

    /// Number of live contexts
    pub fn count(&self) -> usize {
        self.contexts.len()
    }
}

// ============================================================================
// Global State
// ============================================================================

static CONTEXTS: spin::Once<Mutex<ContextTable>> = spin::Once::new();

fn context_table() -> &'static Mutex<ContextTable> {
    CONTEXTS.call_once(|| Mutex::new(ContextTable::new()));
    CONTEXTS.get().unwrap()
}

/// Initialize the context registry
pub fn init() {
    let _ = context_table();
}

/// Create a context
pub fn context_create() -> Arc<ExecutionContext> {
    context_table().lock().create()
}

/// Find a context by ID
pub fn context_find(id: ContextId) -> Option<Arc<ExecutionContext>> {
    context_table().lock().find(id)
}

/// Remove a context
pub fn context_remove(id: ContextId) -> bool {
    context_table().lock().remove(id)
}

/// Every live context
pub fn all_contexts() -> Vec<Arc<ExecutionContext>> {
    context_table().lock().all()
}

/// Number of live contexts
pub fn context_count() -> usize {
    context_table().lock().count()
}
