//! Named VM tunables (ambient configuration layer), following the teacher
//! crate's pattern of a single params struct supplied at construction
//! rather than scattering literals through the interpreter.

use crate::consts::{DEFAULT_STACK_SIZE, DEFAULT_STATIC_SLOTS};

/// Construction-time VM limits and behavior knobs.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Capacity, in [`crate::value::Value`] slots, of the eval stack.
    pub stack_size: usize,
    /// Number of module-level static slots reserved up front.
    pub initial_static_slots: usize,
    /// Whether `verbose` per-instruction tracing is enabled (§9's "global
    /// mutable state" note: modeled as a per-VM field, not a process global).
    pub verbose: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { stack_size: DEFAULT_STACK_SIZE, initial_static_slots: DEFAULT_STATIC_SLOTS, verbose: false }
    }
}
