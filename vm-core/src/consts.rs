//! Named tunables for the interpreter, following the teacher crate's
//! `consts.rs` pattern of giving every magic number a name instead of
//! scattering literals through the dispatch loop.

/// Heap objects at or below this size (in bytes) are served from the
/// small-object pool instead of the general allocator.
pub const POOL_MAX: usize = 32;

/// Default evaluation stack capacity, in [`crate::value::Value`] slots.
pub const DEFAULT_STACK_SIZE: usize = 1 << 16;

/// Default number of module-level static slots reserved at VM creation.
pub const DEFAULT_STATIC_SLOTS: usize = 64;

/// Byte alignment used by the default host allocator.
pub const DEFAULT_ALLOC_ALIGN: usize = 16;

static_assertions::const_assert!(POOL_MAX > 0);
static_assertions::const_assert!(DEFAULT_STACK_SIZE > 4);
