//! Fiber/coroutine scheduler (C9).
//!
//! Fibers are explicit, cooperative user-level coroutines: `Coinit`
//! allocates one, `Coyield`/`Coresume` hand control back and forth, and
//! `Coreturn` marks one `Done`. Per §5, exactly one fiber runs at a time and
//! native host functions may not suspend — the only suspension points are
//! the two opcodes named above.

use crate::frame::{Frame, FINAL_RETURN_FLAG};
use crate::value::Value;

/// Lifecycle state of a [`FiberState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Allocated but never resumed.
    Init,
    /// Currently executing (is the VM's `current_fiber`).
    Running,
    /// Suspended at a `Coyield`, resumable.
    Suspended,
    /// Returned or reached `Coreturn`; cannot be resumed again.
    Done,
}

/// A fiber's saved execution context: its own stack, its own `pc`, and the
/// parent to switch back to on yield/return. Stored as the payload of a
/// [`crate::heap::HeapObject::Fiber`].
#[derive(Debug)]
pub struct FiberState {
    pub status: FiberStatus,
    /// The fiber's private evaluation stack, independent of its parent's.
    pub stack: Vec<Value>,
    /// Saved program counter; meaningful while `status != Running`.
    pub pc: u32,
    /// Frame-pointer offset into `stack` where the fiber's current frame starts.
    pub fp: usize,
    /// Saved call-frame stack, mirroring the main dispatch loop's `Frames`.
    pub frames: Vec<Frame>,
    /// The context to resume when this fiber yields or returns: a parent
    /// fiber, or `None` meaning the VM's root context (the root has no
    /// `HeapRef` of its own to name).
    pub parent: Option<crate::value::HeapRef>,
    /// Value handed back to the resumer by the most recent yield/return.
    pub result: Value,
    /// Absolute stack index, in whichever context resumes this fiber, that
    /// its next yield/return result lands at. Stashed by `Coresume` right
    /// before switching away from the resumer, consumed by the dispatch
    /// loop's fiber-switch helper once control returns to it.
    pub resume_dst: usize,
}

impl FiberState {
    /// Snapshot a fresh fiber ready to begin at `init_pc`, seeded with
    /// `args` copied onto its own stack (per `Coinit`'s contract: the fiber
    /// gets an independent stack and a copy of the caller's arguments).
    ///
    /// Seeded with its own entry frame, same convention as the root
    /// context's in `Vm::eval_chunk`: when the fiber's code runs off the end
    /// via `Ret0`/`Ret1`/`End`, the dispatch loop sees an empty frame stack
    /// and treats that as the fiber finishing rather than halting the VM.
    pub fn new(args: &[Value], init_pc: u32, stack_size: usize) -> Self {
        let mut stack = vec![Value::NONE; stack_size];
        stack[..args.len()].copy_from_slice(args);
        let frames = vec![Frame {
            start_local: 0,
            req_ret: 1,
            flags: FINAL_RETURN_FLAG,
            return_pc: 0,
            saved_start_local: 0,
            caller_dst: 0,
        }];
        Self {
            status: FiberStatus::Init,
            stack,
            pc: init_pc,
            fp: 0,
            frames,
            parent: None,
            result: Value::NONE,
            resume_dst: 0,
        }
    }
}
