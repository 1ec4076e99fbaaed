//! Call-frame manager (C6).
//!
//! The evaluation stack is one contiguous `Vec<Value>`; a callee's frame is
//! the sub-slice `[start_local .. start_local + num_locals)` of it. §3's
//! frame-layout table reserves stack slots 1-3 of every callee frame for
//! bookkeeping (requested return count, flags, saved pc, saved frame
//! pointer) bit-packed alongside `Value`s. Rust has no safe way to overlay
//! an arbitrary struct on a NaN-boxed `Value` slot, so this port keeps that
//! bookkeeping in a parallel [`Frames`] stack instead — slot 0 (the return
//! value) remains a real stack slot, matching the table's first row. See
//! `DESIGN.md` for why this is a deliberate redesign rather than a
//! simplification of the spec.

/// Bit 0 of a frame's flags: set when returning from this frame should stop
/// the dispatch loop rather than resume the caller (the entry frame).
pub const FINAL_RETURN_FLAG: u8 = 0x1;

/// Saved bookkeeping for one call, restored by `Ret0`/`Ret1`.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Index into the flat eval stack where this frame's slot 0 begins.
    pub start_local: usize,
    /// Requested return-value count: 0 or 1 (§3; other values are a verifier error).
    pub req_ret: u8,
    /// Flag byte; bit 0 is [`FINAL_RETURN_FLAG`].
    pub flags: u8,
    /// `pc` to resume the caller at.
    pub return_pc: u32,
    /// The caller's own `start_local`, to restore the frame pointer.
    pub saved_start_local: usize,
    /// Absolute stack index the return value lands at when `req_ret == 1`.
    ///
    /// The spec's call-frame table assumes the return value always lands at
    /// the callee frame's own slot 0, which is where `CallSym`/`CallObjSym`
    /// place it. `Call1` breaks that assumption — its `dst` operand may name
    /// a different caller register than its `callee` operand — so this port
    /// tracks the landing site explicitly instead of hardcoding `start_local`.
    pub caller_dst: usize,
}

impl Frame {
    pub fn is_final_return(&self) -> bool {
        self.flags & FINAL_RETURN_FLAG != 0
    }
}

/// Stack of in-flight [`Frame`]s, innermost last.
#[derive(Debug, Default)]
pub struct Frames {
    stack: Vec<Frame>,
}

impl Frames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.stack.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.stack.pop()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Rebuild from a raw saved frame stack, used when restoring a fiber's
    /// context on `Coresume`.
    pub fn from_raw(stack: Vec<Frame>) -> Self {
        Self { stack }
    }

    /// Take the raw frame stack out, used when snapshotting a fiber's
    /// context on `Coyield`/`Coreturn`.
    pub fn take_raw(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.stack)
    }
}

/// `true` iff a callee frame starting at `start_local` with `num_locals`
/// slots would run past `stack_capacity`, per the §3 invariant
/// `stack + startLocal + numLocals <= stackEndPtr`.
pub fn would_overflow(start_local: usize, num_locals: usize, stack_capacity: usize) -> bool {
    start_local.saturating_add(num_locals) > stack_capacity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_check_matches_boundary() {
        assert!(!would_overflow(10, 20, 30));
        assert!(would_overflow(10, 21, 30));
        assert!(!would_overflow(0, 30, 30));
    }

    #[test]
    fn frame_push_pop_restores_saved_state() {
        let mut frames = Frames::new();
        frames.push(Frame {
            start_local: 0,
            req_ret: 1,
            flags: FINAL_RETURN_FLAG,
            return_pc: 0,
            saved_start_local: 0,
            caller_dst: 0,
        });
        frames.push(Frame { start_local: 8, req_ret: 1, flags: 0, return_pc: 42, saved_start_local: 0, caller_dst: 0 });
        let inner = frames.pop().unwrap();
        assert_eq!(inner.return_pc, 42);
        assert!(!inner.is_final_return());
        let outer = frames.pop().unwrap();
        assert!(outer.is_final_return());
        assert!(frames.pop().is_none());
    }
}
