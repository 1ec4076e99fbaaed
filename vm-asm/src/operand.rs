//! Small newtypes for instruction operands.
//!
//! Kept separate from [`crate::instruction`] so the operand kinds can be
//! reused by the assembler and by `ember-vm`'s dispatch loop without pulling
//! in the full `Instruction` enum.

use core::fmt;

/// Index of a stack slot relative to the current frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackSlot(pub u8);

impl From<u8> for StackSlot {
    fn from(v: u8) -> Self {
        Self(v)
    }
}

impl From<StackSlot> for usize {
    fn from(v: StackSlot) -> Self {
        v.0 as usize
    }
}

impl fmt::Display for StackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index into a chunk's constant pool.
///
/// Widened to 16 bits per the bytecode-format note in §6 of the spec (an
/// 8-bit pool index is the common case but caps a chunk at 256 constants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstIdx(pub u16);

impl From<u16> for ConstIdx {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl From<ConstIdx> for usize {
    fn from(v: ConstIdx) -> Self {
        v.0 as usize
    }
}

/// Signed relative jump offset, in bytes, from the start of the jump
/// instruction itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Offset(pub i16);

impl From<i16> for Offset {
    fn from(v: i16) -> Self {
        Self(v)
    }
}

/// Index into a function- or method-symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymId(pub u16);

impl From<u16> for SymId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl From<SymId> for usize {
    fn from(v: SymId) -> Self {
        v.0 as usize
    }
}
