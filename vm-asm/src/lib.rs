//! Bytecode instruction set for the EmberVM interpreter.
//!
//! This crate owns the wire format: the [`OpCode`] byte values, the decoded
//! [`Instruction`] representation, and the [`Assembler`] used to hand-build
//! chunks of bytecode without a real compiler front end (which is out of
//! scope for this workspace — see the crate-level docs on `ember-vm`).
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod instruction;
pub mod opcode;
pub mod operand;

mod builder;

pub use builder::Assembler;
pub use instruction::{DecodeError, Instruction};
pub use opcode::OpCode;
pub use operand::{ConstIdx, Offset, StackSlot, SymId};

/// Width, in bytes, of a single stack word / constant-pool reference slot.
///
/// Mirrors `WORD_SIZE` in the teacher crate's `consts.rs`: every [`crate::operand`]
/// accessor is defined in terms of this width so the encoding stays
/// self-consistent if it is ever widened.
pub const WORD_SIZE: usize = 8;
