//! Hand-assembly of bytecode chunks.
//!
//! There is no compiler front end in this workspace (parsing and codegen are
//! explicitly out of scope — see the crate docs on `ember-vm`). Tests and
//! host embedders that need to construct bytecode directly do it through
//! [`Assembler`], a thin append-only builder that also resolves forward jump
//! targets, mirroring how the teacher crate's integration tests build
//! programs with `op::`-style constructors instead of a parser.

use std::collections::HashMap;

use crate::instruction::Instruction;
use crate::operand::Offset;

/// An unresolved jump target, fixed up once its label is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

enum Patch {
    /// Offset of the two-byte little-endian field to patch, and the byte
    /// offset of the instruction it's relative to.
    Offset { field_at: usize, instr_at: usize },
}

/// Append-only bytecode builder with forward-label support.
///
/// ```
/// use ember_asm::{Assembler, StackSlot};
///
/// let mut asm = Assembler::new();
/// let done = asm.new_label();
/// asm.const_i8_int(0, StackSlot(0));
/// asm.jump_not_cond(StackSlot(0), done);
/// asm.const_i8_int(1, StackSlot(1));
/// asm.define_label(done);
/// asm.ret1();
/// let chunk = asm.finish();
/// ```
#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: HashMap<Label, usize>,
    patches: Vec<(Label, Patch)>,
    next_label: usize,
}

impl Assembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length of the emitted code, i.e. where the next instruction
    /// will land.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Allocate a new, as-yet-undefined label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind `label` to the current write position.
    ///
    /// # Panics
    /// Panics if `label` was already defined.
    pub fn define_label(&mut self, label: Label) {
        let prev = self.labels.insert(label, self.code.len());
        assert!(prev.is_none(), "label defined twice");
    }

    /// Append `inst` verbatim.
    pub fn emit(&mut self, inst: Instruction) {
        inst.encode(&mut self.code);
    }

    /// Append a [`Instruction::Jump`] to `label`, resolved at [`Self::finish`].
    pub fn jump(&mut self, label: Label) {
        self.emit_with_offset_patch(label, |offset| Instruction::Jump { offset });
    }

    /// Append a [`Instruction::JumpCond`] to `label`.
    pub fn jump_cond(&mut self, src: crate::operand::StackSlot, label: Label) {
        self.emit_with_offset_patch(label, move |offset| Instruction::JumpCond { src, offset });
    }

    /// Append a [`Instruction::JumpNotCond`] to `label`.
    pub fn jump_not_cond(&mut self, src: crate::operand::StackSlot, label: Label) {
        self.emit_with_offset_patch(label, move |offset| Instruction::JumpNotCond { src, offset });
    }

    /// Append a [`Instruction::JumpNotNone`] to `label`.
    pub fn jump_not_none(&mut self, src: crate::operand::StackSlot, label: Label) {
        self.emit_with_offset_patch(label, move |offset| Instruction::JumpNotNone { src, offset });
    }

    fn emit_with_offset_patch(&mut self, label: Label, build: impl FnOnce(Offset) -> Instruction) {
        let instr_at = self.code.len();
        // Placeholder offset; patched once the label resolves.
        build(Offset(0)).encode(&mut self.code);
        // The offset field is always the trailing two bytes of these variants.
        let field_at = self.code.len() - 2;
        if let Some(&target) = self.labels.get(&label) {
            self.patch_offset(field_at, instr_at, target);
        } else {
            self.patches.push((label, Patch::Offset { field_at, instr_at }));
        }
    }

    fn patch_offset(&mut self, field_at: usize, instr_at: usize, target: usize) {
        let delta = target as i64 - instr_at as i64;
        let delta: i16 = delta.try_into().expect("jump target out of i16 range");
        let bytes = delta.to_le_bytes();
        self.code[field_at] = bytes[0];
        self.code[field_at + 1] = bytes[1];
    }

    /// `dst = (integer) imm`.
    pub fn const_i8_int(&mut self, imm: i8, dst: crate::operand::StackSlot) {
        self.emit(Instruction::ConstI8Int { imm, dst });
    }

    /// Return with the value already written to frame slot 0.
    pub fn ret1(&mut self) {
        self.emit(Instruction::Ret1);
    }

    /// Return with no value.
    pub fn ret0(&mut self) {
        self.emit(Instruction::Ret0);
    }

    /// Halt the dispatch loop successfully.
    pub fn end(&mut self) {
        self.emit(Instruction::End);
    }

    /// Resolve all outstanding label references and return the assembled code.
    ///
    /// # Panics
    /// Panics if any label referenced with [`Self::jump`] (or its
    /// conditional variants) was never defined with [`Self::define_label`].
    pub fn finish(mut self) -> Vec<u8> {
        let patches = std::mem::take(&mut self.patches);
        for (label, Patch::Offset { field_at, instr_at }) in patches {
            let target = *self
                .labels
                .get(&label)
                .unwrap_or_else(|| panic!("label {label:?} never defined"));
            self.patch_offset(field_at, instr_at, target);
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operand::StackSlot;

    #[test]
    fn forward_jump_resolves_to_correct_delta() {
        let mut asm = Assembler::new();
        let skip = asm.new_label();
        asm.jump_not_cond(StackSlot(0), skip);
        asm.const_i8_int(1, StackSlot(1));
        asm.define_label(skip);
        asm.ret1();
        let code = asm.finish();

        // JumpNotCond (4 bytes) then ConstI8Int (3 bytes) lands exactly on `skip`.
        let (inst, _) = Instruction::decode(&code).unwrap();
        match inst {
            Instruction::JumpNotCond { offset, .. } => assert_eq!(offset.0, 7),
            other => panic!("unexpected instruction {other:?}"),
        }
    }

    #[test]
    fn backward_jump_resolves_to_negative_delta() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        asm.define_label(top);
        asm.const_i8_int(0, StackSlot(0));
        asm.jump(top);
        let code = asm.finish();

        // Skip the first instruction (ConstI8Int, 3 bytes) to reach the jump.
        let (_, first_len) = Instruction::decode(&code).unwrap();
        let (inst, _) = Instruction::decode(&code[first_len..]).unwrap();
        match inst {
            Instruction::Jump { offset } => assert_eq!(offset.0, -(first_len as i16)),
            other => panic!("unexpected instruction {other:?}"),
        }
    }
}
