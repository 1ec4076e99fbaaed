//! Compiled bytecode unit: code, constant pool, and pc-to-line table (§6).
//!
//! A `Chunk` is what an (out-of-scope) compiler front end — or this crate's
//! own [`ember_asm::Assembler`] in tests — hands the dispatch loop. The code
//! stream is deliberately mutable: inline-cache opcodes rewrite their own
//! bytes in place on cache hit/miss (§4.4, §9's "self-modifying bytecode"
//! design note), rather than keeping a parallel side-table.

use crate::value::Value;

/// One compiled bytecode unit, produced from a single source module.
#[derive(Debug, Default)]
pub struct Chunk {
    /// Variable-length, byte-aligned instruction stream. Mutable: inline
    /// caches rewrite opcode bytes and operand fields in place.
    pub code: Vec<u8>,
    /// Constant pool, referenced by [`ember_asm::ConstIdx`].
    pub consts: Vec<Value>,
    /// Sorted `(pc, line)` pairs; the line in effect at `pc` is that of the
    /// last entry whose `pc` does not exceed it. Emitted by the compiler;
    /// used only to enrich panic reports (§7).
    pub line_table: Vec<(u32, u32)>,
}

impl Chunk {
    pub fn new(code: Vec<u8>, consts: Vec<Value>, line_table: Vec<(u32, u32)>) -> Self {
        Self { code, consts, line_table }
    }

    /// Resolve the source line in effect at `pc`, if the compiler emitted a
    /// line table for this chunk.
    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        self.line_table.partition_point(|&(p, _)| p <= pc).checked_sub(1).map(|i| self.line_table[i].1)
    }
}
