//! End-to-end scenarios (§8): hand-assembled chunks run to completion
//! through `Vm::eval_chunk`, exercising the dispatch loop the way a real
//! compiler's output would.

use ember_asm::{Assembler, ConstIdx, Instruction, StackSlot, SymId};
use ember_vm::chunk::Chunk;
use ember_vm::heap::{CallTarget, HeapObject, NativeFuncId, TypeId};
use ember_vm::value::Value;
use ember_vm::vm::Vm;

#[test]
fn integer_arithmetic_is_exact() {
    let mut asm = Assembler::new();
    asm.const_i8_int(3, StackSlot(1));
    asm.const_i8_int(4, StackSlot(2));
    asm.emit(Instruction::AddInt { a: StackSlot(1), b: StackSlot(2), dst: StackSlot(0) });
    asm.end();
    let chunk = Chunk::new(asm.finish(), vec![], vec![]);

    let mut vm = Vm::create();
    let result = vm.eval_chunk(chunk).unwrap();
    assert!(result.is_integer());
    assert_eq!(result.as_integer(), 7);
}

#[test]
fn float_fallback_promotes_mixed_operands() {
    let mut asm = Assembler::new();
    asm.const_i8_int(1, StackSlot(1)); // integer 1
    asm.emit(Instruction::ConstOp { c: ConstIdx(0), dst: StackSlot(2) }); // double 0.5
    asm.emit(Instruction::Add { a: StackSlot(1), b: StackSlot(2), dst: StackSlot(0) });
    asm.end();
    let chunk = Chunk::new(asm.finish(), vec![Value::float(0.5)], vec![]);

    let mut vm = Vm::create();
    let result = vm.eval_chunk(chunk).unwrap();
    assert!(result.is_double());
    assert_eq!(result.as_double(), 1.5);
}

#[test]
fn list_index_and_clean_release() {
    let mut asm = Assembler::new();
    asm.const_i8_int(10, StackSlot(1));
    asm.const_i8_int(20, StackSlot(2));
    asm.const_i8_int(30, StackSlot(3));
    asm.emit(Instruction::List { start: StackSlot(1), n: 3, dst: StackSlot(4) });
    asm.const_i8_int(1, StackSlot(5));
    asm.emit(Instruction::Index { recv: StackSlot(4), index: StackSlot(5), dst: StackSlot(0) });
    asm.emit(Instruction::Release { r: StackSlot(4) });
    asm.end();
    let chunk = Chunk::new(asm.finish(), vec![], vec![]);

    let mut vm = Vm::create();
    let result = vm.eval_chunk(chunk).unwrap();
    assert!(result.is_integer());
    assert_eq!(result.as_integer(), 20);

    vm.deinit();
    assert_eq!(vm.global_rc(), 0, "the list must not outlive its last release");
}

#[test]
fn for_range_ascending_sums_zero_to_four() {
    // s = 0.0; for i in 0.0..5.0 step 1.0 { s = s + i }; return s  (expect 10.0)
    let mut asm = Assembler::new();
    asm.emit(Instruction::ConstI8 { imm: 0, dst: StackSlot(1) }); // s
    asm.emit(Instruction::ConstI8 { imm: 0, dst: StackSlot(2) }); // start
    asm.emit(Instruction::ConstI8 { imm: 5, dst: StackSlot(3) }); // end
    asm.emit(Instruction::ConstI8 { imm: 1, dst: StackSlot(4) }); // step

    // ForRangeInit's body_offset must land exactly on the paired ForRange
    // instruction, which this assembler places right after the one-line
    // loop body (an Add). Both instructions encode to 8 bytes (1 tag byte +
    // 5 StackSlots + one i16), so body_offset is simply that width.
    let for_range_init_len = 8;
    let add_len = 4; // 1 tag byte + 3 StackSlots
    let body_offset = (for_range_init_len + add_len) as i16;

    asm.emit(Instruction::ForRangeInit {
        start: StackSlot(2),
        end: StackSlot(3),
        step: StackSlot(4),
        counter: StackSlot(5),
        user_var: StackSlot(6),
        body_offset: body_offset.into(),
    });
    asm.emit(Instruction::Add { a: StackSlot(1), b: StackSlot(6), dst: StackSlot(1) });
    // Placeholder for ForRangeInit to overwrite with ForRange/ForRangeReverse;
    // its own back_offset jumps back to the Add above.
    let back_offset: i16 = -(add_len as i16);
    asm.emit(Instruction::ForRange {
        counter: StackSlot(5),
        step: StackSlot(4),
        end: StackSlot(3),
        user_var: StackSlot(6),
        back_offset: back_offset.into(),
    });
    asm.emit(Instruction::Copy { src: StackSlot(1), dst: StackSlot(0) });
    asm.end();
    let chunk = Chunk::new(asm.finish(), vec![], vec![]);

    let mut vm = Vm::create();
    let result = vm.eval_chunk(chunk).unwrap();
    assert!(result.is_double());
    assert_eq!(result.as_double(), 10.0);
}

#[test]
fn for_range_skips_an_empty_range() {
    // Same shape as above but start == end: the loop body (which would bump
    // a sentinel) must never run.
    let mut asm = Assembler::new();
    asm.emit(Instruction::ConstI8 { imm: 3, dst: StackSlot(2) }); // start
    asm.emit(Instruction::ConstI8 { imm: 3, dst: StackSlot(3) }); // end (== start)
    asm.emit(Instruction::ConstI8 { imm: 1, dst: StackSlot(4) }); // step
    asm.const_i8_int(11, StackSlot(7)); // sentinel, untouched if the loop is skipped

    let for_range_init_len = 8;
    let sentinel_write_len = 3; // ConstI8Int
    let body_offset = (for_range_init_len + sentinel_write_len) as i16;

    asm.emit(Instruction::ForRangeInit {
        start: StackSlot(2),
        end: StackSlot(3),
        step: StackSlot(4),
        counter: StackSlot(5),
        user_var: StackSlot(6),
        body_offset: body_offset.into(),
    });
    asm.const_i8_int(222, StackSlot(7)); // would run only if the loop executed
    asm.emit(Instruction::ForRange {
        counter: StackSlot(5),
        step: StackSlot(4),
        end: StackSlot(3),
        user_var: StackSlot(6),
        back_offset: (-(sentinel_write_len as i16)).into(),
    });
    asm.emit(Instruction::Copy { src: StackSlot(7), dst: StackSlot(0) });
    asm.end();
    let chunk = Chunk::new(asm.finish(), vec![], vec![]);

    let mut vm = Vm::create();
    let result = vm.eval_chunk(chunk).unwrap();
    assert!(result.is_integer());
    assert_eq!(result.as_integer(), 111, "an empty range must not run its body");
}

#[test]
fn method_call_returns_the_same_answer_before_and_after_its_cache_is_warm() {
    // A bound native "size" method on astrings; `"hello".size()` run several
    // times in a row must return the same answer whether or not an earlier
    // call already warmed the site's inline cache (P3). `Vm::eval_chunk`
    // takes its `Chunk` by value, so a byte-level assertion that the call
    // site actually rewrites itself lives in `dispatch`'s own test module,
    // which can hold a `&mut Chunk` across repeated `run` calls.
    fn native_size(vm: &mut Vm, args: &[Value]) -> Value {
        let recv = args[0];
        match vm.heap().get(recv.as_pointer()) {
            HeapObject::Astring(s) => Value::integer(s.len() as i32),
            _ => Value::NONE,
        }
    }

    let mut vm = Vm::create();
    let native_id = NativeFuncId(1);
    vm.register_host_func(native_id, native_size);
    let size_sym = SymId(0);
    vm.symbols_mut().declare_method(TypeId::ASTRING, size_sym.0, CallTarget::Native(native_id));

    let hello = vm.heap_mut().alloc(TypeId::ASTRING, HeapObject::Astring("hello".to_string()));

    let mut asm = Assembler::new();
    // n_args == 0: the receiver is the call site's only operand, living at
    // start_local + n_args + 3 == start_local + 3.
    asm.emit(Instruction::ConstOp { c: ConstIdx(0), dst: StackSlot(3) });
    asm.emit(Instruction::CallObjSym { start: StackSlot(0), n_args: 0, n_ret: 1, sym: size_sym });
    asm.end();
    let code = asm.finish();
    let consts = vec![Value::pointer(hello)];

    for _ in 0..3 {
        let chunk = Chunk::new(code.clone(), consts.clone(), vec![]);
        let result = vm.eval_chunk(chunk).unwrap();
        assert!(result.is_integer());
        assert_eq!(result.as_integer(), 5);
    }

    vm.release(Value::pointer(hello));
}

#[test]
fn two_node_cycle_is_freed_by_perform_gc() {
    let mut vm = Vm::create();
    let a = vm.heap_mut().alloc(TypeId::BOX, HeapObject::Box(Value::NONE));
    let b = vm.heap_mut().alloc(TypeId::BOX, HeapObject::Box(Value::pointer(a)));
    *vm.heap_mut().get_mut(a) = HeapObject::Box(Value::pointer(b));

    // Drop the only external references; a <-> b now form an isolated cycle
    // that plain refcounting alone cannot reclaim.
    vm.release(Value::pointer(a));
    vm.release(Value::pointer(b));
    assert_eq!(vm.heap().live_count(), 2);

    let stats = vm.perform_gc();
    assert_eq!(stats.num_cyc_freed, 2);
    assert_eq!(stats.num_obj_freed, 2);
    assert_eq!(vm.heap().live_count(), 0);
    assert_eq!(vm.global_rc(), 0);
}
