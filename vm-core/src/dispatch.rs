//! The dispatch loop (C7): decode-execute cycle over a [`Chunk`]'s bytecode.
//!
//! Mirrors the teacher crate's `execute`/`instruction`/`_instruction` split:
//! [`run`] is the outer loop (its `run_call` analogue), [`step`] is the
//! `_instruction` analogue — one big match from decoded [`Instruction`] to
//! effect, with small named helpers doing the actual state mutation so each
//! arm reads as one or two lines. Every helper takes and returns plain
//! values; nothing here knows about `unsafe`.

use ember_asm::{Instruction, OpCode, StackSlot, SymId};

use crate::chunk::Chunk;
use crate::error::PanicReason;
use crate::fallback;
use crate::frame::{self, Frame};
use crate::heap::{CallTarget, Heap, HeapObject, IndexMap, NativeFuncId, TypeId};
use crate::value::Value;
use crate::vm::Vm;

/// Outcome of one decoded instruction.
enum Step {
    Continue,
    Halt(Value),
}

/// Run `chunk` from the `Vm`'s current `pc` until `End`/the entry frame's
/// final `Ret0`/`Ret1`, returning the halting value.
pub fn run(vm: &mut Vm, chunk: &mut Chunk) -> Result<Value, PanicReason> {
    loop {
        let instr_start = vm.pc();
        let (inst, len) = Instruction::decode(&chunk.code[instr_start as usize..])
            .map_err(|e| PanicReason::VerifierViolation { detail: e.to_string() })?;
        let next_pc = instr_start + len as u32;
        vm.set_pc(next_pc);
        tracing::trace!(pc = instr_start, inst = %inst, "dispatch");

        match step(vm, chunk, inst, instr_start) {
            Ok(Step::Continue) => {}
            Ok(Step::Halt(v)) => return Ok(v),
            Err(reason) => match recover_try_value(vm, chunk, next_pc, reason)? {
                Some(resumed_pc) => vm.set_pc(resumed_pc),
                None => return Err(last_err(vm, chunk, next_pc)),
            },
        }
    }
}

/// A panic landing on a `TryValue` guard becomes an `Error` value instead of
/// propagating (`TryValue`'s own doc: "resume at the next instruction").
/// Returns the resumed `pc` on a catch, or re-raises by returning the
/// original error through `last_err`.
fn recover_try_value(
    vm: &mut Vm,
    chunk: &Chunk,
    next_pc: u32,
    reason: PanicReason,
) -> Result<Option<u32>, PanicReason> {
    match Instruction::decode(&chunk.code[next_pc as usize..]) {
        Ok((Instruction::TryValue { dst }, try_len)) => {
            let v = Value::error(panic_symbol_id(&reason));
            set(vm, dst, v);
            Ok(Some(next_pc + try_len as u32))
        }
        _ => {
            // Stash so the caller's `Err` path can still report it; see `last_err`.
            LAST_UNCAUGHT.with(|cell| *cell.borrow_mut() = Some(reason));
            Ok(None)
        }
    }
}

thread_local! {
    static LAST_UNCAUGHT: std::cell::RefCell<Option<PanicReason>> = const { std::cell::RefCell::new(None) };
}

fn last_err(_vm: &Vm, _chunk: &Chunk, _next_pc: u32) -> PanicReason {
    LAST_UNCAUGHT.with(|cell| cell.borrow_mut().take()).unwrap_or(PanicReason::Corruption)
}

/// A small stable id per panic kind, used only so `TryValue` has *some*
/// distinguishing payload to carry; this port has no symbol-interning table
/// to look a real name up in (see `DESIGN.md`).
fn panic_symbol_id(reason: &PanicReason) -> u32 {
    match reason {
        PanicReason::TypeError { .. } => 1,
        PanicReason::DivByZero => 2,
        PanicReason::OutOfMemory => 3,
        PanicReason::StackOverflow => 4,
        PanicReason::NotFound { .. } => 5,
        PanicReason::HostFuncMissing { .. } => 6,
        PanicReason::ModuleNotFound { .. } => 7,
        PanicReason::Corruption => 8,
        PanicReason::FiberNotResumable => 9,
        PanicReason::VerifierViolation { .. } => 10,
        PanicReason::UncaughtError { symbol_id } => *symbol_id,
    }
}

fn slot_addr(vm: &Vm, slot: StackSlot) -> usize {
    vm.frames().current().expect("frame stack must be non-empty while executing").start_local + slot.0 as usize
}

fn get(vm: &Vm, slot: StackSlot) -> Value {
    vm.stack()[slot_addr(vm, slot)]
}

fn set(vm: &mut Vm, slot: StackSlot, v: Value) {
    let i = slot_addr(vm, slot);
    vm.stack_mut()[i] = v;
}

fn to_f64(v: Value) -> Result<f64, PanicReason> {
    fallback::as_number(v).ok_or_else(|| PanicReason::TypeError { message: "expected a number".into() })
}

fn bin_numeric(
    vm: &mut Vm,
    a: Value,
    b: Value,
    fast: fn(f64, f64) -> f64,
    slow: fn(&mut Heap, Value, Value) -> Result<Value, PanicReason>,
) -> Result<Value, PanicReason> {
    if a.is_double() && b.is_double() {
        Ok(Value::float(fast(a.as_double(), b.as_double())))
    } else {
        slow(vm.heap_mut(), a, b)
    }
}

fn cmp_numeric(
    vm: &Vm,
    a: Value,
    b: Value,
    fast: fn(f64, f64) -> bool,
    slow: fn(&Heap, Value, Value) -> Result<bool, PanicReason>,
) -> Result<bool, PanicReason> {
    if a.is_double() && b.is_double() {
        Ok(fast(a.as_double(), b.as_double()))
    } else {
        slow(vm.heap(), a, b)
    }
}

fn display_value(heap: &Heap, v: Value) -> String {
    if v.is_double() {
        v.as_double().to_string()
    } else if v.is_integer() {
        v.as_integer().to_string()
    } else if v.is_bool() {
        v.as_bool().to_string()
    } else if v.is_none() {
        "none".to_string()
    } else if v.is_pointer() {
        match heap.get(v.as_pointer()) {
            HeapObject::Astring(s) | HeapObject::Ustring(s) => s.clone(),
            _ => String::new(),
        }
    } else {
        String::new()
    }
}

// --- Calls (C5 + C6) --------------------------------------------------

fn push_bytecode_frame(vm: &mut Vm, start_local: usize, req_ret: u8, caller_dst: usize, entry_pc: u32) -> Result<(), PanicReason> {
    // This port has no compiler to report a callee's real local count, so
    // it only guarantees the four bookkeeping-adjacent slots every frame
    // needs; see `DESIGN.md`.
    if frame::would_overflow(start_local, 4, vm.stack().len()) {
        return Err(PanicReason::StackOverflow);
    }
    let saved_start_local = vm.frames().current().map(|f| f.start_local).unwrap_or(0);
    let return_pc = vm.pc();
    vm.frames_mut().push(Frame { start_local, req_ret, flags: 0, return_pc, saved_start_local, caller_dst });
    vm.set_pc(entry_pc);
    Ok(())
}

/// Invoke a bound native function. `receiver`, when present, is a method
/// call's resolved object (§4.4) — passed as the host function's first
/// argument, ahead of the declared `args`, following the usual bound-method
/// convention (the spec leaves the exact native calling convention to the
/// out-of-scope host ABI; §6 only fixes the plain-function shape).
fn call_native(
    vm: &mut Vm,
    id: NativeFuncId,
    args_start: usize,
    n_args: u8,
    req_ret: u8,
    caller_dst: usize,
    receiver: Option<Value>,
) -> Result<(), PanicReason> {
    let mut args: Vec<Value> = Vec::with_capacity(n_args as usize + receiver.is_some() as usize);
    args.extend(receiver);
    args.extend_from_slice(&vm.stack()[args_start..args_start + n_args as usize]);
    let result =
        vm.call_host_func(id, &args).ok_or_else(|| PanicReason::HostFuncMissing { name: format!("native#{}", id.0) })?;
    if req_ret == 1 {
        vm.stack_mut()[caller_dst] = result;
    }
    Ok(())
}

fn resolve_value_callee(vm: &Vm, v: Value) -> Result<CallTarget, PanicReason> {
    if !v.is_pointer() {
        return Err(PanicReason::TypeError { message: "value is not callable".into() });
    }
    match vm.heap().get(v.as_pointer()) {
        HeapObject::Closure { target, .. } | HeapObject::Lambda { target, .. } => Ok(*target),
        HeapObject::NativeFunc { id, .. } => Ok(CallTarget::Native(*id)),
        _ => Err(PanicReason::TypeError { message: "value is not callable".into() }),
    }
}

fn do_value_call(vm: &mut Vm, callee: StackSlot, n_args: u8, req_ret: u8, dst: Option<StackSlot>) -> Result<(), PanicReason> {
    let start_local = slot_addr(vm, callee);
    let callee_val = vm.stack()[start_local];
    let target = resolve_value_callee(vm, callee_val)?;
    let caller_dst = match dst {
        Some(s) => slot_addr(vm, s),
        None => start_local,
    };
    match target {
        CallTarget::Bytecode(entry_pc) => push_bytecode_frame(vm, start_local, req_ret, caller_dst, entry_pc),
        CallTarget::Native(id) => call_native(vm, id, start_local + 4, n_args, req_ret, caller_dst, Option::None),
    }
}

/// Overwrite the bytes at `at` with `inst`'s encoding. Only ever called with
/// an `inst` padded to the same width as whatever currently occupies `at`
/// (`CallSym`/`CallFuncIC`/`CallNativeFuncIC` share one width, `CallObjSym`/
/// `CallObjFuncIC`/`CallObjNativeFuncIC` share another — see
/// `ember_asm::instruction`'s padding doc).
fn rewrite_call_ic(chunk: &mut Chunk, at: u32, inst: Instruction) {
    let mut buf = Vec::new();
    inst.encode(&mut buf);
    let at = at as usize;
    chunk.code[at..at + buf.len()].copy_from_slice(&buf);
}

fn call_obj_sym(vm: &mut Vm, chunk: &mut Chunk, instr_start: u32, start: StackSlot, n_args: u8, n_ret: u8, sym: SymId) -> Result<(), PanicReason> {
    let start_local = slot_addr(vm, start);
    let recv_idx = start_local + n_args as usize + 3;
    let recv = vm.stack()[recv_idx];
    let type_id = recv.type_id(vm.heap());
    let target = vm
        .symbols()
        .resolve_method(type_id, sym.0)
        .ok_or_else(|| PanicReason::NotFound { symbol: format!("method#{}", sym.0) })?;
    match target {
        CallTarget::Bytecode(entry_pc) => {
            rewrite_call_ic(
                chunk,
                instr_start,
                Instruction::CallObjFuncIC { start, n_args, n_ret, sym, cached_type: type_id.0, entry_pc },
            );
            push_bytecode_frame(vm, start_local, n_ret, start_local, entry_pc)
        }
        CallTarget::Native(id) => {
            rewrite_call_ic(
                chunk,
                instr_start,
                Instruction::CallObjNativeFuncIC { start, n_args, n_ret, sym, cached_type: type_id.0, native_id: id.0 },
            );
            call_native(vm, id, start_local + 3, n_args, n_ret, start_local, Some(recv))
        }
    }
}

fn do_return(vm: &mut Vm, value: Value) -> Step {
    let current = *vm.frames().current().expect("frame stack must be non-empty on return");
    vm.frames_mut().pop();
    if current.req_ret == 1 {
        let i = current.caller_dst;
        vm.stack_mut()[i] = value;
    } else {
        vm.release(value);
    }
    vm.set_pc(current.return_pc);
    if current.is_final_return() {
        if vm.in_fiber() {
            vm.co_switch_back(value, true);
            Step::Continue
        } else {
            Step::Halt(value)
        }
    } else {
        Step::Continue
    }
}

// --- Indexing (restored; no direct original-source or spec grounding for
// per-kind semantics beyond "recv[index]" — see `DESIGN.md`) -------------

enum Indexed {
    Existing(Value),
    NewAstring(String),
}

fn do_index(vm: &mut Vm, recv: Value, idx: Value) -> Result<Value, PanicReason> {
    if !recv.is_pointer() {
        return Err(PanicReason::TypeError { message: "value is not indexable".into() });
    }
    let r = recv.as_pointer();
    let indexed = match vm.heap().get(r) {
        HeapObject::List(items) => {
            let i = idx.as_integer();
            if i < 0 || i as usize >= items.len() {
                return Err(PanicReason::TypeError { message: "list index out of bounds".into() });
            }
            Indexed::Existing(items[i as usize])
        }
        HeapObject::Map(map) => {
            let v = map.get(idx).ok_or_else(|| PanicReason::TypeError { message: "key not found".into() })?;
            Indexed::Existing(v)
        }
        HeapObject::Astring(s) | HeapObject::Ustring(s) => {
            let i = idx.as_integer();
            let ch = if i >= 0 { s.chars().nth(i as usize) } else { None }
                .ok_or_else(|| PanicReason::TypeError { message: "string index out of bounds".into() })?;
            Indexed::NewAstring(ch.to_string())
        }
        _ => return Err(PanicReason::TypeError { message: "value is not indexable".into() }),
    };
    match indexed {
        Indexed::Existing(v) => {
            vm.retain(v);
            Ok(v)
        }
        Indexed::NewAstring(s) => Ok(Value::pointer(vm.heap_mut().alloc(TypeId::ASTRING, HeapObject::Astring(s)))),
    }
}

fn len_of(vm: &Vm, recv: Value) -> Result<i32, PanicReason> {
    if !recv.is_pointer() {
        return Err(PanicReason::TypeError { message: "value has no length".into() });
    }
    match vm.heap().get(recv.as_pointer()) {
        HeapObject::List(items) => Ok(items.len() as i32),
        HeapObject::Map(map) => Ok(map.len() as i32),
        HeapObject::Astring(s) | HeapObject::Ustring(s) => Ok(s.chars().count() as i32),
        _ => Err(PanicReason::TypeError { message: "value has no length".into() }),
    }
}

fn do_set_index(vm: &mut Vm, recv: Value, idx: Value, val: Value, release_old: bool) -> Result<(), PanicReason> {
    if !recv.is_pointer() {
        return Err(PanicReason::TypeError { message: "value does not support index assignment".into() });
    }
    let r = recv.as_pointer();
    let old = match vm.heap_mut().get_mut(r) {
        HeapObject::List(items) => {
            let i = idx.as_integer();
            if i < 0 || i as usize >= items.len() {
                return Err(PanicReason::TypeError { message: "list index out of bounds".into() });
            }
            Some(std::mem::replace(&mut items[i as usize], val))
        }
        HeapObject::Map(map) => map.insert(idx, val),
        _ => return Err(PanicReason::TypeError { message: "value does not support index assignment".into() }),
    };
    if release_old {
        if let Some(old) = old {
            vm.release(old);
        }
    }
    Ok(())
}

enum Sliced {
    List(Vec<Value>),
    Str(String),
}

fn do_slice(vm: &mut Vm, recv: Value, start: i32, end: i32) -> Result<Value, PanicReason> {
    if !recv.is_pointer() {
        return Err(PanicReason::TypeError { message: "value is not sliceable".into() });
    }
    let si = start.max(0) as usize;
    let sliced = match vm.heap().get(recv.as_pointer()) {
        HeapObject::List(items) => {
            let ei = (end.max(0) as usize).min(items.len());
            Sliced::List(if si < ei { items[si..ei].to_vec() } else { Vec::new() })
        }
        HeapObject::Astring(s) | HeapObject::Ustring(s) => {
            let ei = (end.max(0) as usize).min(s.chars().count());
            Sliced::Str(if si < ei { s.chars().skip(si).take(ei - si).collect() } else { String::new() })
        }
        _ => return Err(PanicReason::TypeError { message: "value is not sliceable".into() }),
    };
    let r = match sliced {
        Sliced::List(items) => {
            for v in &items {
                vm.retain(*v);
            }
            vm.heap_mut().alloc(TypeId::LIST, HeapObject::List(items))
        }
        Sliced::Str(s) => vm.heap_mut().alloc(TypeId::ASTRING, HeapObject::Astring(s)),
    };
    Ok(Value::pointer(r))
}

// --- Fields & boxes (restored) ------------------------------------------

fn read_field(vm: &Vm, recv: Value, offset: u8) -> Result<Value, PanicReason> {
    if !recv.is_pointer() {
        return Err(PanicReason::TypeError { message: "value has no fields".into() });
    }
    match vm.heap().get(recv.as_pointer()) {
        HeapObject::Instance { fields, .. } => {
            fields.get(offset as usize).copied().ok_or(PanicReason::TypeError { message: "field offset out of bounds".into() })
        }
        _ => Err(PanicReason::TypeError { message: "value has no fields".into() }),
    }
}

fn write_field_get_old(vm: &mut Vm, recv: Value, offset: u8, val: Value) -> Result<Value, PanicReason> {
    if !recv.is_pointer() {
        return Err(PanicReason::TypeError { message: "value has no fields".into() });
    }
    match vm.heap_mut().get_mut(recv.as_pointer()) {
        HeapObject::Instance { fields, .. } => {
            let slot = fields.get_mut(offset as usize).ok_or(PanicReason::TypeError { message: "field offset out of bounds".into() })?;
            Ok(std::mem::replace(slot, val))
        }
        _ => Err(PanicReason::TypeError { message: "value has no fields".into() }),
    }
}

fn read_box(vm: &Vm, b: Value) -> Result<Value, PanicReason> {
    if !b.is_pointer() {
        return Err(PanicReason::TypeError { message: "value is not a box".into() });
    }
    match vm.heap().get(b.as_pointer()) {
        HeapObject::Box(v) => Ok(*v),
        _ => Err(PanicReason::TypeError { message: "value is not a box".into() }),
    }
}

fn write_box_get_old(vm: &mut Vm, b: Value, val: Value) -> Result<Value, PanicReason> {
    if !b.is_pointer() {
        return Err(PanicReason::TypeError { message: "value is not a box".into() });
    }
    match vm.heap_mut().get_mut(b.as_pointer()) {
        HeapObject::Box(slot) => Ok(std::mem::replace(slot, val)),
        _ => Err(PanicReason::TypeError { message: "value is not a box".into() }),
    }
}

// --- The loop body -------------------------------------------------------

fn step(vm: &mut Vm, chunk: &mut Chunk, inst: Instruction, instr_start: u32) -> Result<Step, PanicReason> {
    use Instruction::*;

    match inst {
        ConstOp { c, dst } => {
            let v = chunk.consts[c.0 as usize];
            set(vm, dst, v);
        }
        ConstI8 { imm, dst } => set(vm, dst, Value::float(imm as f64)),
        ConstI8Int { imm, dst } => set(vm, dst, Value::integer(imm as i32)),
        True { dst } => set(vm, dst, Value::TRUE),
        False { dst } => set(vm, dst, Value::FALSE),
        None { dst } => set(vm, dst, Value::NONE),

        Copy { src, dst } => {
            let v = get(vm, src);
            set(vm, dst, v);
        }
        CopyReleaseDst { src, dst } => {
            let v = get(vm, src);
            let old = get(vm, dst);
            set(vm, dst, v);
            vm.release(old);
        }
        CopyRetainSrc { src, dst } => {
            let v = get(vm, src);
            vm.retain(v);
            set(vm, dst, v);
        }
        CopyRetainRelease { src, dst } => {
            let v = get(vm, src);
            vm.retain(v);
            let old = get(vm, dst);
            set(vm, dst, v);
            vm.release(old);
        }

        Add { a, b, dst } => {
            let (x, y) = (get(vm, a), get(vm, b));
            let v = bin_numeric(vm, x, y, |x, y| x + y, fallback::add)?;
            set(vm, dst, v);
        }
        Sub { a, b, dst } => {
            let (x, y) = (get(vm, a), get(vm, b));
            let v = bin_numeric(vm, x, y, |x, y| x - y, fallback::sub)?;
            set(vm, dst, v);
        }
        Mul { a, b, dst } => {
            let (x, y) = (get(vm, a), get(vm, b));
            let v = bin_numeric(vm, x, y, |x, y| x * y, fallback::mul)?;
            set(vm, dst, v);
        }
        Div { a, b, dst } => {
            let (x, y) = (get(vm, a), get(vm, b));
            let v = bin_numeric(vm, x, y, |x, y| x / y, fallback::div)?;
            set(vm, dst, v);
        }
        Mod { a, b, dst } => {
            let v = fallback::rem(vm.heap_mut(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }
        Pow { a, b, dst } => {
            let v = fallback::pow(vm.heap_mut(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }
        Neg { a, dst } => {
            let v = fallback::neg(vm.heap_mut(), get(vm, a))?;
            set(vm, dst, v);
        }
        AddInt { a, b, dst } => {
            let v = Value::integer(get(vm, a).as_integer().wrapping_add(get(vm, b).as_integer()));
            set(vm, dst, v);
        }
        SubInt { a, b, dst } => {
            let v = Value::integer(get(vm, a).as_integer().wrapping_sub(get(vm, b).as_integer()));
            set(vm, dst, v);
        }
        LessInt { a, b, dst } => {
            let v = Value::boolean(get(vm, a).as_integer() < get(vm, b).as_integer());
            set(vm, dst, v);
        }

        Compare { a, b, dst } => {
            let eq = fallback::value_equal(vm.heap(), get(vm, a), get(vm, b));
            set(vm, dst, Value::boolean(eq));
        }
        CompareNot { a, b, dst } => {
            let eq = fallback::value_equal(vm.heap(), get(vm, a), get(vm, b));
            set(vm, dst, Value::boolean(!eq));
        }
        Less { a, b, dst } => {
            let r = cmp_numeric(vm, get(vm, a), get(vm, b), |x, y| x < y, fallback::less)?;
            set(vm, dst, Value::boolean(r));
        }
        Greater { a, b, dst } => {
            let r = cmp_numeric(vm, get(vm, a), get(vm, b), |x, y| x > y, fallback::greater)?;
            set(vm, dst, Value::boolean(r));
        }
        LessEqual { a, b, dst } => {
            let r = cmp_numeric(vm, get(vm, a), get(vm, b), |x, y| x <= y, fallback::less_equal)?;
            set(vm, dst, Value::boolean(r));
        }
        GreaterEqual { a, b, dst } => {
            let r = cmp_numeric(vm, get(vm, a), get(vm, b), |x, y| x >= y, fallback::greater_equal)?;
            set(vm, dst, Value::boolean(r));
        }

        Jump { offset } => vm.set_pc((instr_start as i64 + offset.0 as i64) as u32),
        JumpCond { src, offset } => {
            if get(vm, src).truthy() {
                vm.set_pc((instr_start as i64 + offset.0 as i64) as u32);
            }
        }
        JumpNotCond { src, offset } => {
            if !get(vm, src).truthy() {
                vm.set_pc((instr_start as i64 + offset.0 as i64) as u32);
            }
        }
        JumpNotNone { src, offset } => {
            if !get(vm, src).is_none() {
                vm.set_pc((instr_start as i64 + offset.0 as i64) as u32);
            }
        }
        ForRangeInit { start, end, step: step_slot, counter, user_var, body_offset } => {
            let s = to_f64(get(vm, start))?;
            let e = to_f64(get(vm, end))?;
            let st = to_f64(get(vm, step_slot))?.abs();
            if st == 0.0 {
                return Err(PanicReason::VerifierViolation { detail: "ForRangeInit step must be nonzero".into() });
            }
            set(vm, end, Value::float(e));
            set(vm, step_slot, Value::float(st));
            if s == e {
                vm.set_pc((instr_start as i64 + body_offset.0 as i64) as u32);
            } else {
                set(vm, counter, Value::float(s));
                set(vm, user_var, Value::float(s));
                let body_pc = (instr_start as i64 + body_offset.0 as i64) as usize;
                chunk.code[body_pc] = if s < e { OpCode::ForRange } else { OpCode::ForRangeReverse } as u8;
            }
        }
        ForRange { counter, step: step_slot, end, user_var, back_offset } => {
            let c = get(vm, counter).as_double() + get(vm, step_slot).as_double();
            if c < get(vm, end).as_double() {
                set(vm, counter, Value::float(c));
                set(vm, user_var, Value::float(c));
                vm.set_pc((instr_start as i64 + back_offset.0 as i64) as u32);
            }
        }
        ForRangeReverse { counter, step: step_slot, end, user_var, back_offset } => {
            let c = get(vm, counter).as_double() - get(vm, step_slot).as_double();
            if c > get(vm, end).as_double() {
                set(vm, counter, Value::float(c));
                set(vm, user_var, Value::float(c));
                vm.set_pc((instr_start as i64 + back_offset.0 as i64) as u32);
            }
        }
        Match { src, n_cases, table_offset } => {
            let v = get(vm, src);
            let table_base = (instr_start as usize) + instruction_fixed_len(&inst);
            let chosen = if v.is_integer() && v.as_integer() >= 0 && (v.as_integer() as usize) < n_cases as usize {
                let at = table_base + (v.as_integer() as usize) * 2;
                i16::from_le_bytes([chunk.code[at], chunk.code[at + 1]])
            } else {
                table_offset.0
            };
            vm.set_pc((instr_start as i64 + chosen as i64) as u32);
        }
        End => return Ok(Step::Halt(vm.stack()[0])),

        List { start, n, dst } => {
            let s = slot_addr(vm, start);
            let items: Vec<Value> = vm.stack()[s..s + n as usize].to_vec();
            let r = vm.heap_mut().alloc(TypeId::LIST, HeapObject::List(items));
            set(vm, dst, Value::pointer(r));
        }
        Map { start, n, dst } => {
            let s = slot_addr(vm, start);
            let mut map = IndexMap::new();
            for i in 0..n as usize {
                let k = vm.stack()[s + i * 2];
                let v = vm.stack()[s + i * 2 + 1];
                map.insert(k, v);
            }
            let r = vm.heap_mut().alloc(TypeId::MAP, HeapObject::Map(map));
            set(vm, dst, Value::pointer(r));
        }
        MapEmpty { dst } => {
            let r = vm.heap_mut().alloc(TypeId::MAP, HeapObject::Map(IndexMap::new()));
            set(vm, dst, Value::pointer(r));
        }
        ObjectSmall { type_id, start, n, dst } | Object { type_id, start, n, dst } => {
            let s = slot_addr(vm, start);
            let fields: Vec<Value> = vm.stack()[s..s + n as usize].to_vec();
            let tid = TypeId(type_id.0 as u32);
            let r = vm.heap_mut().alloc(tid, HeapObject::Instance { type_id: tid, fields });
            set(vm, dst, Value::pointer(r));
        }
        Closure { const_idx, box_start, n_boxes, dst } => {
            let tmpl = chunk.consts[const_idx.0 as usize];
            if !tmpl.is_pointer() {
                return Err(PanicReason::TypeError { message: "closure template is not callable".into() });
            }
            let (target, arity) = match vm.heap().get(tmpl.as_pointer()) {
                HeapObject::Lambda { target, arity } | HeapObject::Closure { target, arity, .. } => (*target, *arity),
                _ => return Err(PanicReason::TypeError { message: "closure template is not callable".into() }),
            };
            let s = slot_addr(vm, box_start);
            let boxes: Vec<Value> = vm.stack()[s..s + n_boxes as usize].to_vec();
            let r = vm.heap_mut().alloc(TypeId::CLOSURE, HeapObject::Closure { target, arity, boxes });
            set(vm, dst, Value::pointer(r));
        }
        Lambda { const_idx, dst } => {
            let tmpl = chunk.consts[const_idx.0 as usize];
            vm.retain(tmpl);
            set(vm, dst, tmpl);
        }
        Box { src, dst } => {
            let v = get(vm, src);
            let r = vm.heap_mut().alloc(TypeId::BOX, HeapObject::Box(v));
            set(vm, dst, Value::pointer(r));
        }
        StringTemplate { start, n, dst } => {
            let s = slot_addr(vm, start);
            let mut out = String::new();
            for i in 0..n as usize {
                let v = vm.stack()[s + i];
                out.push_str(&display_value(vm.heap(), v));
            }
            let r = vm.heap_mut().alloc(TypeId::ASTRING, HeapObject::Astring(out));
            set(vm, dst, Value::pointer(r));
        }
        SetInitN { start, n } => {
            let s = slot_addr(vm, start);
            for i in 0..n as usize {
                vm.stack_mut()[s + i] = Value::NONE;
            }
        }

        Index { recv, index, dst } => {
            let (r, i) = (get(vm, recv), get(vm, index));
            let v = do_index(vm, r, i)?;
            set(vm, dst, v);
        }
        ReverseIndex { recv, index, dst } => {
            let (r, i) = (get(vm, recv), get(vm, index));
            let len = len_of(vm, r)?;
            let real_idx = Value::integer(len - i.as_integer());
            let v = do_index(vm, r, real_idx)?;
            set(vm, dst, v);
        }
        SetIndex { recv, index, val } => {
            let (r, i, v) = (get(vm, recv), get(vm, index), get(vm, val));
            do_set_index(vm, r, i, v, false)?;
        }
        SetIndexRelease { recv, index, val } => {
            let (r, i, v) = (get(vm, recv), get(vm, index), get(vm, val));
            do_set_index(vm, r, i, v, true)?;
        }
        Slice { recv, start, end, dst } => {
            let r = get(vm, recv);
            let (s, e) = (get(vm, start).as_integer(), get(vm, end).as_integer());
            let v = do_slice(vm, r, s, e)?;
            set(vm, dst, v);
        }

        Field { recv, offset, dst } | FieldIC { recv, offset, dst, .. } => {
            let v = read_field(vm, get(vm, recv), offset)?;
            set(vm, dst, v);
        }
        FieldRetain { recv, offset, dst } | FieldRetainIC { recv, offset, dst, .. } => {
            let v = read_field(vm, get(vm, recv), offset)?;
            vm.retain(v);
            set(vm, dst, v);
        }
        FieldRelease { recv, offset, dst } => {
            let rv = get(vm, recv);
            let v = read_field(vm, rv, offset)?;
            set(vm, dst, v);
            vm.release(rv);
        }
        SetField { recv, offset, val } => {
            let (rv, v) = (get(vm, recv), get(vm, val));
            write_field_get_old(vm, rv, offset, v)?;
        }
        SetFieldRelease { recv, offset, val } | SetFieldReleaseIC { recv, offset, val, .. } => {
            let (rv, v) = (get(vm, recv), get(vm, val));
            let old = write_field_get_old(vm, rv, offset, v)?;
            vm.release(old);
        }

        Call0 { callee, n_args } => do_value_call(vm, callee, n_args, 0, Option::None)?,
        Call1 { callee, n_args, dst } => do_value_call(vm, callee, n_args, 1, Some(dst))?,
        CallSym { start, n_args, n_ret, sym } => {
            let start_local = slot_addr(vm, start);
            let caller_dst = start_local;
            let fsym = *vm.symbols().func(sym.0).ok_or_else(|| PanicReason::NotFound { symbol: format!("func#{}", sym.0) })?;
            match fsym.target {
                CallTarget::Bytecode(entry_pc) => {
                    rewrite_call_ic(chunk, instr_start, Instruction::CallFuncIC { start, n_args, n_ret, entry_pc });
                    push_bytecode_frame(vm, start_local, n_ret, caller_dst, entry_pc)?;
                }
                CallTarget::Native(id) => {
                    rewrite_call_ic(chunk, instr_start, Instruction::CallNativeFuncIC { start, n_args, n_ret, native_id: id.0 });
                    call_native(vm, id, start_local + 4, n_args, n_ret, caller_dst, Option::None)?;
                }
            }
        }
        CallFuncIC { start, n_args: _, n_ret, entry_pc } => {
            let start_local = slot_addr(vm, start);
            push_bytecode_frame(vm, start_local, n_ret, start_local, entry_pc)?;
        }
        CallNativeFuncIC { start, n_args, n_ret, native_id } => {
            let start_local = slot_addr(vm, start);
            call_native(vm, NativeFuncId(native_id), start_local + 4, n_args, n_ret, start_local, Option::None)?;
        }
        CallObjSym { start, n_args, n_ret, sym } => call_obj_sym(vm, chunk, instr_start, start, n_args, n_ret, sym)?,
        CallObjFuncIC { start, n_args, n_ret, sym, cached_type, entry_pc } => {
            let start_local = slot_addr(vm, start);
            let recv_idx = start_local + n_args as usize + 3;
            let recv = vm.stack()[recv_idx];
            if recv.type_id(vm.heap()).0 == cached_type {
                push_bytecode_frame(vm, start_local, n_ret, start_local, entry_pc)?;
            } else {
                rewrite_call_ic(chunk, instr_start, Instruction::CallObjSym { start, n_args, n_ret, sym });
                call_obj_sym(vm, chunk, instr_start, start, n_args, n_ret, sym)?;
            }
        }
        CallObjNativeFuncIC { start, n_args, n_ret, sym, cached_type, native_id } => {
            let start_local = slot_addr(vm, start);
            let recv_idx = start_local + n_args as usize + 3;
            let recv = vm.stack()[recv_idx];
            if recv.type_id(vm.heap()).0 == cached_type {
                call_native(vm, NativeFuncId(native_id), start_local + 3, n_args, n_ret, start_local, Some(recv))?;
            } else {
                rewrite_call_ic(chunk, instr_start, Instruction::CallObjSym { start, n_args, n_ret, sym });
                call_obj_sym(vm, chunk, instr_start, start, n_args, n_ret, sym)?;
            }
        }
        Ret0 => return Ok(do_return(vm, Value::NONE)),
        Ret1 => {
            let frame = *vm.frames().current().expect("frame stack must be non-empty on Ret1");
            let value = vm.stack()[frame.start_local];
            return Ok(do_return(vm, value));
        }

        Coinit { arg_start, n_args, init_pc, dst } => {
            let s = slot_addr(vm, arg_start);
            let args: Vec<Value> = vm.stack()[s..s + n_args as usize].to_vec();
            let r = vm.coinit(&args, init_pc);
            set(vm, dst, Value::pointer(r));
        }
        Coyield => vm.co_switch_back(Value::NONE, false),
        Coresume { fiber, dst } => {
            let target = get(vm, fiber);
            if !target.is_pointer() {
                return Err(PanicReason::TypeError { message: "coresume target is not a fiber".into() });
            }
            let dst_addr = slot_addr(vm, dst);
            vm.coresume(target.as_pointer(), dst_addr)?;
        }
        Coreturn => {
            let v = vm.stack()[vm.frames().current().expect("frame stack must be non-empty").start_local];
            vm.co_switch_back(v, true);
        }

        Retain { r } => {
            let v = get(vm, r);
            vm.retain(v);
        }
        Release { r } => {
            let v = get(vm, r);
            vm.release(v);
        }
        ReleaseN { start, n } => {
            let s = slot_addr(vm, start);
            for i in 0..n as usize {
                let v = vm.stack()[s + i];
                vm.release(v);
            }
        }

        BoxValue { b, dst } => {
            let v = read_box(vm, get(vm, b))?;
            set(vm, dst, v);
        }
        BoxValueRetain { b, dst } => {
            let v = read_box(vm, get(vm, b))?;
            vm.retain(v);
            set(vm, dst, v);
        }
        SetBoxValue { b, val } => {
            let (bv, v) = (get(vm, b), get(vm, val));
            write_box_get_old(vm, bv, v)?;
        }
        SetBoxValueRelease { b, val } => {
            let (bv, v) = (get(vm, b), get(vm, val));
            let old = write_box_get_old(vm, bv, v)?;
            vm.release(old);
        }

        BitwiseAnd { a, b, dst } => {
            let v = fallback::bitwise_and(vm.heap(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }
        BitwiseOr { a, b, dst } => {
            let v = fallback::bitwise_or(vm.heap(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }
        BitwiseXor { a, b, dst } => {
            let v = fallback::bitwise_xor(vm.heap(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }
        BitwiseNot { a, dst } => {
            let v = fallback::bitwise_not(vm.heap(), get(vm, a))?;
            set(vm, dst, v);
        }
        BitwiseLeftShift { a, b, dst } => {
            let v = fallback::bitwise_left_shift(vm.heap(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }
        BitwiseRightShift { a, b, dst } => {
            let v = fallback::bitwise_right_shift(vm.heap(), get(vm, a), get(vm, b))?;
            set(vm, dst, v);
        }

        // A bare numeric id, not a constant-pool index — see `DESIGN.md`.
        Tag { tag_id, dst } => set(vm, dst, Value::tag_literal(tag_id.0 as u32)),
        TagLiteral { const_idx, dst } => set(vm, dst, Value::tag_literal(const_idx.0 as u32)),
        Sym { const_idx, dst } => set(vm, dst, Value::symbol(const_idx.0 as u32)),

        StaticFunc { slot, dst } | StaticVar { slot, dst } => {
            let v = vm.static_slot(slot);
            set(vm, dst, v);
        }
        SetStaticVar { slot, val } | SetStaticFunc { slot, val } => {
            let v = get(vm, val);
            vm.set_static_slot(slot, v);
        }

        // Handled out-of-band by `recover_try_value` when it lands right
        // after a panicking instruction; reached directly here only if
        // control flow fell through to one with no preceding panic, in
        // which case there's nothing to report.
        TryValue { dst } => set(vm, dst, Value::NONE),
    }
    Ok(Step::Continue)
}

/// Byte length of `Match`'s own fixed fields (src + n_cases + table_offset),
/// i.e. where its jump table begins. `Instruction::decode` already computed
/// this as part of decoding, but `step` only receives the decoded value, not
/// the length — this recomputes it the same way `encode` lays the fields out.
fn instruction_fixed_len(inst: &Instruction) -> usize {
    match inst {
        Instruction::Match { .. } => 1 /* tag */ + 1 /* src */ + 1 /* n_cases */ + 2 /* table_offset */,
        other => {
            let mut buf = Vec::new();
            other.encode(&mut buf);
            buf.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_asm::{Assembler, ConstIdx, Offset};

    fn native_strlen(vm: &mut Vm, args: &[Value]) -> Value {
        match vm.heap().get(args[0].as_pointer()) {
            HeapObject::Astring(s) => Value::integer(s.len() as i32),
            _ => Value::NONE,
        }
    }

    /// Re-run `chunk` from a clean stack/frame state without consuming it,
    /// so the test can inspect `chunk.code` between runs — `Vm::eval_chunk`
    /// takes its chunk by value and can't be used for that.
    fn run_fresh(vm: &mut Vm, chunk: &mut Chunk) -> Value {
        vm.stack_mut().iter_mut().for_each(|slot| *slot = Value::NONE);
        vm.set_pc(0);
        *vm.frames_mut() = frame::Frames::new();
        vm.frames_mut().push(Frame {
            start_local: 0,
            req_ret: 1,
            flags: frame::FINAL_RETURN_FLAG,
            return_pc: 0,
            saved_start_local: 0,
            caller_dst: 0,
        });
        run(vm, chunk).unwrap()
    }

    #[test]
    fn call_obj_sym_installs_native_ic_on_first_hit_and_keeps_answering_right() {
        let mut vm = Vm::create();
        let native_id = NativeFuncId(7);
        vm.register_host_func(native_id, native_strlen);
        let sym = SymId(0);
        vm.symbols_mut().declare_method(TypeId::ASTRING, sym.0, CallTarget::Native(native_id));

        let hello = vm.heap_mut().alloc(TypeId::ASTRING, HeapObject::Astring("hello".to_string()));
        vm.retain(Value::pointer(hello));

        let mut asm = Assembler::new();
        asm.emit(Instruction::ConstOp { c: ConstIdx(0), dst: StackSlot(3) });
        let call_site_pc = asm.offset();
        asm.emit(Instruction::CallObjSym { start: StackSlot(0), n_args: 0, n_ret: 1, sym });
        asm.end();
        let mut chunk = Chunk::new(asm.finish(), vec![Value::pointer(hello)], vec![]);

        assert_eq!(OpCode::try_from(chunk.code[call_site_pc]).unwrap(), OpCode::CallObjSym);

        let first = run_fresh(&mut vm, &mut chunk);
        assert_eq!(first.as_integer(), 5);
        assert_eq!(OpCode::try_from(chunk.code[call_site_pc]).unwrap(), OpCode::CallObjNativeFuncIC);

        let second = run_fresh(&mut vm, &mut chunk);
        assert_eq!(second.as_integer(), 5);
        assert_eq!(OpCode::try_from(chunk.code[call_site_pc]).unwrap(), OpCode::CallObjNativeFuncIC);

        vm.release(Value::pointer(hello));
    }

    /// `Match`'s jump table sits immediately after its own encoded bytes
    /// (tag + src + n_cases + table_offset = 5 bytes), not after just its
    /// operands — `instruction_fixed_len` must include the tag byte or
    /// `table_base` lands one byte into the table itself, so a selected
    /// case reads a byte-shifted (garbage) offset instead of its own entry.
    #[test]
    fn match_selects_the_case_named_by_its_own_table_entry() {
        let mut code = Vec::new();
        let match_at = code.len();
        Instruction::Match { src: StackSlot(1), n_cases: 2, table_offset: Offset(0) }.encode(&mut code);
        assert_eq!(code.len() - match_at, 5, "Match must encode to tag + src + n_cases + table_offset");

        // Jump table: two i16 entries, relative to `match_at`, immediately
        // following the 5 encoded bytes above.
        let table_at = code.len();
        assert_eq!(table_at, match_at + 5);
        let case0_entry_at = table_at;
        let case1_entry_at = table_at + 2;
        code.extend_from_slice(&0i16.to_le_bytes()); // case 0: patched below
        code.extend_from_slice(&0i16.to_le_bytes()); // case 1: patched below

        let case0_body_at = code.len();
        Instruction::ConstI8Int { imm: 42, dst: StackSlot(0) }.encode(&mut code);
        Instruction::End.encode(&mut code);

        let case1_body_at = code.len();
        Instruction::ConstI8Int { imm: 99, dst: StackSlot(0) }.encode(&mut code);
        Instruction::End.encode(&mut code);

        let case0_offset = (case0_body_at as i64 - match_at as i64) as i16;
        let case1_offset = (case1_body_at as i64 - match_at as i64) as i16;
        code[case0_entry_at..case0_entry_at + 2].copy_from_slice(&case0_offset.to_le_bytes());
        code[case1_entry_at..case1_entry_at + 2].copy_from_slice(&case1_offset.to_le_bytes());

        let mut vm = Vm::create();
        let mut chunk = Chunk::new(code, vec![], vec![]);
        vm.stack_mut().iter_mut().for_each(|slot| *slot = Value::NONE);
        vm.stack_mut()[1] = Value::integer(1); // select case 1
        vm.set_pc(0);
        *vm.frames_mut() = frame::Frames::new();
        vm.frames_mut().push(Frame {
            start_local: 0,
            req_ret: 1,
            flags: frame::FINAL_RETURN_FLAG,
            return_pc: 0,
            saved_start_local: 0,
            caller_dst: 0,
        });
        let result = run(&mut vm, &mut chunk).unwrap();
        assert_eq!(result.as_integer(), 99, "src == 1 must select the case-1 table entry, not a shifted read");
    }
}
