//! The embedding surface (§6): `Vm` owns the heap, stack, frames, symbol
//! tables, and fiber scheduler, and is the single entry point a host drives.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::config::VmConfig;
use crate::dispatch;
use crate::error::{PanicReport, ResultCode, VmError};
use crate::fiber::{FiberState, FiberStatus};
use crate::frame::{Frame, Frames, FINAL_RETURN_FLAG};
use crate::heap::{Heap, HeapObject, NativeFuncId, TypeId};
use crate::module::{Compiler, HostFuncLoader, HostTypeLoader, ModuleLoader, ModuleResolver};
use crate::symbols::SymbolTable;
use crate::value::{HeapRef, Value};

/// A saved dispatch-loop context: the active stack, program counter, and
/// call-frame stack, snapshotted across a fiber switch.
struct Context {
    stack: Vec<Value>,
    pc: u32,
    frames: Vec<Frame>,
    /// See `FiberState::resume_dst`; the root context needs the same
    /// bookkeeping when it is the one suspended by a `Coresume`.
    dst: usize,
}

/// The bytecode execution engine. One `Vm` instance owns a private heap and
/// is not `Sync` — multiple scripts run on separate `Vm`s, possibly on
/// separate threads, sharing nothing (§5).
pub struct Vm {
    config: VmConfig,
    heap: Heap,
    symbols: SymbolTable,
    statics: Vec<Value>,
    stack: Vec<Value>,
    frames: Frames,
    pc: u32,
    chunk: Option<Chunk>,
    /// `None` while the root context is running; `Some(r)` while a fiber is.
    current_fiber: Option<HeapRef>,
    /// Snapshot of the root context, populated whenever the root resumes a
    /// fiber and consulted again when control returns to it.
    root_saved: Option<Context>,
    host_funcs: HashMap<NativeFuncId, fn(&mut Vm, &[Value]) -> Value>,
    module_resolver: Option<Box<dyn ModuleResolver>>,
    module_loader: Option<Box<dyn ModuleLoader>>,
    print_fn: Box<dyn FnMut(&str)>,
    last_panic: Option<PanicReport>,
}

impl Vm {
    /// Create a VM with default limits.
    pub fn create() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// Create a VM with explicit limits (§7's ambient `VmConfig`).
    pub fn with_config(config: VmConfig) -> Self {
        let stack = vec![Value::NONE; config.stack_size];
        let statics = vec![Value::NONE; config.initial_static_slots];
        Self {
            config,
            heap: Heap::new(),
            symbols: SymbolTable::new(),
            statics,
            stack,
            frames: Frames::new(),
            pc: 0,
            chunk: None,
            current_fiber: None,
            root_saved: None,
            host_funcs: HashMap::new(),
            module_resolver: None,
            module_loader: None,
            print_fn: Box::new(|s| print!("{s}")),
            last_panic: None,
        }
    }

    /// Release every static slot and drop the heap. Mirrors `csDestroy`;
    /// after this call [`Vm::global_rc`] must read zero for a leak-free
    /// program (P2).
    pub fn deinit(&mut self) {
        for i in 0..self.statics.len() {
            let v = self.statics[i];
            self.statics[i] = Value::NONE;
            self.heap.release(v);
        }
        self.chunk = None;
    }

    /// Current global reference count across every live heap object.
    pub fn global_rc(&self) -> i64 {
        self.heap.global_rc()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// `retain(v)`, forwarded to the heap (§6 memory surface).
    pub fn retain(&mut self, v: Value) {
        self.heap.retain(v);
    }

    /// `release(v)`, forwarded to the heap.
    pub fn release(&mut self, v: Value) {
        self.heap.release(v);
    }

    /// Host-initiated trial-deletion cycle collection (C4). There is no
    /// automatic trigger (§4.3).
    #[tracing::instrument(skip(self))]
    pub fn perform_gc(&mut self) -> crate::gc::GcStats {
        let stats = crate::gc::collect_cycles(&mut self.heap);
        tracing::debug!(num_cyc_freed = stats.num_cyc_freed, num_obj_freed = stats.num_obj_freed, "performed gc");
        stats
    }

    /// Replace the built-in `print` sink (§6).
    pub fn set_print(&mut self, f: impl FnMut(&str) + 'static) {
        self.print_fn = Box::new(f);
    }

    pub(crate) fn print(&mut self, s: &str) {
        (self.print_fn)(s);
    }

    /// Bind a resolved native function id to its Rust implementation, as
    /// would be returned by a [`HostFuncLoader`].
    pub fn register_host_func(&mut self, id: NativeFuncId, f: fn(&mut Vm, &[Value]) -> Value) {
        self.host_funcs.insert(id, f);
    }

    pub(crate) fn call_host_func(&mut self, id: NativeFuncId, args: &[Value]) -> Option<Value> {
        let f = *self.host_funcs.get(&id)?;
        Some(f(self, args))
    }

    /// Install the module resolver the compiler will consult (§6's external
    /// module system; this crate does not call it itself since compilation
    /// is out of scope, but a host-provided [`Compiler`] may).
    pub fn set_module_resolver(&mut self, resolver: impl ModuleResolver + 'static) {
        self.module_resolver = Some(Box::new(resolver));
    }

    pub fn set_module_loader(&mut self, loader: impl ModuleLoader + 'static) {
        self.module_loader = Some(Box::new(loader));
    }

    pub fn module_resolver_mut(&mut self) -> Option<&mut (dyn ModuleResolver + 'static)> {
        self.module_resolver.as_deref_mut()
    }

    pub fn module_loader_mut(&mut self) -> Option<&mut (dyn ModuleLoader + 'static)> {
        self.module_loader.as_deref_mut()
    }

    /// Resolve a declared `@host func` via `loader`, registering the
    /// returned binding for the dispatch loop's `CallNativeFuncIC`/
    /// `CallObjNativeFuncIC` handlers.
    pub fn load_host_func(
        &mut self,
        loader: &mut dyn HostFuncLoader,
        info: &crate::module::HostFuncInfo,
        implementation: fn(&mut Vm, &[Value]) -> Value,
    ) -> Option<crate::module::HostFuncBinding> {
        let binding = loader.load_func(self, info)?;
        self.register_host_func(binding.id, implementation);
        Some(binding)
    }

    /// Resolve a declared `@host type` via `loader` (§6). The returned
    /// binding's finalizer, if any, is the host's responsibility to invoke;
    /// this crate only stores the contract, per §1's out-of-scope boundary.
    pub fn load_host_type(
        &mut self,
        loader: &mut dyn HostTypeLoader,
        info: &crate::module::HostTypeInfo,
    ) -> Option<crate::module::HostTypeBinding> {
        loader.load_type(self, info)
    }

    /// Static variable/function slot access (§4.5 `StaticVar`/`StaticFunc`
    /// opcodes read/write these; exposed here for host-side initialization
    /// before the first `eval`).
    pub fn static_slot(&self, slot: u16) -> Value {
        self.statics[slot as usize]
    }

    pub fn set_static_slot(&mut self, slot: u16, v: Value) {
        if slot as usize >= self.statics.len() {
            self.statics.resize(slot as usize + 1, Value::NONE);
        }
        self.statics[slot as usize] = v;
    }

    /// The last panic report recorded by `eval`/`eval_chunk`, formatted for
    /// a human (§7's user-visible error report).
    pub fn alloc_last_error_report(&self) -> String {
        match &self.last_panic {
            Some(report) => {
                let line = self.chunk.as_ref().and_then(|c| c.line_for_pc(report.pc));
                match line {
                    Some(line) => format!("{} (line {})", report.reason, line),
                    None => report.to_string(),
                }
            }
            None => String::new(),
        }
    }

    /// Compile `src` with `compiler` and run the result to completion.
    /// Compilation failures are out of this crate's scope to recover from
    /// beyond forwarding the reported message (§7).
    pub fn eval<C: Compiler>(&mut self, compiler: &mut C, src: &str) -> Result<Value, VmError> {
        let chunk = compiler.compile(src).map_err(|e| VmError::Compile(e.to_string()))?;
        self.eval_chunk(chunk)
    }

    /// Compile `src` without running it, reporting only the result code
    /// (§6's `validate`).
    pub fn validate<C: Compiler>(&mut self, compiler: &mut C, src: &str) -> ResultCode {
        match compiler.compile(src) {
            Ok(_) => ResultCode::Success,
            Err(_) => ResultCode::Compile,
        }
    }

    /// Run an already-compiled [`Chunk`] from `pc = 0` in a fresh entry
    /// frame. This is the engine's true entry point; `eval` is a thin
    /// wrapper that adds compilation ahead of it, and this crate's own
    /// tests call it directly with `ember_asm::Assembler`-built chunks.
    #[tracing::instrument(skip(self, chunk))]
    pub fn eval_chunk(&mut self, mut chunk: Chunk) -> Result<Value, VmError> {
        self.stack = vec![Value::NONE; self.config.stack_size];
        self.pc = 0;
        self.frames = Frames::new();
        self.frames.push(Frame {
            start_local: 0,
            req_ret: 1,
            flags: FINAL_RETURN_FLAG,
            return_pc: 0,
            saved_start_local: 0,
            caller_dst: 0,
        });
        let result = dispatch::run(self, &mut chunk);
        self.chunk = Some(chunk);
        match result {
            Ok(v) => {
                self.last_panic = None;
                Ok(v)
            }
            Err(reason) => {
                let report = PanicReport { reason, pc: self.pc };
                self.last_panic = Some(report.clone());
                Err(VmError::Panic(report))
            }
        }
    }

    pub(crate) fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut [Value] {
        &mut self.stack
    }

    pub(crate) fn frames_mut(&mut self) -> &mut Frames {
        &mut self.frames
    }

    pub(crate) fn frames(&self) -> &Frames {
        &self.frames
    }

    pub(crate) fn pc(&self) -> u32 {
        self.pc
    }

    pub(crate) fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub(crate) fn statics_mut(&mut self) -> &mut Vec<Value> {
        &mut self.statics
    }

    /// `Coinit`: allocate a new, not-yet-running fiber snapshotting `args`.
    pub(crate) fn coinit(&mut self, args: &[Value], init_pc: u32) -> HeapRef {
        let state = FiberState::new(args, init_pc, self.config.stack_size);
        self.heap.alloc(TypeId::FIBER, HeapObject::Fiber(Box::new(state)))
    }

    /// `true` while a fiber (rather than the root context) is executing.
    pub(crate) fn in_fiber(&self) -> bool {
        self.current_fiber.is_some()
    }

    /// `Coresume`: switch the active dispatch context to `target`, saving
    /// whatever is currently running as `target`'s resume point (§5, C9).
    /// `dst` is the absolute stack index, in the *resumer's* stack, that
    /// `target`'s eventual yield/return result should land at.
    pub(crate) fn coresume(&mut self, target: HeapRef, dst: usize) -> Result<(), crate::error::PanicReason> {
        let status = match self.heap.get(target) {
            HeapObject::Fiber(state) => state.status,
            _ => return Err(crate::error::PanicReason::TypeError { message: "coresume target is not a fiber".into() }),
        };
        if status != FiberStatus::Init && status != FiberStatus::Suspended {
            return Err(crate::error::PanicReason::FiberNotResumable);
        }

        let resumer = self.current_fiber;
        self.save_active(resumer, dst);

        let (stack, pc, frames) = match self.heap.get_mut(target) {
            HeapObject::Fiber(state) => {
                state.status = FiberStatus::Running;
                state.parent = resumer;
                (std::mem::take(&mut state.stack), state.pc, std::mem::take(&mut state.frames))
            }
            _ => unreachable!("checked above"),
        };
        self.stack = stack;
        self.pc = pc;
        self.frames = Frames::from_raw(frames);
        self.current_fiber = Some(target);
        Ok(())
    }

    /// `Coyield`/`Coreturn`: suspend (or finish) the running fiber and
    /// switch back to whoever resumed it, depositing `result` at the dst
    /// recorded by that resumer's `Coresume`. `done` marks the fiber `Done`
    /// instead of `Suspended` (`Coreturn`'s behavior).
    pub(crate) fn co_switch_back(&mut self, result: Value, done: bool) {
        let Some(cur) = self.current_fiber else {
            // Yielding/returning with no active fiber (the root itself) is a
            // no-op: the root never suspends.
            return;
        };
        let parent = match self.heap.get_mut(cur) {
            HeapObject::Fiber(state) => {
                state.status = if done { FiberStatus::Done } else { FiberStatus::Suspended };
                state.result = result;
                state.stack = std::mem::take(&mut self.stack);
                state.pc = self.pc;
                state.frames = self.frames.take_raw();
                state.parent
            }
            _ => unreachable!("current_fiber always names a Fiber object"),
        };
        let dst = self.load_active(parent);
        self.current_fiber = parent;
        self.stack[dst] = result;
    }

    fn save_active(&mut self, owner: Option<HeapRef>, dst: usize) {
        let ctx = Context { stack: std::mem::take(&mut self.stack), pc: self.pc, frames: self.frames.take_raw(), dst };
        match owner {
            Some(r) => {
                if let HeapObject::Fiber(state) = self.heap.get_mut(r) {
                    state.stack = ctx.stack;
                    state.pc = ctx.pc;
                    state.frames = ctx.frames;
                    state.resume_dst = ctx.dst;
                }
            }
            None => self.root_saved = Some(ctx),
        }
    }

    /// Restore `owner`'s saved context as active, returning the dst its
    /// suspended `Coresume` recorded.
    fn load_active(&mut self, owner: Option<HeapRef>) -> usize {
        match owner {
            Some(r) => {
                if let HeapObject::Fiber(state) = self.heap.get_mut(r) {
                    self.stack = std::mem::take(&mut state.stack);
                    self.pc = state.pc;
                    self.frames = Frames::from_raw(std::mem::take(&mut state.frames));
                    state.resume_dst
                } else {
                    0
                }
            }
            None => {
                let ctx = self.root_saved.take().unwrap_or_else(|| Context {
                    stack: vec![Value::NONE; self.config.stack_size],
                    pc: 0,
                    frames: Vec::new(),
                    dst: 0,
                });
                self.stack = ctx.stack;
                self.pc = ctx.pc;
                self.frames = Frames::from_raw(ctx.frames);
                ctx.dst
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::create()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_asm::Assembler;

    #[test]
    fn eval_chunk_runs_entry_frame_to_end() {
        let mut asm = Assembler::new();
        asm.emit(ember_asm::Instruction::ConstI8Int { imm: 41, dst: ember_asm::StackSlot(0) });
        asm.end();
        let chunk = Chunk::new(asm.finish(), vec![], vec![]);

        let mut vm = Vm::create();
        let result = vm.eval_chunk(chunk).unwrap();
        assert!(result.is_integer());
        assert_eq!(result.as_integer(), 41);
    }

    #[test]
    fn deinit_releases_static_slots() {
        let mut vm = Vm::create();
        let r = vm.heap_mut().alloc(TypeId::LIST, HeapObject::List(vec![]));
        vm.set_static_slot(0, Value::pointer(r));
        vm.deinit();
        assert_eq!(vm.global_rc(), 0);
    }
}
