//! Out-of-scope collaborator contracts (§1, §6): the compiler, module
//! resolver/loader, and host function/type binding surface. This crate does
//! not implement any of these — it specifies the traits a host or a real
//! front-end crate must satisfy, and exercises them in its own tests via
//! small stand-ins (`ember-asm`'s `Assembler` plays the compiler's role).

use crate::chunk::Chunk;
use crate::heap::{NativeFuncId, TypeId};
use crate::value::Value;
use crate::vm::Vm;

/// Produces a [`Chunk`] from source text. Parsing, scoping, and codegen are
/// explicitly out of scope (§1) — this crate only specifies the contract a
/// real compiler crate must satisfy to feed the dispatch loop.
pub trait Compiler {
    type Error: std::fmt::Display;

    fn compile(&mut self, src: &str) -> Result<Chunk, Self::Error>;
}

/// Resolves an import specifier relative to the importing module's URI.
/// Mirrors `CsModuleResolverFn`; the default resolver (`csDefaultModuleResolver`)
/// simply returns `spec` unchanged.
pub trait ModuleResolver {
    fn resolve(&mut self, current_uri: &str, spec: &str) -> Option<String>;
}

/// Default resolver: every specifier resolves to itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl ModuleResolver for IdentityResolver {
    fn resolve(&mut self, _current_uri: &str, spec: &str) -> Option<String> {
        Some(spec.to_owned())
    }
}

/// Host-provided detail for binding one `@host func` declaration, mirroring
/// `CsHostFuncInfo`.
#[derive(Debug, Clone)]
pub struct HostFuncInfo {
    pub module_id: u32,
    pub name: String,
    pub index: u32,
}

/// Calling convention for a bound host function: `Standard` has the
/// ordinary `(vm, args) -> Value` signature; `Quicken` variants additionally
/// see the call-site `pc` so they can install their own inline cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFuncKind {
    Standard,
    Quicken,
}

/// Result of resolving one `@host func`, mirroring `CsHostFuncResult`.
#[derive(Debug, Clone, Copy)]
pub struct HostFuncBinding {
    pub id: NativeFuncId,
    pub kind: HostFuncKind,
    pub arity: u8,
}

/// Host-side implementation of a bound native function.
pub type HostFn = fn(&mut Vm, &[Value]) -> Value;

/// Given info about a declared `@host func`, resolve its implementation.
pub trait HostFuncLoader {
    fn load_func(&mut self, vm: &mut Vm, info: &HostFuncInfo) -> Option<HostFuncBinding>;
}

/// Host-provided detail for binding one `@host type` declaration, mirroring
/// `CsHostTypeInfo`.
#[derive(Debug, Clone)]
pub struct HostTypeInfo {
    pub module_id: u32,
    pub name: String,
    pub index: u32,
}

/// Whether a host type is newly minted by this binding (`Object`) or refers
/// to a type id the VM already hardcodes (`CoreObject`), mirroring
/// `HostTypeType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTypeKind {
    Object,
    CoreObject,
}

/// Result of resolving one `@host type`, mirroring `CsHostTypeResult`. A
/// finalizer is mandatory whenever the bound object's size exceeds
/// [`crate::consts::POOL_MAX`] (§4.2); this is a precondition the host is
/// expected to uphold, so it is asserted rather than recovered from.
#[derive(Clone)]
pub struct HostTypeBinding {
    pub kind: HostTypeKind,
    pub type_id: TypeId,
    pub sema_type_id: u32,
    pub finalizer: Option<fn(&mut Vm, HeapTypeHandle)>,
}

/// Opaque handle a host finalizer uses to locate the object being torn
/// down. The finalizer must not otherwise touch the VM (§4.2: running
/// during GC teardown is undefined behavior beyond this narrow contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapTypeHandle(pub crate::value::HeapRef);

/// Given info about a declared `@host type`, resolve its binding.
pub trait HostTypeLoader {
    fn load_type(&mut self, vm: &mut Vm, info: &HostTypeInfo) -> Option<HostTypeBinding>;
}

/// Everything a resolved module needs to finish loading, mirroring
/// `CsModuleLoaderResult`.
pub struct ModuleLoaderResult {
    pub src: String,
    pub func_loader: Option<Box<dyn HostFuncLoader>>,
    pub var_loader: Option<Box<dyn Fn(&mut Vm, &str) -> Option<Value>>>,
    pub type_loader: Option<Box<dyn HostTypeLoader>>,
    pub pre_load: Option<fn(&mut Vm, u32)>,
    pub post_load: Option<fn(&mut Vm, u32)>,
    pub destroy: Option<fn(&mut Vm, u32)>,
}

/// Loads the source and host bindings for a resolved module URI, mirroring
/// `CsModuleLoaderFn`.
pub trait ModuleLoader {
    fn load(&mut self, resolved_uri: &str) -> Option<ModuleLoaderResult>;
}
