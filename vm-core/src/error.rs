//! Error taxonomy, result codes, and panic reports (§7).

use derive_more::Display;

/// Top-level outcome of [`crate::vm::Vm::eval`]/[`crate::vm::Vm::validate`],
/// matching `CsResultCode`'s wire values exactly (§6 Bytecode format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ResultCode {
    #[display(fmt = "success")]
    Success = 0,
    #[display(fmt = "token error")]
    Token = 1,
    #[display(fmt = "parse error")]
    Parse = 2,
    #[display(fmt = "compile error")]
    Compile = 3,
    #[display(fmt = "panic")]
    Panic = 4,
    #[display(fmt = "unknown error")]
    Unknown = 5,
}

/// Why a bytecode-originated panic (§7's `Panic` kind and its listed
/// sub-causes) was raised. Every variant here is observable as
/// `ResultCode::Panic` plus a [`PanicReport`].
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum PanicReason {
    #[display(fmt = "type error: {message}")]
    TypeError { message: String },
    #[display(fmt = "division by zero")]
    DivByZero,
    #[display(fmt = "out of memory")]
    OutOfMemory,
    #[display(fmt = "stack overflow")]
    StackOverflow,
    #[display(fmt = "symbol not found: {symbol}")]
    NotFound { symbol: String },
    #[display(fmt = "host function missing: {name}")]
    HostFuncMissing { name: String },
    #[display(fmt = "module not found: {spec}")]
    ModuleNotFound { spec: String },
    #[display(fmt = "heap corruption detected")]
    Corruption,
    #[display(fmt = "resumed a fiber that is not suspended")]
    FiberNotResumable,
    #[display(fmt = "unverified bytecode: {detail}")]
    VerifierViolation { detail: String },
    /// An unhandled panic previously converted to an `Error` value by
    /// `TryValue` and re-raised (or, absent a handler, propagated out of
    /// `eval`).
    #[display(fmt = "uncaught error: {symbol_id}")]
    UncaughtError { symbol_id: u32 },
}

/// A located panic: the reason plus the program counter it occurred at, so
/// [`crate::vm::Vm::alloc_last_error_report`] can resolve a source line via
/// the chunk's line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    pub reason: PanicReason,
    pub pc: u32,
}

impl std::fmt::Display for PanicReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panic at pc={}: {}", self.pc, self.reason)
    }
}

/// Error surfaced by the embedding API, covering both this core's own
/// panics and the narrow external-collaborator failures (§7) it forwards
/// as-is (module resolution, compilation — those collaborators' internals
/// are out of scope, but their failure modes still need a place to land).
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum VmError {
    #[display(fmt = "{_0}")]
    Panic(PanicReport),
    #[display(fmt = "token error: {_0}")]
    Token(String),
    #[display(fmt = "parse error: {_0}")]
    Parse(String),
    #[display(fmt = "compile error: {_0}")]
    Compile(String),
}

impl std::error::Error for VmError {}

impl VmError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            VmError::Panic(_) => ResultCode::Panic,
            VmError::Token(_) => ResultCode::Token,
            VmError::Parse(_) => ResultCode::Parse,
            VmError::Compile(_) => ResultCode::Compile,
        }
    }
}
