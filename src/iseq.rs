//! The iseq body as the JIT engine sees it.
//!
//! Everything here is owned by the host interpreter and read-only to the
//! engine, except for the two coupling fields: `jit_unit`, set once when
//! the iseq is submitted, and `jit_func`, the atomically published
//! function pointer the dispatch loop reads without any lock.

use crate::unit::Unit;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A VM value word. The encoding (tagging, heap pointers) is the host's
/// business; the translator only embeds these words into emitted source.
pub type Value = u64;

/// `jit_func` when no code was loaded; also the initial state.
pub const NOT_ADDED_JIT_FUNC: usize = 0;
/// `jit_func` when translation or compilation failed; never retried.
pub const NOT_COMPILABLE_JIT_FUNC: usize = 1;
/// Upper bound of the sentinel range. A genuine pointer compares greater.
pub const LAST_JIT_FUNC: usize = 2;

/// Execution context of the host VM (opaque).
#[repr(C)]
pub struct ExecContext {
    _opaque: [u8; 0],
}

/// Control frame of the host VM (opaque).
#[repr(C)]
pub struct ControlFrame {
    _opaque: [u8; 0],
}

/// Signature of a JIT-compiled method body.
pub type JitFunc = unsafe extern "C" fn(*mut ExecContext, *mut ControlFrame) -> Value;

/// What the interpreter finds in `jit_func` at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitFuncState {
    /// No code yet (or loading failed); keep interpreting.
    NotAdded,
    /// Translation or compilation failed; keep interpreting, never resubmit.
    NotCompilable,
    /// Compiled code is installed.
    Compiled(usize),
}

/// Method-state serial of the host VM. The host bumps it on any method
/// (re)definition; call caches record the serial they were filled under
/// and are stale once it moves.
pub static GLOBAL_METHOD_STATE: AtomicU64 = AtomicU64::new(1);

/// Current global method-state serial.
pub fn global_method_state() -> u64 {
    GLOBAL_METHOD_STATE.load(Ordering::Acquire)
}

/// Invalidate every call cache filled so far.
pub fn bump_global_method_state() {
    GLOBAL_METHOD_STATE.fetch_add(1, Ordering::AcqRel);
}

/// `CallInfo::flag` bit: positional splat argument.
pub const CALL_ARGS_SPLAT: u32 = 1 << 0;
/// `CallInfo::flag` bit: trailing block argument.
pub const CALL_ARGS_BLOCKARG: u32 = 1 << 1;
/// `CallInfo::flag` bit: keyword arguments.
pub const CALL_KWARG: u32 = 1 << 2;
/// `CallInfo::flag` bit: keyword splat.
pub const CALL_KW_SPLAT: u32 = 1 << 3;

/// Static call-site information.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Method id (interned name handle).
    pub mid: u64,
    /// `CALL_*` flag bits.
    pub flag: u32,
    /// Argument count as written at the call site.
    pub orig_argc: u32,
}

/// Visibility of a resolved method entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodVisibility {
    Public,
    Private,
    Protected,
}

/// What a call cache resolved its method to.
#[derive(Debug, Clone)]
pub enum MethodKind {
    /// Native method. `me` is the host's callable-method-entry handle,
    /// embedded verbatim into the emitted call.
    Cfunc { me: Value },
    /// Bytecode method.
    Iseq {
        iseq: Arc<Iseq>,
        me: Value,
        visibility: MethodVisibility,
    },
    /// Anything else; dispatch goes through the cache's call handler.
    Generic,
}

/// Per-call-site inline cache, filled by the interpreter's method search.
#[derive(Debug, Clone)]
pub struct CallCache {
    /// Global method-state serial at fill time.
    pub method_state: u64,
    /// Serial of the receiver class at fill time.
    pub class_serial: u64,
    /// Resolved method, if the cache has been filled.
    pub method: Option<MethodKind>,
}

impl CallCache {
    /// An empty (never filled) cache.
    pub fn empty() -> Self {
        Self {
            method_state: 0,
            class_serial: 0,
            method: None,
        }
    }
}

/// Constant inline-cache slot. Opaque to the engine; emitted by address.
#[derive(Debug, Default)]
pub struct InlineCache {
    /// Constant-state serial at fill time.
    pub serial: u64,
}

/// `opt_case_dispatch` table: branch offsets in the host's dispatch-hash
/// iteration order. Offsets may repeat for aliased keys.
#[derive(Debug, Clone, Default)]
pub struct CaseDispatchTable {
    pub offsets: Vec<u32>,
}

/// Parameter shape of a method body.
#[derive(Debug, Clone, Default)]
pub struct ParamInfo {
    /// Number of parameter slots.
    pub size: u32,
    /// Entry program counters for optional arguments, one per prefix of
    /// filled optionals. Empty when the method has none.
    pub opt_table: Vec<u32>,
    /// True when the callee qualifies for an inline frame push: fixed
    /// arity, no splat/rest/keyword handling of its own.
    pub simple: bool,
}

impl ParamInfo {
    pub fn has_opt(&self) -> bool {
        !self.opt_table.is_empty()
    }
}

/// Source location, used only for log messages.
#[derive(Debug, Clone, Default)]
pub struct IseqLocation {
    pub label: String,
    pub path: String,
    pub first_lineno: u32,
}

/// Compiled bytecode body of a method or block.
#[derive(Debug)]
pub struct Iseq {
    /// Linear opcode + operand words.
    pub encoded: Vec<u64>,
    /// Maximum operand-stack depth the interpreter would use.
    pub stack_max: u32,
    /// Local table size, parameters included.
    pub local_table_size: u32,
    /// Parameter shape.
    pub param: ParamInfo,
    /// Source location for log messages.
    pub location: IseqLocation,
    /// Whether the body has a catch table (changes post-call handling).
    pub has_catch_table: bool,
    /// Dispatch-time call counter; the queue's hotness signal.
    pub total_calls: AtomicU64,
    /// Call-site side tables, indexed by operand words.
    pub call_infos: Vec<CallInfo>,
    pub call_caches: Vec<CallCache>,
    /// Constant inline caches, indexed by operand words.
    pub inline_caches: Vec<InlineCache>,
    /// Case-dispatch tables, indexed by operand words.
    pub case_tables: Vec<CaseDispatchTable>,
    pub(crate) jit_unit: OnceCell<Arc<Unit>>,
    pub(crate) jit_func: AtomicUsize,
}

impl Iseq {
    /// Number of words in the encoded sequence.
    pub fn iseq_size(&self) -> usize {
        self.encoded.len()
    }

    /// Record one dispatch. Called by the interpreter on every invocation.
    pub fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Current call count.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// The unit this iseq was submitted as, if any.
    pub fn unit(&self) -> Option<&Arc<Unit>> {
        self.jit_unit.get()
    }

    /// Lock-free read of the published function pointer, as the dispatch
    /// loop performs it.
    pub fn jit_func(&self) -> JitFuncState {
        match self.jit_func.load(Ordering::Acquire) {
            NOT_ADDED_JIT_FUNC => JitFuncState::NotAdded,
            NOT_COMPILABLE_JIT_FUNC => JitFuncState::NotCompilable,
            raw => JitFuncState::Compiled(raw),
        }
    }

    /// Reinterpret a published address as a callable function.
    ///
    /// # Safety
    ///
    /// `raw` must be an address published into this iseq's `jit_func`,
    /// and the unit owning the loaded object must still be alive.
    pub unsafe fn func_from_raw(raw: usize) -> JitFunc {
        std::mem::transmute::<usize, JitFunc>(raw)
    }

    /// Atomically publish a function pointer or sentinel.
    pub(crate) fn publish_func(&self, raw: usize) {
        self.jit_func.store(raw, Ordering::Release);
    }
}

/// Builder for iseq bodies, used by hosts and tests.
#[derive(Debug, Default)]
pub struct IseqBuilder {
    encoded: Vec<u64>,
    stack_max: u32,
    local_table_size: u32,
    param: ParamInfo,
    location: IseqLocation,
    has_catch_table: bool,
    call_infos: Vec<CallInfo>,
    call_caches: Vec<CallCache>,
    inline_caches: Vec<InlineCache>,
    case_tables: Vec<CaseDispatchTable>,
}

impl IseqBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoded(mut self, words: Vec<u64>) -> Self {
        self.encoded = words;
        self
    }

    pub fn stack_max(mut self, max: u32) -> Self {
        self.stack_max = max;
        self
    }

    pub fn local_table_size(mut self, size: u32) -> Self {
        self.local_table_size = size;
        self
    }

    pub fn param(mut self, param: ParamInfo) -> Self {
        self.param = param;
        self
    }

    pub fn location(mut self, label: &str, path: &str, first_lineno: u32) -> Self {
        self.location = IseqLocation {
            label: label.to_string(),
            path: path.to_string(),
            first_lineno,
        };
        self
    }

    pub fn catch_table(mut self, present: bool) -> Self {
        self.has_catch_table = present;
        self
    }

    pub fn call_site(mut self, ci: CallInfo, cc: CallCache) -> Self {
        self.call_infos.push(ci);
        self.call_caches.push(cc);
        self
    }

    pub fn inline_cache(mut self, ic: InlineCache) -> Self {
        self.inline_caches.push(ic);
        self
    }

    pub fn case_table(mut self, table: CaseDispatchTable) -> Self {
        self.case_tables.push(table);
        self
    }

    pub fn build(self) -> Arc<Iseq> {
        Arc::new(Iseq {
            encoded: self.encoded,
            stack_max: self.stack_max,
            local_table_size: self.local_table_size,
            param: self.param,
            location: self.location,
            has_catch_table: self.has_catch_table,
            total_calls: AtomicU64::new(0),
            call_infos: self.call_infos,
            call_caches: self.call_caches,
            inline_caches: self.inline_caches,
            case_tables: self.case_tables,
            jit_unit: OnceCell::new(),
            jit_func: AtomicUsize::new(NOT_ADDED_JIT_FUNC),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_iseq_is_not_added() {
        let iseq = IseqBuilder::new().encoded(vec![54]).stack_max(1).build();
        assert_eq!(iseq.jit_func(), JitFuncState::NotAdded);
        assert_eq!(iseq.total_calls(), 0);
        assert!(iseq.unit().is_none());
    }

    #[test]
    fn publish_and_read_back() {
        let iseq = IseqBuilder::new().build();
        iseq.publish_func(NOT_COMPILABLE_JIT_FUNC);
        assert_eq!(iseq.jit_func(), JitFuncState::NotCompilable);

        let fake = 0xdead_0000usize;
        assert!(fake > LAST_JIT_FUNC);
        iseq.publish_func(fake);
        assert_eq!(iseq.jit_func(), JitFuncState::Compiled(fake));
    }

    #[test]
    fn call_counter() {
        let iseq = IseqBuilder::new().build();
        for _ in 0..5 {
            iseq.record_call();
        }
        assert_eq!(iseq.total_calls(), 5);
    }

}
