//! Method JIT engine for a stack-bytecode VM.
//!
//! Hot iseqs are translated into C source, compiled by an ordinary
//! ahead-of-time compiler (GCC or Clang) in a single background worker
//! thread, loaded with the dynamic linker, and the resulting function
//! pointer is atomically published into the iseq so the interpreter
//! dispatches to native code on the next invocation.
//!
//! # Architecture
//!
//! ```text
//! interpreter ──► submit(iseq) ──► unit queue ──► worker thread
//!                                                    │
//!                                   PCH build (once) │ translate → cc → dlopen
//!                                                    ▼
//! interpreter ◄── atomic jit_func publish ◄──── loaded .so
//! ```
//!
//! # Key Concepts
//!
//! - **Unit**: one compilation job tied to exactly one iseq; owns the
//!   loaded shared object after success.
//! - **Priority queue**: the worker always picks the pending iseq with
//!   the most recorded calls; order is decided at dequeue.
//! - **GC/JIT gate**: `gc_start_hook`/`gc_finish_hook` and the worker's
//!   translation window are mutually exclusive, so the translator never
//!   reads an iseq a collection is moving or freeing.
//! - **Cancel**: generated code bails out with `Qundef` when a cache
//!   guard fails; the interpreter resumes at the saved program counter.
//!
//! # Example
//!
//! ```ignore
//! use method_jit::{init, submit, finish, IseqBuilder, JitOptions};
//!
//! init(JitOptions::enabled())?;
//! let iseq = IseqBuilder::new().encoded(words).stack_max(2).build();
//! iseq.record_call();
//! submit(&iseq);
//! // ... dispatch through iseq.jit_func() once it flips to Compiled ...
//! finish();
//! ```

mod cc;
mod config;
mod engine;
mod error;
mod insn;
mod iseq;
mod queue;
mod translate;
mod unit;
mod worker;

pub use config::{JitOptions, Toolchain, DEFAULT_HEADER_DIRS, DEFAULT_MAX_CACHE_SIZE};
pub use engine::{after_fork_child, finish, free_iseq, gc_finish_hook, gc_start_hook, init, submit};
pub use error::{JitError, TranslateError};
pub use insn::Opcode;
pub use iseq::{
    bump_global_method_state, global_method_state, CallCache, CallInfo, CaseDispatchTable,
    ControlFrame, ExecContext, InlineCache, Iseq, IseqBuilder, IseqLocation, JitFunc, JitFuncState,
    MethodKind, MethodVisibility, ParamInfo, Value, CALL_ARGS_BLOCKARG, CALL_ARGS_SPLAT,
    CALL_KWARG, CALL_KW_SPLAT, LAST_JIT_FUNC, NOT_ADDED_JIT_FUNC, NOT_COMPILABLE_JIT_FUNC,
};
pub use translate::translate;
pub use unit::Unit;
