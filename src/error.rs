//! Engine and translation error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while starting or tearing down the JIT engine.
///
/// None of these are fatal to the host: a failed `init` leaves the engine
/// disabled and the interpreter remains the execution path.
#[derive(Debug, Error)]
pub enum JitError {
    /// The runtime header was not found in any probed directory.
    #[error("runtime header {name:?} not found under {searched:?}")]
    HeaderNotFound { name: String, searched: Vec<PathBuf> },

    /// `init` was called while an engine is already running.
    #[error("JIT engine already initialized")]
    AlreadyInitialized,

    /// The background worker thread could not be spawned.
    #[error("failed to spawn JIT worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Reasons the translator rejects an iseq.
///
/// A rejected unit publishes `NOT_COMPILABLE_JIT_FUNC` so the interpreter
/// keeps interpreting and never resubmits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    /// Instruction has no JIT lowering.
    #[error("unsupported instruction: {0}")]
    UnsupportedInsn(&'static str),

    /// Opcode word does not decode.
    #[error("undecodable opcode word {word:#x} at position {pos}")]
    BadOpcode { pos: usize, word: u64 },

    /// Instruction operands run past the end of the sequence.
    #[error("instruction at position {pos} overruns iseq of size {size}")]
    TruncatedInsn { pos: usize, size: usize },

    /// Operand refers to a side-table entry that does not exist.
    #[error("operand at position {pos} indexes a missing {table} entry")]
    BadOperand { pos: usize, table: &'static str },

    /// Simulated stack depth exceeded the recorded maximum.
    #[error("simulated stack depth {depth} exceeds stack_max {max} at position {pos}")]
    StackOverflow { pos: usize, depth: i64, max: u32 },

    /// Simulated stack depth went negative.
    #[error("simulated stack underflow at position {pos}")]
    StackUnderflow { pos: usize },

    /// Stack depth was not exactly one at a `leave`.
    #[error("stack depth {depth} at leave (expected 1) at position {pos}")]
    UnbalancedLeave { pos: usize, depth: i64 },

    /// Branch or dispatch target outside the instruction sequence.
    #[error("branch target {target} outside iseq of size {size}")]
    BranchOutOfRange { target: i64, size: usize },

    /// A `goto` was emitted to a position no branch ever compiled.
    #[error("branch target {target} was never compiled")]
    UncompiledTarget { target: usize },
}

impl TranslateError {
    /// True when the reject reflects malformed input rather than a
    /// lowering the translator simply does not implement.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, TranslateError::UnsupportedInsn(_))
    }
}
