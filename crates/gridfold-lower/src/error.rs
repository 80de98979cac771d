use thiserror::Error;

/// Everything that can abort the lowering. The pass does not recover from
/// malformed input; recoverable conditions (stale φ entries, unreachable
/// blocks, orphaned constants) are cleaned up silently and never surface
/// here.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LowerError {
    #[error("unsupported terminator in kernel @{proc}, bb{block}: {kind}")]
    UnsupportedTerminator {
        proc: String,
        block: usize,
        kind: String,
    },

    #[error("barrier in kernel @{proc} is reached by a conditional branch from bb{block}")]
    ConditionalBarrierEdge { proc: String, block: usize },

    #[error("post-barrier block bb{block} of kernel @{proc} has multiple predecessors")]
    MultiplePredecessors { proc: String, block: usize },

    #[error(
        "kernel @{proc} uses more than one dynamic shared variable: @{first} and @{second}"
    )]
    MultipleDynamicShared {
        proc: String,
        first: String,
        second: String,
    },

    #[error("constant expression rooted at @{symbol} cannot be rebuilt as instructions: {detail}")]
    UnhandledConstExpr { symbol: String, detail: String },

    #[error("required support symbol @{name} is missing from the module")]
    MissingSupportSymbol { name: String },

    #[error("preserved-data record of kernel @{proc} is inconsistent across subkernels")]
    PreservedIndexMismatch { proc: String },
}

pub type Result<T, E = LowerError> = core::result::Result<T, E>;
