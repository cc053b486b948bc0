//! Error types for the backward slicer.

use backslice_core::{BlockId, CondCode};
use thiserror::Error;

/// Fatal conditions that abort a slice.
///
/// A slice that fails leaves any partial results already written to the
/// slicer readable; the embedder decides what to do with them.
#[derive(Error, Debug)]
pub enum Error {
    /// An expression variant the slicer cannot reason about.
    #[error("unsupported expression in slice: {0}")]
    UnsupportedExpr(String),

    /// A statement kind that must not appear on a sliced path.
    #[error("unsupported statement in slice: {0}")]
    UnsupportedStmt(String),

    /// Only unsigned `<=` and `>=` guards can bound a jump-table index.
    #[error("cannot build an index interval from condition code {0}")]
    UnsupportedCondition(CondCode),

    /// Branches must target address constants.
    #[error("branch target is not an address: {0}")]
    MalformedBranchTarget(String),

    /// The host has no block for an id reached on the walk.
    #[error("host has no block {0}")]
    UnknownBlock(BlockId),

    /// The instruction cursor fell outside the block.
    #[error("instruction index {index} out of range for {block}")]
    InvalidCursor { block: BlockId, index: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
