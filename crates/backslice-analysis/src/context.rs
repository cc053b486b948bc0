//! Slice contexts and the liveness map.
//!
//! Each expression the backward walk keeps alive carries a context: why it
//! is tracked (jump-table computation or branch condition) and which of
//! its bits matter. When two contexts meet for the same expression, the
//! one covering the wider bit range wins.

use std::fmt;

use backslice_core::{BitRange, Expr};
use indexmap::map::Entry;
use indexmap::IndexMap;

/// Why an expression is live during the backward walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UseKind {
    #[default]
    None,
    JumpTable,
    Condition,
}

impl UseKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::JumpTable => "jumptable",
            Self::Condition => "condition",
        }
    }
}

/// Context attached to a live expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceCtx {
    pub kind: UseKind,
    pub bits: BitRange,
}

impl Default for SliceCtx {
    fn default() -> Self {
        Self {
            kind: UseKind::None,
            bits: BitRange::empty(),
        }
    }
}

impl SliceCtx {
    /// Context for an expression feeding the jump-table computation.
    pub fn jump_table(bits: BitRange) -> Self {
        Self {
            kind: UseKind::JumpTable,
            bits,
        }
    }

    /// Context for an expression feeding a branch condition.
    pub fn condition(bits: BitRange) -> Self {
        Self {
            kind: UseKind::Condition,
            bits,
        }
    }

    /// The same context restricted (or widened) to `bits`.
    pub fn with_bits(self, bits: BitRange) -> Self {
        Self { bits, ..self }
    }

    /// The stronger of two contexts for the same expression: the one
    /// covering the wider bit range. Ties keep `self`.
    pub fn merge(self, other: SliceCtx) -> SliceCtx {
        if other.bits > self.bits {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for SliceCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.bits)
    }
}

/// Live expressions keyed by structural value, in insertion order.
///
/// Insertion order matters: the assignment transfer picks the *first*
/// killed entry as its substitution target, and `IndexMap` makes that
/// choice deterministic.
pub type LiveMap = IndexMap<Expr, SliceCtx>;

/// Inserts one live expression, keeping the wider context on collision.
pub fn insert_live(map: &mut LiveMap, expr: Expr, ctx: SliceCtx) {
    match map.entry(expr) {
        Entry::Occupied(mut o) => {
            let merged = o.get().merge(ctx);
            o.insert(merged);
        }
        Entry::Vacant(v) => {
            v.insert(ctx);
        }
    }
}

/// Merges `src` into `dst`, keeping the wider context for shared keys.
pub fn merge_live(dst: &mut LiveMap, src: &LiveMap) {
    for (expr, ctx) in src {
        insert_live(dst, expr.clone(), *ctx);
    }
}
