//! RTL statements.

use std::fmt;

use crate::Expr;

/// A register-transfer statement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Stmt {
    /// `dst := src`.
    Assign { dst: Expr, src: Expr },
    /// `if (cond) goto target`; `target` must be an address constant.
    Branch { cond: Expr, target: Expr },
    /// Unconditional transfer, possibly computed.
    Goto { target: Expr },
    /// Procedure call.
    Call { target: Expr },
    /// Opaque effect on machine state (ports, intrinsics).
    SideEffect { expr: Expr },
    /// No operation.
    Nop,
    /// Procedure return.
    Return,
    /// Micro-guarded statement (e.g. a REP-prefixed instruction).
    If { cond: Expr, body: Box<Stmt> },
    /// Undecodable input.
    Invalid,
}

impl Stmt {
    pub fn assign(dst: Expr, src: Expr) -> Self {
        Self::Assign { dst, src }
    }

    pub fn branch(cond: Expr, target: Expr) -> Self {
        Self::Branch { cond, target }
    }

    pub fn goto(target: Expr) -> Self {
        Self::Goto { target }
    }

    pub fn call(target: Expr) -> Self {
        Self::Call { target }
    }

    pub fn side_effect(expr: Expr) -> Self {
        Self::SideEffect { expr }
    }

    /// A short name for the statement kind, used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Assign { .. } => "assign",
            Self::Branch { .. } => "branch",
            Self::Goto { .. } => "goto",
            Self::Call { .. } => "call",
            Self::SideEffect { .. } => "side-effect",
            Self::Nop => "nop",
            Self::Return => "return",
            Self::If { .. } => "if",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assign { dst, src } => write!(f, "{dst} = {src}"),
            Self::Branch { cond, target } => write!(f, "if ({cond}) goto {target}"),
            Self::Goto { target } => write!(f, "goto {target}"),
            Self::Call { target } => write!(f, "call {target}"),
            Self::SideEffect { expr } => write!(f, "{expr}"),
            Self::Nop => write!(f, "nop"),
            Self::Return => write!(f, "return"),
            Self::If { cond, body } => write!(f, "if ({cond}) {body}"),
            Self::Invalid => write!(f, "<invalid>"),
        }
    }
}
