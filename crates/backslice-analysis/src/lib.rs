//! # backslice-analysis
//!
//! A backward slicer that resolves the targets of indirect control
//! transfers (`jmp [table + reg*4]`). Starting from the jump's target
//! expression, the slicer walks statement by statement backward through a
//! control flow graph, tracking which storage locations still contribute
//! to the computed destination. The walk ends when it has recovered
//! both the *jump-table format* (a symbolic expression that maps an index
//! to a destination) and a strided interval bounding the index, derived
//! from a guarding comparison or bit mask.

pub mod context;
pub mod error;
pub mod simplify;
pub mod slicer;
pub mod state;

pub use context::{LiveMap, SliceCtx, UseKind};
pub use error::{Error, Result};
pub use simplify::{replace, simplify};
pub use slicer::{BackwardSlicer, SliceHost};
pub use state::{SliceOutcome, SliceState, StepOutcome};
