//! Worklist driver for the backward slicer.

use std::collections::{HashSet, VecDeque};

use backslice_core::{BlockId, Expr, RtlBlock, RtlGraph, StridedInterval};
use tracing::{debug, trace};

use crate::context::{LiveMap, SliceCtx};
use crate::error::{Error, Result};
use crate::state::{SliceState, StepOutcome};

/// Capabilities the slicer needs from the surrounding disassembly layer.
///
/// The host owns the control flow graph; the slicer only ever asks for a
/// block's contents and its predecessors. Predecessor order must be
/// deterministic for reproducible slices.
pub trait SliceHost {
    /// The block for `id`, if the host knows it.
    fn block(&self, id: BlockId) -> Option<&RtlBlock>;
    /// Blocks with an edge into `id`. May be empty.
    fn predecessors(&self, id: BlockId) -> Vec<BlockId>;
}

impl SliceHost for RtlGraph {
    fn block(&self, id: BlockId) -> Option<&RtlBlock> {
        RtlGraph::block(self, id)
    }

    fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        RtlGraph::predecessors(self, id).to_vec()
    }
}

/// Walks backward from an indirect control transfer until it can name the
/// jump-table format and bound the table index.
///
/// Drive it with [`BackwardSlicer::start`] followed by repeated
/// [`BackwardSlicer::step`] calls; results are readable at any point, and
/// remain readable after a fatal error.
pub struct BackwardSlicer<'h, H: SliceHost> {
    host: &'h H,
    worklist: VecDeque<SliceState>,
    visited: HashSet<BlockId>,
    live: LiveMap,
    jump_table_format: Option<Expr>,
    jump_table_index: Option<Expr>,
    jump_table_index_to_use: Option<Expr>,
    jump_table_index_interval: StridedInterval,
}

impl<'h, H: SliceHost> BackwardSlicer<'h, H> {
    pub fn new(host: &'h H) -> Self {
        Self {
            host,
            worklist: VecDeque::new(),
            visited: HashSet::new(),
            live: LiveMap::default(),
            jump_table_format: None,
            jump_table_index: None,
            jump_table_index_to_use: None,
            jump_table_index_interval: StridedInterval::EMPTY,
        }
    }

    /// Seeds the slice at the indirect transfer `expr`, found at statement
    /// `index` of `block`. Returns `false` when the target depends on no
    /// register at all (a literal destination), in which case nothing is
    /// enqueued.
    pub fn start(&mut self, block: BlockId, index: usize, expr: &Expr) -> Result<bool> {
        let mut state = SliceState::new(block, index as isize);
        self.visited.insert(block);
        let sr = state.slice_expr(expr, SliceCtx::jump_table(expr.range()))?;
        state.live = sr.live;
        state.jump_table_format = Some(sr.src.unwrap_or_else(|| expr.clone()));
        if !state.live.keys().any(|e| e.as_identifier().is_some()) {
            debug!(%block, target = %expr, "indirect target uses no registers");
            return Ok(false);
        }
        debug!(%block, index, target = %expr, "backward slice started");
        self.capture(&state);
        self.worklist.push_back(state);
        Ok(true)
    }

    /// Performs one unit of work: transfers one statement of some pending
    /// path, or fans a path out to its unvisited predecessors. Returns
    /// `false` once the worklist is exhausted.
    pub fn step(&mut self) -> Result<bool> {
        let Some(mut state) = self.worklist.pop_front() else {
            debug!("worklist empty; slice complete");
            return Ok(false);
        };
        if state.at_block_start() {
            let preds = self.host.predecessors(state.block);
            if preds.is_empty() {
                debug!(block = %state.block, "slice reached a block with no predecessors");
                self.capture(&state);
                return Ok(true);
            }
            trace!(block = %state.block, predecessors = preds.len(), "reached block top");
            let succ_addr = self.block_of(state.block)?.address;
            for pred in preds {
                if !self.visited.insert(pred) {
                    continue;
                }
                let pred_block = self.block_of(pred)?;
                trace!(from = %state.block, to = %pred, "fanning out to predecessor");
                let forked = state.fork(pred, pred_block.stmts.len() as isize - 1, succ_addr);
                self.worklist.push_back(forked);
            }
            return Ok(true);
        }
        let block = self.host.block(state.block).ok_or(Error::UnknownBlock(state.block))?;
        let outcome = state.step(block)?;
        self.capture(&state);
        if outcome == StepOutcome::Continue {
            self.worklist.push_back(state);
        }
        Ok(true)
    }

    /// Runs [`Self::step`] until the worklist drains or the budget is
    /// spent. Returns `true` if the walk converged within the budget.
    pub fn run(&mut self, max_steps: usize) -> Result<bool> {
        for _ in 0..max_steps {
            if !self.step()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn block_of(&self, id: BlockId) -> Result<&RtlBlock> {
        self.host.block(id).ok_or(Error::UnknownBlock(id))
    }

    // Mirrors the most recently processed state. Index and interval are
    // never downgraded: once a path has found them, a still-walking
    // sibling cannot erase them.
    fn capture(&mut self, state: &SliceState) {
        self.live = state.live.clone();
        self.jump_table_format = state.jump_table_format.clone();
        if state.jump_table_index.is_some() {
            self.jump_table_index = state.jump_table_index.clone();
        }
        if state.jump_table_index_to_use.is_some() {
            self.jump_table_index_to_use = state.jump_table_index_to_use.clone();
        }
        if !state.jump_table_index_interval.is_empty() {
            self.jump_table_index_interval = state.jump_table_index_interval;
        }
    }

    /// Expressions still feeding the indirect target.
    pub fn live(&self) -> &LiveMap {
        &self.live
    }

    /// The symbolic expression that, given an index, yields a destination.
    pub fn jump_table_format(&self) -> Option<&Expr> {
        self.jump_table_format.as_ref()
    }

    /// The expression the guarding comparison constrains.
    pub fn jump_table_index(&self) -> Option<&Expr> {
        self.jump_table_index.as_ref()
    }

    /// The index expression as it appears in the table computation.
    pub fn jump_table_index_to_use(&self) -> Option<&Expr> {
        self.jump_table_index_to_use.as_ref()
    }

    /// Bound on the index derived from the guard; empty until a guard has
    /// been observed.
    pub fn jump_table_index_interval(&self) -> StridedInterval {
        self.jump_table_index_interval
    }
}
