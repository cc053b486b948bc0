//! Per-path slice state and the backward transfer functions.
//!
//! A [`SliceState`] is one path of the backward walk: a cursor into a
//! block, the map of expressions still feeding the indirect target, and
//! the partial results recovered so far. The transfer functions here are
//! the core of the analysis; the driver in [`crate::slicer`] only
//! schedules states and fans them out to predecessors.

use backslice_core::{
    BinOp, BitRange, BlockId, CondCode, Constant, Expr, Identifier, RtlBlock, Stmt,
    StridedInterval,
};
use tracing::{debug, enabled, trace, Level};

use crate::context::{insert_live, merge_live, LiveMap, SliceCtx};
use crate::error::{Error, Result};
use crate::simplify::{replace, simplify};

/// What the expression transfer hands back to its caller.
#[derive(Debug, Default)]
pub struct SliceOutcome {
    /// Expressions this sub-tree makes live, with their contexts.
    pub live: LiveMap,
    /// The (possibly rewritten) source expression for substitution.
    pub src: Option<Expr>,
    /// The walk found its bounding guard and must not continue.
    pub stop: bool,
}

/// Result of transferring one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep walking backward.
    Continue,
    /// This path is terminal: the guard was found or nothing is left to
    /// track.
    Stop,
}

/// One backward path through the CFG.
#[derive(Debug, Clone)]
pub struct SliceState {
    /// Block the cursor is in.
    pub block: BlockId,
    /// Index of the next statement to transfer; -1 once the walk has
    /// consumed the whole block.
    pub cursor: isize,
    /// Expressions whose values still reach the indirect target.
    pub live: LiveMap,
    /// Address of the block this path descended from.
    pub addr_succ: Option<u64>,
    /// Condition code seen in the most recent flag test.
    pub cc_next: Option<CondCode>,
    /// Set when the reconstructed path falls through a branch instead of
    /// taking it.
    pub invert_condition: bool,
    /// Destination of the assignment currently being transferred.
    assign_lhs: Option<Expr>,
    /// The symbolic expression that, given an index, yields a destination.
    pub jump_table_format: Option<Expr>,
    /// The expression the guarding comparison constrains.
    pub jump_table_index: Option<Expr>,
    /// The index expression as it appears in the table computation.
    pub jump_table_index_to_use: Option<Expr>,
    /// Bound on the index derived from the guard.
    pub jump_table_index_interval: StridedInterval,
}

impl SliceState {
    pub fn new(block: BlockId, cursor: isize) -> Self {
        Self {
            block,
            cursor,
            live: LiveMap::default(),
            addr_succ: None,
            cc_next: None,
            invert_condition: false,
            assign_lhs: None,
            jump_table_format: None,
            jump_table_index: None,
            jump_table_index_to_use: None,
            jump_table_index_interval: StridedInterval::EMPTY,
        }
    }

    /// Clones this path into `pred`, which rejoins the current block at
    /// `succ_addr`. Each fork evolves its live map independently.
    pub fn fork(&self, pred: BlockId, cursor: isize, succ_addr: u64) -> Self {
        Self {
            block: pred,
            cursor,
            live: self.live.clone(),
            addr_succ: Some(succ_addr),
            cc_next: self.cc_next,
            invert_condition: self.invert_condition,
            assign_lhs: None,
            jump_table_format: self.jump_table_format.clone(),
            jump_table_index: self.jump_table_index.clone(),
            jump_table_index_to_use: self.jump_table_index_to_use.clone(),
            jump_table_index_interval: self.jump_table_index_interval,
        }
    }

    /// Returns true when every statement of the block has been consumed.
    pub fn at_block_start(&self) -> bool {
        self.cursor < 0
    }

    /// Transfers the statement under the cursor and steps backward.
    pub fn step(&mut self, block: &RtlBlock) -> Result<StepOutcome> {
        debug_assert_eq!(self.block, block.id);
        debug_assert!(!self.at_block_start());
        let index = self.cursor as usize;
        let stmt = block
            .stmts
            .get(index)
            .ok_or(Error::InvalidCursor {
                block: block.id,
                index,
            })?;
        trace!(block = %block.id, index, stmt = %stmt, "slicing statement");
        let sr = self.step_stmt(stmt)?;
        self.cursor -= 1;
        if enabled!(Level::TRACE) {
            let live: Vec<String> = self.live.iter().map(|(e, c)| format!("{e}: {c}")).collect();
            trace!(?live, "live after transfer");
        }
        if sr.stop {
            debug!(
                block = %block.id,
                interval = %self.jump_table_index_interval,
                "slice found its bounding guard"
            );
            return Ok(StepOutcome::Stop);
        }
        if self.live.is_empty() {
            debug!(block = %block.id, "live set exhausted");
            return Ok(StepOutcome::Stop);
        }
        Ok(StepOutcome::Continue)
    }

    fn step_stmt(&mut self, stmt: &Stmt) -> Result<SliceOutcome> {
        match stmt {
            Stmt::Assign { dst, src } => self.transfer_assign(dst, src),
            Stmt::Branch { cond, target } => self.transfer_branch(cond, target),
            Stmt::Goto { target } => self.transfer_goto(target),
            Stmt::Call { .. } | Stmt::SideEffect { .. } => {
                // Calls are opaque; callee-saved conventions are assumed.
                Ok(SliceOutcome::default())
            }
            other => Err(Error::UnsupportedStmt(other.name().to_string())),
        }
    }

    /// Kill/gen for `dst := src`.
    ///
    /// Every live identifier aliasing the destination's domain is killed;
    /// the source is then sliced under the first killed entry's context,
    /// and the killed identifier is rewritten to the source inside the
    /// jump-table format. Writes narrower than a killed register leave the
    /// untouched bits live and substitute a bit deposit instead.
    fn transfer_assign(&mut self, dst: &Expr, src: &Expr) -> Result<SliceOutcome> {
        let Some(dst_id) = dst.as_identifier().cloned() else {
            // Memory writes cannot kill a tracked register.
            return Ok(SliceOutcome::default());
        };
        let dead: Vec<(Identifier, SliceCtx)> = self
            .live
            .iter()
            .filter_map(|(e, c)| {
                e.as_identifier()
                    .filter(|id| id.storage.domain == dst_id.storage.domain)
                    .map(|id| (id.clone(), *c))
            })
            .collect();
        if dead.is_empty() {
            return Ok(SliceOutcome::default());
        }
        for (id, _) in &dead {
            self.live.shift_remove(&Expr::Id(id.clone()));
        }
        let (lhs_id, dead_ctx) = dead[0].clone();
        let lhs = Expr::Id(lhs_id.clone());

        let written = dst_id.storage.bit_range();
        let lhs_window = lhs_id.storage.bit_range();
        let full_write = written.begin <= lhs_window.begin && lhs_window.end <= written.end;
        let src_ctx = if full_write {
            dead_ctx
        } else {
            dead_ctx.with_bits(BitRange::new(0, dst_id.storage.bits.min(BitRange::MAX_BITS)))
        };

        self.assign_lhs = Some(lhs.clone());
        let sr = self.slice_expr(src, src_ctx)?;

        // Bits of a killed register outside the written window still flow
        // from older definitions.
        for (id, ctx) in &dead {
            let window = shift_range(ctx.bits, id.storage.bit_offset);
            if let Some(rest) = residual(window, written) {
                let back = unshift_range(rest, id.storage.bit_offset);
                insert_live(&mut self.live, Expr::Id(id.clone()), ctx.with_bits(back));
            }
        }
        merge_live(&mut self.live, &sr.live);

        if let Some(format) = self.jump_table_format.take() {
            let vsrc = sr.src.clone().unwrap_or_else(|| src.clone());
            let replacement = substitution(&dst_id, &lhs_id, vsrc);
            let rewritten = replace(&lhs, &replacement, &format);
            self.jump_table_format = Some(simplify(&rewritten));
        }
        self.assign_lhs = None;
        Ok(sr)
    }

    fn transfer_branch(&mut self, cond: &Expr, target: &Expr) -> Result<SliceOutcome> {
        let Expr::Addr(addr) = target else {
            return Err(Error::MalformedBranchTarget(target.to_string()));
        };
        let sr = self.slice_expr(cond, SliceCtx::condition(BitRange::empty()))?;
        merge_live(&mut self.live, &sr.live);
        if self.addr_succ != Some(addr.value) {
            // This path continues at the fall-through successor, so the
            // guard holds in its inverted sense.
            self.invert_condition = true;
        }
        Ok(sr)
    }

    fn transfer_goto(&mut self, target: &Expr) -> Result<SliceOutcome> {
        let sr = self.slice_expr(target, SliceCtx::condition(target.range()))?;
        merge_live(&mut self.live, &sr.live);
        if self.jump_table_format.is_none() {
            self.jump_table_format = Some(target.clone());
        }
        Ok(sr)
    }

    /// Backward transfer over one expression tree.
    pub(crate) fn slice_expr(&mut self, expr: &Expr, ctx: SliceCtx) -> Result<SliceOutcome> {
        match expr {
            Expr::Id(_) => {
                let mut live = LiveMap::default();
                live.insert(expr.clone(), ctx);
                Ok(SliceOutcome {
                    live,
                    src: Some(expr.clone()),
                    stop: false,
                })
            }
            Expr::Const(_) | Expr::Addr(_) | Expr::Apply { .. } => Ok(SliceOutcome {
                live: LiveMap::default(),
                src: Some(expr.clone()),
                stop: false,
            }),
            Expr::Mem { ea, bits } => {
                let ea_ctx = ctx.with_bits(BitRange::new(0, ea.bits().min(BitRange::MAX_BITS)));
                let sr = self.slice_expr(ea, ea_ctx)?;
                let mut live = sr.live;
                // The access itself is live: the table read feeds the target.
                insert_live(&mut live, expr.clone(), ctx);
                let src = sr
                    .src
                    .map(|ea| Expr::mem(ea, *bits))
                    .or_else(|| Some(expr.clone()));
                Ok(SliceOutcome {
                    live,
                    src,
                    stop: sr.stop,
                })
            }
            Expr::SegMem { seg, ea, bits } => {
                let ea_ctx = ctx.with_bits(BitRange::new(0, ea.bits().min(BitRange::MAX_BITS)));
                let sr = self.slice_expr(ea, ea_ctx)?;
                let src = sr
                    .src
                    .map(|ea| Expr::seg_mem((**seg).clone(), ea, *bits))
                    .or_else(|| Some(expr.clone()));
                Ok(SliceOutcome {
                    live: sr.live,
                    src,
                    stop: sr.stop,
                })
            }
            Expr::Cast { bits, expr: inner } => {
                let sr =
                    self.slice_expr(inner, ctx.with_bits(BitRange::new(0, (*bits).min(BitRange::MAX_BITS))))?;
                let src = sr.src.map(|e| Expr::cast(*bits, e));
                Ok(SliceOutcome {
                    live: sr.live,
                    src,
                    stop: sr.stop,
                })
            }
            Expr::BitSlice {
                expr: inner,
                offset,
                bits,
            } => {
                let window = BitRange::new(*offset, (*offset + *bits).min(BitRange::MAX_BITS));
                let sr = self.slice_expr(inner, ctx.with_bits(window))?;
                let src = sr.src.map(|e| Expr::slice(e, *offset, *bits));
                Ok(SliceOutcome {
                    live: sr.live,
                    src,
                    stop: sr.stop,
                })
            }
            Expr::Seq { head, tail, bits } => {
                let h = self.slice_expr(head, ctx)?;
                let t = self.slice_expr(tail, ctx)?;
                let mut live = h.live;
                merge_live(&mut live, &t.live);
                let src = match (h.src, t.src) {
                    (Some(hs), Some(ts)) => Some(Expr::Seq {
                        head: Box::new(hs),
                        tail: Box::new(ts),
                        bits: *bits,
                    }),
                    _ => Some(expr.clone()),
                };
                Ok(SliceOutcome {
                    live,
                    src,
                    stop: h.stop || t.stop,
                })
            }
            Expr::Deposit {
                host,
                inserted,
                pos,
            } => {
                let h = self.slice_expr(host, ctx)?;
                let i = self.slice_expr(inserted, ctx)?;
                let mut live = h.live;
                merge_live(&mut live, &i.live);
                let stop = h.stop || i.stop;
                // When the caller only reads the bits being deposited, the
                // host is irrelevant.
                if inserted.range() == ctx.bits {
                    let src = i.src.or_else(|| Some((**inserted).clone()));
                    return Ok(SliceOutcome { live, src, stop });
                }
                let src = match (h.src, i.src) {
                    (Some(hs), Some(is)) => Some(Expr::deposit(hs, is, *pos)),
                    _ => Some(expr.clone()),
                };
                Ok(SliceOutcome { live, src, stop })
            }
            Expr::ConditionOf(inner) => {
                let sr = self.slice_expr(inner, SliceCtx::condition(inner.range()))?;
                if !sr.stop {
                    self.jump_table_index = Some((**inner).clone());
                    self.jump_table_index_to_use = Some((**inner).clone());
                }
                Ok(SliceOutcome {
                    live: sr.live,
                    src: Some(expr.clone()),
                    stop: sr.stop,
                })
            }
            Expr::TestCondition { cc, expr: inner } => {
                let sr = self.slice_expr(inner, SliceCtx::condition(inner.range()))?;
                self.cc_next = Some(*cc);
                self.jump_table_index = Some((**inner).clone());
                Ok(SliceOutcome {
                    live: sr.live,
                    src: Some(expr.clone()),
                    stop: sr.stop,
                })
            }
            Expr::Binary {
                op,
                bits,
                left,
                right,
            } => self.slice_binary(expr, *op, *bits, left, right, ctx),
            Expr::Unary { op, expr: inner } => {
                let sr = self.slice_expr(inner, ctx)?;
                let src = sr.src.map(|e| Expr::Unary {
                    op: *op,
                    expr: Box::new(e),
                });
                Ok(SliceOutcome {
                    live: sr.live,
                    src,
                    stop: sr.stop,
                })
            }
            Expr::Deref(_) => Err(Error::UnsupportedExpr(expr.to_string())),
        }
    }

    fn slice_binary(
        &mut self,
        whole: &Expr,
        op: BinOp,
        bits: u32,
        left: &Expr,
        right: &Expr,
        ctx: SliceCtx,
    ) -> Result<SliceOutcome> {
        // XOR r,r (or SUB r,r) zeroes a register. Applied to the high byte
        // of a live wider register this is the 8086 idiom for clearing
        // bits [8,16): only the low byte of the killed register remains
        // significant.
        if matches!(op, BinOp::Xor | BinOp::Sub) && left == right {
            if let (Some(op_id), Some(lhs)) = (left.as_identifier(), self.assign_lhs.clone()) {
                if let Some(lhs_id) = lhs.as_identifier() {
                    if op_id.storage.domain == lhs_id.storage.domain
                        && op_id.storage.bit_offset == 8
                    {
                        let full = lhs_id.storage.bits;
                        let src = Expr::cast(full, Expr::cast(8, lhs.clone()));
                        let mut live = LiveMap::default();
                        insert_live(
                            &mut live,
                            lhs.clone(),
                            SliceCtx::jump_table(BitRange::new(0, 8)),
                        );
                        trace!(reg = %lhs_id, "high-byte clear keeps low byte live");
                        return Ok(SliceOutcome {
                            live,
                            src: Some(src),
                            stop: false,
                        });
                    }
                }
            }
        }

        // A masked index bounds the jump table directly.
        if op == BinOp::And {
            if let Expr::Const(k) = right {
                let interval = StridedInterval::mask(k.as_i64());
                debug!(index = %left, interval = %interval, "index bounded by mask");
                self.jump_table_index = Some(left.clone());
                self.jump_table_index_to_use = Some(left.clone());
                self.jump_table_index_interval = interval;
                return Ok(SliceOutcome {
                    live: LiveMap::default(),
                    src: Some(whole.clone()),
                    stop: true,
                });
            }
        }

        let l = self.slice_expr(left, ctx)?;
        let r = self.slice_expr(right, ctx)?;

        // A subtraction against a constant under a pending flag test is
        // how compares reach RTL; if the subtrahend aliases a register the
        // walk still tracks, this is the comparison that bounds the index.
        // Without a pending condition code the subtraction is ordinary
        // address arithmetic.
        if op == BinOp::Sub {
            if let (Expr::Const(k), Some(cc)) = (right, self.cc_next) {
                if let Some(found) = self.find_live_alias(left) {
                    let guards_pending = match (&self.assign_lhs, &self.jump_table_index) {
                        (Some(a), Some(j)) => a == j,
                        _ => false,
                    };
                    if guards_pending || found == *left {
                        let interval = self.interval_from_comparison(cc, k)?;
                        debug!(index = %found, interval = %interval, "index bounded by comparison");
                        self.jump_table_index = Some(found);
                        self.jump_table_index_to_use = Some(left.clone());
                        self.jump_table_index_interval = interval;
                        let mut live = l.live;
                        merge_live(&mut live, &r.live);
                        return Ok(SliceOutcome {
                            live,
                            src: Some(whole.clone()),
                            stop: true,
                        });
                    }
                }
            }
        }

        let mut live = l.live;
        merge_live(&mut live, &r.live);
        let src = match (l.src, r.src) {
            (Some(ls), Some(rs)) => Some(Expr::Binary {
                op,
                bits,
                left: Box::new(ls),
                right: Box::new(rs),
            }),
            _ => Some(whole.clone()),
        };
        Ok(SliceOutcome {
            live,
            src,
            stop: l.stop || r.stop,
        })
    }

    /// The first live identifier aliasing the same domain as `e`.
    fn find_live_alias(&self, e: &Expr) -> Option<Expr> {
        let id = e.as_identifier()?;
        self.live
            .keys()
            .find(|k| {
                matches!(k.as_identifier(), Some(l) if l.storage.domain == id.storage.domain)
            })
            .cloned()
    }

    /// Builds the index interval from the pending condition code and the
    /// branch direction this path reconstructed.
    fn interval_from_comparison(&self, cc: CondCode, k: &Constant) -> Result<StridedInterval> {
        let cc = if self.invert_condition { cc.invert() } else { cc };
        match cc {
            CondCode::Ule => Ok(StridedInterval::ule(k.as_i64())),
            CondCode::Uge => Ok(StridedInterval::uge(k.as_i64())),
            other => Err(Error::UnsupportedCondition(other)),
        }
    }
}

/// The expression to write into the jump-table format in place of the
/// killed register `lhs` after `dst := vsrc`.
fn substitution(dst: &Identifier, lhs: &Identifier, vsrc: Expr) -> Expr {
    let written = dst.storage.bit_range();
    let window = lhs.storage.bit_range();
    if !written.overlaps(&window) {
        // The write does not touch these bits at all.
        return Expr::Id(lhs.clone());
    }
    if vsrc.bits() == lhs.storage.bits {
        // The transfer already rebuilt a full-width value.
        return vsrc;
    }
    if written.begin <= window.begin && window.end <= written.end {
        if written == window {
            vsrc
        } else {
            Expr::slice(vsrc, window.begin - written.begin, lhs.storage.bits)
        }
    } else {
        Expr::deposit(
            Expr::Id(lhs.clone()),
            vsrc,
            written.begin.saturating_sub(window.begin),
        )
    }
}

/// Shifts a range from identifier coordinates into domain coordinates.
fn shift_range(r: BitRange, offset: u32) -> BitRange {
    BitRange::new(r.begin + offset, r.end + offset)
}

/// Shifts a range from domain coordinates back into identifier
/// coordinates.
fn unshift_range(r: BitRange, offset: u32) -> BitRange {
    BitRange::new(r.begin - offset, r.end - offset)
}

/// The part of a live window an overlapping write leaves intact, if any.
fn residual(live: BitRange, written: BitRange) -> Option<BitRange> {
    if live.is_empty() {
        return None;
    }
    if !live.overlaps(&written) {
        return Some(live);
    }
    let lo = (written.begin > live.begin).then(|| BitRange::new(live.begin, written.begin));
    let hi = (written.end < live.end).then(|| BitRange::new(written.end, live.end));
    match (lo, hi) {
        (Some(a), Some(b)) => Some(a.union(&b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
