//! End-to-end slicing scenarios over small RTL graphs.
//!
//! Each test builds the RTL a 16-bit x86 rewriter would emit for a common
//! jump-table idiom, slices backward from the indirect jump, and checks
//! the recovered table format and index bound.

use backslice_analysis::{BackwardSlicer, Error, SliceCtx, UseKind};
use backslice_core::{
    registers, BitRange, BlockId, CondCode, Expr, RtlBlock, RtlGraph, Stmt, StridedInterval,
};

const STEP_BUDGET: usize = 64;

fn block(id: u32, address: u64, stmts: Vec<Stmt>) -> RtlBlock {
    let mut b = RtlBlock::new(BlockId::new(id), address);
    for s in stmts {
        b.push(s);
    }
    b
}

/// True if `needle` occurs anywhere inside `expr`.
fn contains(expr: &Expr, needle: &Expr) -> bool {
    if expr == needle {
        return true;
    }
    match expr {
        Expr::Binary { left, right, .. } => contains(left, needle) || contains(right, needle),
        Expr::Unary { expr, .. }
        | Expr::Cast { expr, .. }
        | Expr::BitSlice { expr, .. }
        | Expr::ConditionOf(expr)
        | Expr::TestCondition { expr, .. }
        | Expr::Deref(expr) => contains(expr, needle),
        Expr::Deposit { host, inserted, .. } => {
            contains(host, needle) || contains(inserted, needle)
        }
        Expr::Mem { ea, .. } => contains(ea, needle),
        Expr::SegMem { seg, ea, .. } => contains(seg, needle) || contains(ea, needle),
        Expr::Seq { head, tail, .. } => contains(head, needle) || contains(tail, needle),
        Expr::Apply { func, args, .. } => {
            contains(func, needle) || args.iter().any(|a| contains(a, needle))
        }
        Expr::Id(_) | Expr::Const(_) | Expr::Addr(_) => false,
    }
}

/// cx = mem16[bx + 2]; ax = cx & 7; jmp [ax*2 + 0x100]
#[test]
fn mask_bounded_switch() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::ax()), Expr::word16(2)),
        Expr::word16(0x100),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(
        0,
        0x1000,
        vec![
            Stmt::assign(
                Expr::id(registers::cx()),
                Expr::mem16(Expr::add(Expr::id(registers::bx()), Expr::word16(2))),
            ),
            Stmt::assign(
                Expr::id(registers::ax()),
                Expr::and(Expr::id(registers::cx()), Expr::word16(7)),
            ),
            Stmt::goto(target.clone()),
        ],
    ));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(0), 2, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    assert_eq!(slicer.jump_table_index(), Some(&Expr::id(registers::cx())));
    assert_eq!(
        slicer.jump_table_index_to_use(),
        Some(&Expr::id(registers::cx()))
    );
    assert_eq!(
        slicer.jump_table_index_interval(),
        StridedInterval::new(1, 0, 7)
    );

    let expected = Expr::mem16(Expr::add(
        Expr::mul(
            Expr::and(Expr::id(registers::cx()), Expr::word16(7)),
            Expr::word16(2),
        ),
        Expr::word16(0x100),
    ));
    assert_eq!(slicer.jump_table_format(), Some(&expected));
}

/// The assignment transfer must leave no trace of the overwritten
/// register in the recovered format.
#[test]
fn substitution_removes_assigned_register() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::ax()), Expr::word16(2)),
        Expr::word16(0x100),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(
        0,
        0x1000,
        vec![
            Stmt::assign(
                Expr::id(registers::ax()),
                Expr::and(Expr::id(registers::cx()), Expr::word16(7)),
            ),
            Stmt::goto(target.clone()),
        ],
    ));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(0), 1, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    let format = slicer.jump_table_format().unwrap();
    assert!(!contains(format, &Expr::id(registers::ax())));
    assert!(contains(format, &Expr::id(registers::cx())));
}

fn compare_guarded_graph(cc: CondCode, bound: i64, branch_target: u64) -> (RtlGraph, Expr) {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::dx()), Expr::word16(4)),
        Expr::word16(0x2000),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(
        0,
        0x1000,
        vec![
            Stmt::assign(
                Expr::id(registers::flags()),
                Expr::cond_of(Expr::sub(Expr::id(registers::dx()), Expr::word16(bound))),
            ),
            Stmt::branch(
                Expr::test(cc, Expr::id(registers::flags())),
                Expr::addr16(branch_target),
            ),
        ],
    ));
    g.add_block(block(1, 0x1100, vec![Stmt::goto(target.clone())]));
    g.add_edge(BlockId::new(0), BlockId::new(1));
    (g, target)
}

/// cmp dx, 5; jbe L; ... L: jmp [dx*4 + 0x2000] — the branch is taken
/// onto the jump, so the bound applies directly.
#[test]
fn compare_bounded_branch_taken() {
    let (g, target) = compare_guarded_graph(CondCode::Ule, 5, 0x1100);
    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(1), 0, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    assert_eq!(
        slicer.jump_table_index_interval(),
        StridedInterval::new(1, 0, 5)
    );
    assert_eq!(slicer.jump_table_index(), Some(&Expr::id(registers::dx())));
    assert_eq!(
        slicer.jump_table_index_to_use(),
        Some(&Expr::id(registers::dx()))
    );
}

/// cmp dx, 10; ja default; jmp [dx*4 + 0x2000] — the path falls through,
/// so the guard applies in its inverted (ule) sense.
#[test]
fn compare_bounded_fall_through() {
    let (g, target) = compare_guarded_graph(CondCode::Ugt, 10, 0x1200);
    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(1), 0, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    assert_eq!(
        slicer.jump_table_index_interval(),
        StridedInterval::new(1, 0, 10)
    );
}

/// A jae guard bounds the index from below.
#[test]
fn compare_bounded_from_below() {
    let (g, target) = compare_guarded_graph(CondCode::Uge, 4, 0x1100);
    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(1), 0, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    let iv = slicer.jump_table_index_interval();
    assert_eq!(iv.low(), 4);
    assert_eq!(iv.high(), i64::MAX);
}

/// A signed guard cannot bound an unsigned table index.
#[test]
fn signed_guard_is_fatal() {
    let (g, target) = compare_guarded_graph(CondCode::Le, 5, 0x1100);
    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(1), 0, &target).unwrap());
    let err = slicer.run(STEP_BUDGET).unwrap_err();
    assert!(matches!(err, Error::UnsupportedCondition(CondCode::Le)));
    // Partial results stay readable.
    assert!(slicer.jump_table_format().is_some());
}

/// xor bh, bh; mov bl, al; jmp [bx*2 + 0x2000] — the high-byte clear
/// narrows the tracked range to the low byte, and the index resolves to
/// the zero-extension of al.
#[test]
fn high_byte_clear() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::bx()), Expr::word16(2)),
        Expr::word16(0x2000),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(
        0,
        0x1000,
        vec![
            Stmt::assign(
                Expr::id(registers::bh()),
                Expr::xor(Expr::id(registers::bh()), Expr::id(registers::bh())),
            ),
            Stmt::assign(Expr::id(registers::bl()), Expr::id(registers::al())),
            Stmt::goto(target.clone()),
        ],
    ));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(0), 2, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    let expected = Expr::mem16(Expr::add(
        Expr::mul(
            Expr::cast(16, Expr::id(registers::al())),
            Expr::word16(2),
        ),
        Expr::word16(0x2000),
    ));
    assert_eq!(slicer.jump_table_format(), Some(&expected));

    let al_ctx = slicer.live()[&Expr::id(registers::al())];
    assert_eq!(al_ctx.kind, UseKind::JumpTable);
    assert_eq!(al_ctx.bits, BitRange::new(0, 8));
    let bx_ctx = slicer.live()[&Expr::id(registers::bx())];
    assert_eq!(bx_ctx.bits, BitRange::new(0, 8));
}

/// A literal jump target depends on no register; there is nothing to
/// slice.
#[test]
fn literal_target_does_not_start() {
    let mut g = RtlGraph::new();
    g.add_block(block(0, 0x1000, vec![Stmt::goto(Expr::addr16(0x3000))]));

    let mut slicer = BackwardSlicer::new(&g);
    let started = slicer
        .start(BlockId::new(0), 0, &Expr::addr16(0x3000))
        .unwrap();
    assert!(!started);
    assert!(slicer.live().is_empty());
    assert!(slicer.jump_table_format().is_none());
    assert!(slicer.jump_table_index().is_none());
    assert!(slicer.jump_table_index_to_use().is_none());
    assert!(slicer.jump_table_index_interval().is_empty());
}

/// A dereference on the sliced path aborts the walk; results recovered up
/// to that point stay readable.
#[test]
fn dereference_aborts_the_slice() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::si()), Expr::word16(2)),
        Expr::word16(0x100),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(
        0,
        0x1000,
        vec![
            Stmt::assign(
                Expr::id(registers::si()),
                Expr::deref(Expr::id(registers::di())),
            ),
            Stmt::goto(target.clone()),
        ],
    ));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(0), 1, &target).unwrap());
    let err = slicer.run(STEP_BUDGET).unwrap_err();
    assert!(matches!(err, Error::UnsupportedExpr(_)));
    assert_eq!(slicer.jump_table_format(), Some(&target));
}

/// Both predecessors of the jump block are walked, each exactly once.
#[test]
fn fans_out_to_every_predecessor() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::dx()), Expr::word16(4)),
        Expr::word16(0x2000),
    ));
    let mut g = RtlGraph::new();
    let guard = |bound: i64| {
        vec![
            Stmt::assign(
                Expr::id(registers::flags()),
                Expr::cond_of(Expr::sub(Expr::id(registers::dx()), Expr::word16(bound))),
            ),
            Stmt::branch(
                Expr::test(CondCode::Ule, Expr::id(registers::flags())),
                Expr::addr16(0x1100),
            ),
        ]
    };
    g.add_block(block(0, 0x1000, guard(5)));
    g.add_block(block(1, 0x1040, guard(7)));
    g.add_block(block(2, 0x1100, vec![Stmt::goto(target.clone())]));
    g.add_edge(BlockId::new(0), BlockId::new(2));
    g.add_edge(BlockId::new(1), BlockId::new(2));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(2), 0, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    // Both paths found a bound; the path walked last wins the snapshot.
    assert_eq!(
        slicer.jump_table_index_interval(),
        StridedInterval::new(1, 0, 7)
    );
}

/// The same program sliced twice recovers structurally equal results.
#[test]
fn slicing_is_deterministic() {
    let run_once = || {
        let (g, target) = compare_guarded_graph(CondCode::Ule, 5, 0x1100);
        let mut slicer = BackwardSlicer::new(&g);
        assert!(slicer.start(BlockId::new(1), 0, &target).unwrap());
        assert!(slicer.run(STEP_BUDGET).unwrap());
        (
            slicer.jump_table_format().cloned(),
            slicer.jump_table_index().cloned(),
            slicer.jump_table_index_interval(),
        )
    };
    assert_eq!(run_once(), run_once());
}

/// An exhausted step budget is not an error; partial results remain.
#[test]
fn step_budget_is_respected() {
    let (g, target) = compare_guarded_graph(CondCode::Ule, 5, 0x1100);
    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(1), 0, &target).unwrap());
    assert!(!slicer.run(1).unwrap());
    assert!(slicer.jump_table_format().is_some());
    assert!(slicer.jump_table_index_interval().is_empty());
}

/// Calls between the guard and the jump are treated as opaque and do not
/// disturb the tracked registers.
#[test]
fn calls_are_transparent() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::dx()), Expr::word16(4)),
        Expr::word16(0x2000),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(
        0,
        0x1000,
        vec![
            Stmt::assign(
                Expr::id(registers::flags()),
                Expr::cond_of(Expr::sub(Expr::id(registers::dx()), Expr::word16(3))),
            ),
            Stmt::branch(
                Expr::test(CondCode::Ule, Expr::id(registers::flags())),
                Expr::addr16(0x1100),
            ),
        ],
    ));
    g.add_block(block(
        1,
        0x1100,
        vec![Stmt::call(Expr::addr16(0x4000)), Stmt::goto(target.clone())],
    ));
    g.add_edge(BlockId::new(0), BlockId::new(1));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(1), 1, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());
    assert_eq!(
        slicer.jump_table_index_interval(),
        StridedInterval::new(1, 0, 3)
    );
}

/// The live map keeps jump-table contexts when the same expression is
/// also read by the branch that re-processes the jump.
#[test]
fn live_contexts_keep_the_jump_table_kind() {
    let target = Expr::mem16(Expr::add(
        Expr::mul(Expr::id(registers::dx()), Expr::word16(4)),
        Expr::word16(0x2000),
    ));
    let mut g = RtlGraph::new();
    g.add_block(block(0, 0x1000, vec![Stmt::goto(target.clone())]));

    let mut slicer = BackwardSlicer::new(&g);
    assert!(slicer.start(BlockId::new(0), 0, &target).unwrap());
    assert!(slicer.run(STEP_BUDGET).unwrap());

    let dx_ctx: SliceCtx = slicer.live()[&Expr::id(registers::dx())];
    assert_eq!(dx_ctx.kind, UseKind::JumpTable);
}
