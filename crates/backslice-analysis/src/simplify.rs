//! Pure expression rewriting.
//!
//! The slicer substitutes assignment sources into the evolving jump-table
//! format; this module folds what substitution produced. Identifiers and
//! memory reads are opaque, so the rewriter can only shrink the tree, never
//! invent symbolic values.

use backslice_core::{BinOp, Constant, Expr, UnOp};

/// Rewrites `expr` to a cheaper structurally equal-valued form.
pub fn simplify(expr: &Expr) -> Expr {
    match expr {
        Expr::Binary {
            op,
            bits,
            left,
            right,
        } => {
            let l = simplify(left);
            let r = simplify(right);
            simplify_binary(*op, *bits, l, r)
        }
        Expr::Unary { op, expr: inner } => {
            let e = simplify(inner);
            if let Expr::Const(c) = &e {
                let v = match op {
                    UnOp::Neg => c.value.wrapping_neg(),
                    UnOp::Not => !c.value,
                };
                return Expr::Const(Constant::new(mask(v, c.bits), c.bits));
            }
            Expr::Unary {
                op: *op,
                expr: Box::new(e),
            }
        }
        Expr::Cast { bits, expr: inner } => {
            let e = simplify(inner);
            simplify_cast(*bits, e)
        }
        Expr::BitSlice {
            expr: inner,
            offset,
            bits,
        } => {
            let e = simplify(inner);
            if let Expr::Const(c) = &e {
                let v = (c.value as u64 >> offset) as i64;
                return Expr::Const(Constant::new(mask(v, *bits), *bits));
            }
            if *offset == 0 && e.bits() == *bits {
                return e;
            }
            Expr::BitSlice {
                expr: Box::new(e),
                offset: *offset,
                bits: *bits,
            }
        }
        Expr::Deposit {
            host,
            inserted,
            pos,
        } => {
            let h = simplify(host);
            let i = simplify(inserted);
            simplify_deposit(h, i, *pos)
        }
        Expr::Mem { ea, bits } => Expr::Mem {
            ea: Box::new(simplify(ea)),
            bits: *bits,
        },
        Expr::SegMem { seg, ea, bits } => Expr::SegMem {
            seg: Box::new(simplify(seg)),
            ea: Box::new(simplify(ea)),
            bits: *bits,
        },
        Expr::Seq { head, tail, bits } => Expr::Seq {
            head: Box::new(simplify(head)),
            tail: Box::new(simplify(tail)),
            bits: *bits,
        },
        Expr::ConditionOf(inner) => Expr::ConditionOf(Box::new(simplify(inner))),
        Expr::TestCondition { cc, expr: inner } => Expr::TestCondition {
            cc: *cc,
            expr: Box::new(simplify(inner)),
        },
        Expr::Apply { func, args, bits } => Expr::Apply {
            func: Box::new(simplify(func)),
            args: args.iter().map(simplify).collect(),
            bits: *bits,
        },
        Expr::Id(_) | Expr::Const(_) | Expr::Addr(_) | Expr::Deref(_) => expr.clone(),
    }
}

fn simplify_binary(op: BinOp, bits: u32, l: Expr, r: Expr) -> Expr {
    if let (Expr::Const(a), Expr::Const(b)) = (&l, &r) {
        if let Some(v) = fold(op, a.value, b.value) {
            return Expr::Const(Constant::new(mask(v, bits), bits));
        }
    }
    // Canonicalize constants to the right for commutative operators so the
    // identity rules below see them.
    let (l, r) = if op.is_commutative() && l.as_constant().is_some() && r.as_constant().is_none() {
        (r, l)
    } else {
        (l, r)
    };
    if let Expr::Const(c) = &r {
        match (op, c.value) {
            (BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor, 0) => return l,
            (BinOp::Shl | BinOp::Shr | BinOp::Sar, 0) => return l,
            (BinOp::Mul, 1) => return l,
            (BinOp::Mul, 0) | (BinOp::And, 0) => {
                return Expr::Const(Constant::new(0, bits));
            }
            (BinOp::And, m) if bits < 64 && m == (1i64 << bits) - 1 => return l,
            _ => {}
        }
    }
    Expr::Binary {
        op,
        bits,
        left: Box::new(l),
        right: Box::new(r),
    }
}

fn fold(op: BinOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => {
            if (0..64).contains(&b) {
                ((a as u64) << b) as i64
            } else {
                return None;
            }
        }
        BinOp::Shr => {
            if (0..64).contains(&b) {
                ((a as u64) >> b) as i64
            } else {
                return None;
            }
        }
        BinOp::Sar => {
            if (0..64).contains(&b) {
                a >> b
            } else {
                return None;
            }
        }
    })
}

fn simplify_cast(bits: u32, e: Expr) -> Expr {
    if e.bits() == bits {
        return e;
    }
    if let Expr::Const(c) = &e {
        return Expr::Const(Constant::new(mask(c.value, bits), bits));
    }
    // A narrowing conversion of a conversion only keeps the low bits, so
    // the intermediate width is irrelevant.
    if let Expr::Cast {
        bits: inner_bits,
        expr: inner,
    } = &e
    {
        if bits <= inner.bits().min(*inner_bits) {
            return simplify_cast(bits, (**inner).clone());
        }
    }
    Expr::Cast {
        bits,
        expr: Box::new(e),
    }
}

fn simplify_deposit(host: Expr, inserted: Expr, pos: u32) -> Expr {
    let width = host.bits();
    // Inserting a value as wide as the host overwrites it entirely.
    if pos == 0 && inserted.bits() == width {
        return inserted;
    }
    // Inserting into the zero-extension of a value no wider than the
    // insert: every significant host bit is overwritten, leaving the
    // zero-extension of the inserted value.
    if pos == 0 {
        if let Expr::Cast { bits, expr: inner } = &host {
            if *bits == width && inner.bits() <= inserted.bits() {
                return simplify_cast(width, inserted);
            }
        }
    }
    Expr::Deposit {
        host: Box::new(host),
        inserted: Box::new(inserted),
        pos,
    }
}

fn mask(v: i64, bits: u32) -> i64 {
    if bits >= 64 {
        v
    } else {
        v & ((1i64 << bits) - 1)
    }
}

/// Replaces every occurrence of `needle` (by structural equality) in
/// `expr` with `replacement`. Occurrences inside the replacement itself
/// are not revisited.
pub fn replace(needle: &Expr, replacement: &Expr, expr: &Expr) -> Expr {
    if expr == needle {
        return replacement.clone();
    }
    let go = |e: &Expr| replace(needle, replacement, e);
    match expr {
        Expr::Binary {
            op,
            bits,
            left,
            right,
        } => Expr::Binary {
            op: *op,
            bits: *bits,
            left: Box::new(go(left)),
            right: Box::new(go(right)),
        },
        Expr::Unary { op, expr: inner } => Expr::Unary {
            op: *op,
            expr: Box::new(go(inner)),
        },
        Expr::Cast { bits, expr: inner } => Expr::Cast {
            bits: *bits,
            expr: Box::new(go(inner)),
        },
        Expr::BitSlice {
            expr: inner,
            offset,
            bits,
        } => Expr::BitSlice {
            expr: Box::new(go(inner)),
            offset: *offset,
            bits: *bits,
        },
        Expr::Deposit {
            host,
            inserted,
            pos,
        } => Expr::Deposit {
            host: Box::new(go(host)),
            inserted: Box::new(go(inserted)),
            pos: *pos,
        },
        Expr::Mem { ea, bits } => Expr::Mem {
            ea: Box::new(go(ea)),
            bits: *bits,
        },
        Expr::SegMem { seg, ea, bits } => Expr::SegMem {
            seg: Box::new(go(seg)),
            ea: Box::new(go(ea)),
            bits: *bits,
        },
        Expr::Seq { head, tail, bits } => Expr::Seq {
            head: Box::new(go(head)),
            tail: Box::new(go(tail)),
            bits: *bits,
        },
        Expr::ConditionOf(inner) => Expr::ConditionOf(Box::new(go(inner))),
        Expr::TestCondition { cc, expr: inner } => Expr::TestCondition {
            cc: *cc,
            expr: Box::new(go(inner)),
        },
        Expr::Apply { func, args, bits } => Expr::Apply {
            func: Box::new(go(func)),
            args: args.iter().map(go).collect(),
            bits: *bits,
        },
        Expr::Deref(inner) => Expr::Deref(Box::new(go(inner))),
        Expr::Id(_) | Expr::Const(_) | Expr::Addr(_) => expr.clone(),
    }
}
