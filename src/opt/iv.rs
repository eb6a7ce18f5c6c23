//! Integer induction-variable inference.
//!
//! Loop counters advance by constant integer steps; keeping them in
//! floating-point registers forces a box/unbox round trip on every
//! iteration. This pass finds integer add-recurrence PHIs, retypes them
//! and the arithmetic they feed, and rewrites the boxing conversions to
//! the integer variants so the code generator can stay on the GP path.
//!
//! All values involved are integers exactly representable in an f64
//! (|v| <= 2^52), so truncation never changes a result the FP pipeline
//! would have produced.

use crate::ir::{Imm, IrBuffer, IrOp, IrRef, IrType, NONE};

fn integer_const_num(buf: &IrBuffer, id: IrRef) -> bool {
    if id == NONE || (id as usize) >= buf.len() {
        return false;
    }
    let n = buf.node(id);
    match (n.op, n.imm) {
        (IrOp::ConstNum, Imm::Num(v)) => {
            v == (v as i64) as f64 && v.abs() <= (1i64 << 52) as f64
        }
        _ => false,
    }
}

fn int_type(buf: &IrBuffer, id: IrRef) -> bool {
    id != NONE && (id as usize) < buf.len() && buf.node(id).ty == IrType::Int
}

fn int_operand(buf: &IrBuffer, id: IrRef) -> bool {
    int_type(buf, id) || integer_const_num(buf, id)
}

/// True when `id` is an integer-valued expression over the candidate PHI:
/// the PHI itself, an integer constant or integer-typed node, or an
/// add/sub/mul chain of such expressions.
fn int_expr(buf: &IrBuffer, id: IrRef, phi: IrRef, depth: u32) -> bool {
    if id == NONE || (id as usize) >= buf.len() {
        return false;
    }
    if id == phi {
        return true;
    }
    if int_operand(buf, id) || buf.node(id).op == IrOp::ConstInt {
        return true;
    }
    if depth == 0 {
        return false;
    }
    let n = buf.node(id);
    matches!(n.op, IrOp::Add | IrOp::Sub | IrOp::Mul)
        && int_expr(buf, n.op1, phi, depth - 1)
        && int_expr(buf, n.op2, phi, depth - 1)
}

fn promote_const_to_int(buf: &mut IrBuffer, id: IrRef) {
    if integer_const_num(buf, id) {
        let n = buf.node_mut(id);
        if let Imm::Num(v) = n.imm {
            n.op = IrOp::ConstInt;
            n.ty = IrType::Int;
            n.imm = Imm::Int(v as i64);
        }
    }
}

/// Tag integer induction PHIs and propagate the integer type through the
/// arithmetic, conversions, and comparisons that consume them.
pub fn infer_induction_types(buf: &mut IrBuffer) {
    if buf.is_empty() || buf.loop_header().is_none() {
        return;
    }

    let mut changed = true;
    let mut iters = 0;
    while changed && iters < 8 {
        changed = false;
        iters += 1;

        // Tag PHI induction variables. The pre-loop value is an integer
        // constant, an integer-typed node, or the unboxed number the
        // promotion pass placed in the pre-header; the back-edge value is
        // an integer add/sub/mul recurrence over the PHI.
        for i in 0..buf.len() as IrRef {
            let phi = *buf.node(i);
            if phi.is_dead() || phi.op != IrOp::Phi || phi.ty == IrType::Int {
                continue;
            }
            if phi.op1 == NONE || phi.op2 == NONE {
                continue;
            }
            if (phi.op1 as usize) >= buf.len() || (phi.op2 as usize) >= buf.len() {
                continue;
            }
            let pre = buf.node(phi.op1);
            if !integer_const_num(buf, phi.op1)
                && pre.ty != IrType::Int
                && pre.ty != IrType::Num
            {
                continue;
            }
            let back = buf.node(phi.op2);
            if !matches!(back.op, IrOp::Add | IrOp::Sub | IrOp::Mul) {
                continue;
            }
            if int_expr(buf, phi.op2, i, 4) {
                buf.node_mut(i).ty = IrType::Int;
                changed = true;
            }
        }

        // Propagate through arithmetic whose operands are all integers.
        for i in 0..buf.len() as IrRef {
            let n = *buf.node(i);
            if n.is_dead() || n.ty == IrType::Int {
                continue;
            }
            if !matches!(n.op, IrOp::Add | IrOp::Sub | IrOp::Mul) {
                continue;
            }
            if n.op1 == NONE || n.op2 == NONE {
                continue;
            }
            if int_operand(buf, n.op1) && int_operand(buf, n.op2) {
                promote_const_to_int(buf, n.op1);
                promote_const_to_int(buf, n.op2);
                buf.node_mut(i).ty = IrType::Int;
                changed = true;
            }
        }
    }

    // Rewrite conversions attached to integer values.
    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.is_dead() {
            continue;
        }
        if n.op == IrOp::UnboxNum && int_type(buf, n.op1) {
            let m = buf.node_mut(i);
            m.op = IrOp::UnboxInt;
            m.ty = IrType::Int;
        }
        if n.op == IrOp::BoxNum && int_type(buf, n.op1) {
            buf.node_mut(i).op = IrOp::BoxInt;
        }
    }

    // The unbox feeding an integer PHI's pre-loop input converts to the
    // integer form as well.
    for i in 0..buf.len() as IrRef {
        let phi = *buf.node(i);
        if phi.is_dead() || phi.op != IrOp::Phi || phi.ty != IrType::Int {
            continue;
        }
        if phi.op1 == NONE || (phi.op1 as usize) >= buf.len() {
            continue;
        }
        let pre = *buf.node(phi.op1);
        if !pre.is_dead() && pre.op == IrOp::UnboxNum {
            let m = buf.node_mut(phi.op1);
            m.op = IrOp::UnboxInt;
            m.ty = IrType::Int;
        }
    }

    // Mark integer comparisons so the code generator selects the GP
    // compare path, promoting integer-valued constant operands on the way.
    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.is_dead() || !n.op.is_cmp() {
            continue;
        }
        if n.op1 == NONE || n.op2 == NONE {
            continue;
        }
        if (n.op1 as usize) >= buf.len() || (n.op2 as usize) >= buf.len() {
            continue;
        }
        if int_operand(buf, n.op1) && int_operand(buf, n.op2) {
            promote_const_to_int(buf, n.op1);
            promote_const_to_int(buf, n.op2);
            buf.node_mut(i).ty = IrType::Int;
        }
    }
}
