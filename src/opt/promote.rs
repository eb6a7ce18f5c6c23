//! Loop-variable promotion.
//!
//! Runs before every other pass. A module variable that the loop body
//! loads, unboxes, recomputes, and stores back is a loop-carried value;
//! this pass materializes it as a PHI so the value circulates in a
//! register instead of round-tripping through memory and the box/unbox
//! pipeline. The recorder reserves no-op slots before the loop header for
//! exactly this purpose: each promoted variable takes three of them for
//! its load / unbox / PHI triple. Later passes then see a recurrence they
//! can type-infer into integer arithmetic.

use crate::ir::{Imm, IrBuffer, IrOp, IrRef, IrType, NONE};

/// Promote loop-carried module variables into pre-header PHIs.
pub fn promote_loop_vars(buf: &mut IrBuffer) {
    let (header, back) = match (buf.loop_header(), buf.loop_back()) {
        (Some(h), Some(b)) => (h, b),
        _ => return,
    };

    // A candidate is a module variable whose last in-loop store writes a
    // freshly boxed number computed inside the loop. That boxed value's
    // input is the back-edge value of the recurrence.
    let mut candidates: Vec<(u16, IrRef)> = Vec::new();
    for i in header + 1..back {
        let n = buf.node(i);
        if n.op != IrOp::StoreModuleVar || n.op1 == NONE {
            continue;
        }
        let var = match n.imm {
            Imm::ModuleVar(v) => v,
            _ => continue,
        };
        let boxed = buf.node(n.op1);
        if boxed.op != IrOp::BoxNum || boxed.op1 == NONE {
            continue;
        }
        let backedge = boxed.op1;
        if backedge <= header {
            continue;
        }
        match candidates.iter_mut().find(|(v, _)| *v == var) {
            Some(entry) => entry.1 = backedge, // later store wins
            None => candidates.push((var, backedge)),
        }
    }

    let mut next_free = 0;
    for (var, backedge) in candidates {
        // Already promoted on an earlier pipeline run.
        if buf.nodes().iter().any(|n| n.op == IrOp::Phi && n.op2 == backedge) {
            continue;
        }
        // Three consecutive free pre-header slots for load, unbox, phi.
        let mut slots = [NONE; 3];
        let mut found = 0;
        let mut j = next_free;
        while j < header && found < 3 {
            if buf.node(j).op == IrOp::Nop && !buf.node(j).is_dead() {
                slots[found as usize] = j;
                found += 1;
            }
            j += 1;
        }
        if found < 3 {
            return; // out of reserved slots
        }
        next_free = j;

        let [load_slot, unbox_slot, phi_slot] = slots;
        {
            let n = buf.node_mut(load_slot);
            n.op = IrOp::LoadModuleVar;
            n.ty = IrType::Value;
            n.imm = Imm::ModuleVar(var);
        }
        {
            let n = buf.node_mut(unbox_slot);
            n.op = IrOp::UnboxNum;
            n.ty = IrType::Num;
            n.op1 = load_slot;
        }
        {
            let n = buf.node_mut(phi_slot);
            n.op = IrOp::Phi;
            n.ty = IrType::Num;
            n.op1 = unbox_slot;
            n.op2 = backedge;
        }

        // Rewire every in-loop unbox of this variable's loads to the PHI.
        // The loads themselves stay; proof-based guard elimination and DCE
        // take care of them once their guards are gone.
        for i in header + 1..back {
            let u = *buf.node(i);
            if u.op != IrOp::UnboxNum || u.op1 == NONE || u.is_dead() {
                continue;
            }
            let src = buf.node(u.op1);
            if src.op == IrOp::LoadModuleVar && src.imm == Imm::ModuleVar(var) {
                buf.replace_uses(i, phi_slot);
                buf.kill(i);
            }
        }
    }
}
