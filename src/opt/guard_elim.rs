//! Proof-based guard elimination.
//!
//! Runs after value numbering, code motion, and guard hoisting, when
//! duplicates can be proven without resetting knowledge at the loop
//! header. Phase A computes a "provably numeric" set and re-deduplicates
//! guards against it; phase B pre-marks dispensable store-stack nodes so
//! the following DCE sweep can drop them. Stack writes inside the body are
//! only needed before calls that may read the stack, or when the loop
//! reloads the slot on its next iteration; snapshots reconstruct
//! everything else at a side exit.

use super::Bitset;
use crate::ir::{Imm, IrBuffer, IrOp, IrRef, IrType, FLAG_DEAD, NONE};

/// True when the value written by a store is always a boxed number.
fn written_value_is_numeric(buf: &IrBuffer, val: IrRef) -> bool {
    if val == NONE || (val as usize) >= buf.len() {
        return false;
    }
    let v = buf.node(val);
    v.ty == IrType::Num
        || v.ty == IrType::Int
        || v.op == IrOp::BoxNum
        || v.op == IrOp::BoxInt
        || v.op == IrOp::ConstNum
}

fn phase_a(buf: &mut IrBuffer) {
    let len = buf.len();
    let mut guarded_num = Bitset::new(len);
    let mut guarded_true = Bitset::new(len);
    let mut guarded_false = Bitset::new(len);

    // Loads whose every matching store writes a numeric value are numeric
    // at all times; so is a load of a location with no stores at all, whose
    // value never changes from the one the first guard checked.
    let mut proven_load = Bitset::new(len);
    for i in 0..len as IrRef {
        let n = buf.node(i);
        if n.is_dead() {
            continue;
        }
        match (n.op, n.imm) {
            (IrOp::LoadModuleVar, Imm::ModuleVar(var)) => {
                let all_numeric = buf.nodes().iter().all(|s| {
                    s.is_dead()
                        || s.op != IrOp::StoreModuleVar
                        || s.imm != Imm::ModuleVar(var)
                        || written_value_is_numeric(buf, s.op1)
                });
                if all_numeric {
                    proven_load.set(i);
                }
            }
            (IrOp::LoadStack, Imm::Slot(slot)) => {
                let all_numeric = buf.nodes().iter().all(|s| {
                    s.is_dead()
                        || s.op != IrOp::StoreStack
                        || s.imm != Imm::Slot(slot)
                        || written_value_is_numeric(buf, s.op1)
                });
                if all_numeric {
                    proven_load.set(i);
                }
            }
            _ => {}
        }
    }

    // Arithmetic results and constants cannot be non-numbers.
    for i in 0..len as IrRef {
        let n = buf.node(i);
        if n.is_dead() {
            continue;
        }
        let numeric = match n.op {
            IrOp::Add
            | IrOp::Sub
            | IrOp::Mul
            | IrOp::Div
            | IrOp::Mod
            | IrOp::Neg
            | IrOp::ConstNum
            | IrOp::UnboxNum
            | IrOp::UnboxInt => true,
            _ => n.ty == IrType::Num || n.ty == IrType::Int,
        };
        if numeric || proven_load.test(i) {
            guarded_num.set(i);
        }
    }

    // Walk without resetting at the loop header.
    for i in 0..len as IrRef {
        let n = *buf.node(i);
        if n.is_dead() || n.op1 == NONE {
            continue;
        }
        let val = n.op1;
        match n.op {
            IrOp::GuardNum => {
                if guarded_num.test(val) {
                    buf.kill(i);
                } else {
                    guarded_num.set(val);
                }
            }
            IrOp::GuardTrue => {
                if guarded_true.test(val) {
                    buf.kill(i);
                } else {
                    guarded_true.set(val);
                }
            }
            IrOp::GuardFalse => {
                if guarded_false.test(val) {
                    buf.kill(i);
                } else {
                    guarded_false.set(val);
                }
            }
            _ => {}
        }
    }
}

fn phase_b(buf: &mut IrBuffer) {
    let header = buf.loop_header();
    let back = buf.loop_back();

    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.is_dead() || n.op != IrOp::StoreStack {
            continue;
        }
        let slot = match n.imm {
            Imm::Slot(s) => s,
            _ => continue,
        };

        // The loop re-reads this slot next iteration; the store must stay
        // or the reload would see a stale value.
        if let (Some(h), Some(b)) = (header, back) {
            let reloaded = (h..=b).any(|k| {
                let m = buf.node(k);
                !m.is_dead() && m.op == IrOp::LoadStack && m.imm == Imm::Slot(slot)
            });
            if reloaded {
                continue;
            }
        }

        // A call before the next snapshot boundary may read the stack.
        let mut needs_live_stack = false;
        for k in i + 1..buf.len() as IrRef {
            let m = buf.node(k);
            if m.is_dead() {
                continue;
            }
            match m.op {
                IrOp::CallNative | IrOp::CallMethod => {
                    needs_live_stack = true;
                    break;
                }
                IrOp::Snapshot | IrOp::SideExit | IrOp::LoopBack => break,
                _ => {}
            }
        }

        if !needs_live_stack {
            buf.node_mut(i).flags |= FLAG_DEAD;
        }
    }
}

/// Run both phases; intended to be followed by a DCE sweep.
pub fn prove_guard_elim(buf: &mut IrBuffer) {
    if buf.is_empty() {
        return;
    }
    phase_a(buf);
    phase_b(buf);
}
