//! Optimization pipeline over the trace IR.
//!
//! Each pass runs in place over the buffer and preserves the SSA and
//! snapshot-entry invariants. Passes run in a fixed canonical order;
//! reordering weakens results but must never break invariants. The two
//! guard-elimination passes are deliberately split: the early one resets
//! its knowledge at the loop header (prologue and iteration see different
//! dynamic values), the late one runs after hoisting and can prove
//! duplicates without any reset.

mod guard_elim;
mod iv;
mod promote;

pub use guard_elim::prove_guard_elim;
pub use iv::infer_induction_types;
pub use promote::promote_loop_vars;

use rustc_hash::FxHashSet as HashSet;

use crate::ir::{Imm, IrBuffer, IrOp, IrRef, IrType, FLAG_HOISTED, FLAG_INVARIANT, NONE};

/// Run the full pipeline in canonical order.
pub fn optimize(buf: &mut IrBuffer) {
    if buf.is_empty() {
        return;
    }
    promote_loop_vars(buf); // 1. loop-variable promotion into PHIs
    box_unbox_elim(buf); // 2. cancel box/unbox noise
    redundant_guard_elim(buf); // 3. duplicate guards, header-scoped
    const_prop_fold(buf); // 4. folding + algebraic identities
    gvn(buf); // 5. value numbering
    licm(buf); // 6. hoist loop-invariant work
    guard_hoist(buf); // 7. hoist pre-loop guards
    strength_reduce(buf); // 8. cheaper op forms
    bounds_check_elim(buf); // 9. dedupe IV bounds checks
    escape_analysis(buf); // 10. scalar replacement + store-load fwd
    dce(buf); // 11. sweep
    prove_guard_elim(buf); // 12. proof-based guard elimination
    infer_induction_types(buf); // 13. integer induction variables
    dce(buf); // 14. re-sweep
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Fixed-capacity bitset over SSA ids.
pub(crate) struct Bitset {
    words: Vec<u64>,
}

impl Bitset {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
        }
    }

    pub fn set(&mut self, id: IrRef) {
        self.words[id as usize >> 6] |= 1 << (id & 63);
    }

    pub fn test(&self, id: IrRef) -> bool {
        self.words[id as usize >> 6] & (1 << (id & 63)) != 0
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }
}

/// Per-node use counts across operands.
pub(crate) fn use_counts(buf: &IrBuffer) -> Vec<u16> {
    let mut counts = vec![0u16; buf.len()];
    for n in buf.nodes() {
        if n.op == IrOp::Nop {
            continue;
        }
        for op in n.operands() {
            if op != NONE && (op as usize) < buf.len() {
                counts[op as usize] += 1;
            }
        }
    }
    counts
}

/// SSA ids referenced by any snapshot entry.
pub(crate) fn snapshot_refs(buf: &IrBuffer) -> Bitset {
    let mut set = Bitset::new(buf.len());
    for entry in buf.entry_pool() {
        if entry.ssa != NONE && (entry.ssa as usize) < buf.len() {
            set.set(entry.ssa);
        }
    }
    set
}

// ---------------------------------------------------------------------------
// Pass: box/unbox elimination
// ---------------------------------------------------------------------------

/// Cancel adjacent box/unbox pairs, then bypass boxes whose every use is an
/// unbox (and which no snapshot references).
pub fn box_unbox_elim(buf: &mut IrBuffer) {
    // Phase 1: adjacent-pair cancellation.
    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.op1 == NONE {
            continue;
        }
        let src = *buf.node(n.op1);
        match n.op {
            IrOp::BoxNum if src.op == IrOp::UnboxNum => {
                buf.replace_uses(i, src.op1);
                buf.kill(i);
            }
            IrOp::UnboxNum if src.op == IrOp::BoxNum => {
                buf.replace_uses(i, src.op1);
                buf.kill(i);
            }
            IrOp::UnboxNum if src.op == IrOp::ConstNum => {
                buf.replace_uses(i, n.op1);
                buf.kill(i);
            }
            IrOp::BoxObj if src.op == IrOp::UnboxObj => {
                buf.replace_uses(i, src.op1);
                buf.kill(i);
            }
            IrOp::UnboxObj if src.op == IrOp::BoxObj => {
                buf.replace_uses(i, src.op1);
                buf.kill(i);
            }
            _ => {}
        }
    }

    // Phase 2: use-count based elimination for BoxNum.
    let counts = use_counts(buf);
    let mut unbox_counts = vec![0u16; buf.len()];
    for n in buf.nodes() {
        if n.op == IrOp::UnboxNum {
            for op in n.operands() {
                if op != NONE && (op as usize) < buf.len() {
                    unbox_counts[op as usize] += 1;
                }
            }
        }
    }
    let in_snapshot = snapshot_refs(buf);

    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.op != IrOp::BoxNum || n.op1 == NONE {
            continue;
        }
        if counts[i as usize] == 0 || in_snapshot.test(i) {
            continue;
        }
        if counts[i as usize] != unbox_counts[i as usize] {
            continue;
        }

        let raw = n.op1;
        for j in 0..buf.len() as IrRef {
            let u = *buf.node(j);
            if u.op != IrOp::UnboxNum || u.op1 != i {
                continue;
            }
            buf.replace_uses(j, raw);
            buf.kill(j);
        }
        buf.kill(i);
    }
}

// ---------------------------------------------------------------------------
// Pass: redundant guard elimination (header-scoped)
// ---------------------------------------------------------------------------

/// Kill repeat guards of the same kind on the same SSA id. Knowledge resets
/// at the loop header because guards in the prologue observe a different
/// dynamic value than guards inside the iteration.
pub fn redundant_guard_elim(buf: &mut IrBuffer) {
    let len = buf.len();
    let mut num = Bitset::new(len);
    let mut truthy = Bitset::new(len);
    let mut falsy = Bitset::new(len);
    let mut not_null = Bitset::new(len);
    let mut class: Vec<Option<u64>> = vec![None; len];

    for i in 0..len as IrRef {
        let n = *buf.node(i);
        if n.op == IrOp::LoopHeader {
            num.clear_all();
            truthy.clear_all();
            falsy.clear_all();
            not_null.clear_all();
            class.fill(None);
            continue;
        }
        if n.op == IrOp::Nop || n.op1 == NONE {
            continue;
        }
        let val = n.op1;
        match n.op {
            IrOp::GuardNum => {
                if num.test(val) {
                    buf.kill(i);
                } else {
                    num.set(val);
                }
            }
            IrOp::GuardTrue => {
                if truthy.test(val) {
                    buf.kill(i);
                } else {
                    truthy.set(val);
                }
            }
            IrOp::GuardFalse => {
                if falsy.test(val) {
                    buf.kill(i);
                } else {
                    falsy.set(val);
                }
            }
            IrOp::GuardNotNull => {
                if not_null.test(val) {
                    buf.kill(i);
                } else {
                    not_null.set(val);
                }
            }
            IrOp::GuardClass => {
                let expected = match n.imm {
                    Imm::Ptr(p) => p,
                    _ => continue,
                };
                if class[val as usize] == Some(expected) {
                    buf.kill(i);
                } else {
                    class[val as usize] = Some(expected);
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: constant propagation and folding
// ---------------------------------------------------------------------------

fn const_num(buf: &IrBuffer, id: IrRef) -> Option<f64> {
    if id == NONE {
        return None;
    }
    let n = buf.node(id);
    match (n.op, n.imm) {
        (IrOp::ConstNum, Imm::Num(v)) => Some(v),
        _ => None,
    }
}

fn const_int(buf: &IrBuffer, id: IrRef) -> Option<i64> {
    if id == NONE {
        return None;
    }
    let n = buf.node(id);
    match (n.op, n.imm) {
        (IrOp::ConstInt, Imm::Int(v)) => Some(v),
        _ => None,
    }
}

/// Collapse trivial PHIs, fold constant expressions, apply algebraic
/// identities, and kill guards that provably pass.
pub fn const_prop_fold(buf: &mut IrBuffer) {
    // PHI propagation.
    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.op != IrOp::Phi || n.op1 == NONE || n.op2 == NONE {
            continue;
        }
        if n.op1 == n.op2 {
            buf.replace_uses(i, n.op1);
            buf.kill(i);
            continue;
        }
        if let (Some(a), Some(b)) = (const_num(buf, n.op1), const_num(buf, n.op2)) {
            if a == b {
                buf.replace_uses(i, n.op1);
                buf.kill(i);
            }
        }
    }

    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);

        // Unary folds.
        if n.op == IrOp::Neg {
            if let Some(v) = const_num(buf, n.op1) {
                let m = buf.node_mut(i);
                m.op = IrOp::ConstNum;
                m.ty = IrType::Num;
                m.imm = Imm::Num(-v);
                m.op1 = NONE;
                continue;
            }
        }
        if n.op == IrOp::BitNot {
            if let Some(v) = const_int(buf, n.op1) {
                let m = buf.node_mut(i);
                m.op = IrOp::ConstInt;
                m.ty = IrType::Int;
                m.imm = Imm::Int(!v);
                m.op1 = NONE;
                continue;
            }
        }

        // Binary arithmetic folds and identities.
        if n.op.is_arith() && n.op1 != NONE && n.op2 != NONE {
            let a = const_num(buf, n.op1);
            let b = const_num(buf, n.op2);

            if let (Some(a), Some(b)) = (a, b) {
                let result = match n.op {
                    IrOp::Add => a + b,
                    IrOp::Sub => a - b,
                    IrOp::Mul => a * b,
                    IrOp::Div => a / b,
                    IrOp::Mod => a % b,
                    _ => unreachable!(),
                };
                let m = buf.node_mut(i);
                m.op = IrOp::ConstNum;
                m.ty = IrType::Num;
                m.imm = Imm::Num(result);
                m.op1 = NONE;
                m.op2 = NONE;
                continue;
            }

            // x + 0, x - 0, 0 + x
            if matches!(n.op, IrOp::Add | IrOp::Sub) {
                if b == Some(0.0) {
                    buf.replace_uses(i, n.op1);
                    buf.kill(i);
                    continue;
                }
                if n.op == IrOp::Add && a == Some(0.0) {
                    buf.replace_uses(i, n.op2);
                    buf.kill(i);
                    continue;
                }
            }

            // x * 1, 1 * x, x * 0, 0 * x
            if n.op == IrOp::Mul {
                if b == Some(1.0) {
                    buf.replace_uses(i, n.op1);
                    buf.kill(i);
                    continue;
                }
                if a == Some(1.0) {
                    buf.replace_uses(i, n.op2);
                    buf.kill(i);
                    continue;
                }
                if a == Some(0.0) || b == Some(0.0) {
                    let m = buf.node_mut(i);
                    m.op = IrOp::ConstNum;
                    m.ty = IrType::Num;
                    m.imm = Imm::Num(0.0);
                    m.op1 = NONE;
                    m.op2 = NONE;
                    continue;
                }
            }

            // x / 1
            if n.op == IrOp::Div && b == Some(1.0) {
                buf.replace_uses(i, n.op1);
                buf.kill(i);
                continue;
            }
        }

        // Comparison folds.
        if n.op.is_cmp() && n.op1 != NONE && n.op2 != NONE {
            if let (Some(a), Some(b)) = (const_num(buf, n.op1), const_num(buf, n.op2)) {
                let result = match n.op {
                    IrOp::Lt => a < b,
                    IrOp::Lte => a <= b,
                    IrOp::Gt => a > b,
                    IrOp::Gte => a >= b,
                    IrOp::Eq => a == b,
                    IrOp::Neq => a != b,
                    _ => unreachable!(),
                };
                let m = buf.node_mut(i);
                m.op = IrOp::ConstBool;
                m.ty = IrType::Bool;
                m.imm = Imm::Bool(result);
                m.op1 = NONE;
                m.op2 = NONE;
                continue;
            }
        }

        // Bitwise folds.
        if n.op.is_bitwise() && n.op1 != NONE && n.op2 != NONE {
            if let (Some(a), Some(b)) = (const_int(buf, n.op1), const_int(buf, n.op2)) {
                let result = match n.op {
                    IrOp::BitAnd => a & b,
                    IrOp::BitOr => a | b,
                    IrOp::BitXor => a ^ b,
                    IrOp::Shl => a.wrapping_shl(b as u32),
                    IrOp::Shr => a.wrapping_shr(b as u32),
                    _ => unreachable!(),
                };
                let m = buf.node_mut(i);
                m.op = IrOp::ConstInt;
                m.ty = IrType::Int;
                m.imm = Imm::Int(result);
                m.op1 = NONE;
                m.op2 = NONE;
                continue;
            }
        }

        // Guards that provably pass.
        if n.op == IrOp::GuardTrue && n.op1 != NONE {
            let a = *buf.node(n.op1);
            if a.op == IrOp::ConstBool && a.imm == Imm::Bool(true) {
                buf.kill(i);
                continue;
            }
        }
        if n.op == IrOp::GuardFalse && n.op1 != NONE {
            let a = *buf.node(n.op1);
            if a.op == IrOp::ConstBool && a.imm == Imm::Bool(false) {
                buf.kill(i);
                continue;
            }
        }
        if n.op == IrOp::GuardNum && n.op1 != NONE {
            let a = *buf.node(n.op1);
            if a.op.is_arith()
                || a.op == IrOp::Neg
                || a.op == IrOp::ConstNum
                || a.op == IrOp::ConstInt
                || a.op == IrOp::UnboxNum
            {
                buf.kill(i);
                continue;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: global value numbering
// ---------------------------------------------------------------------------

const GVN_TABLE_SIZE: usize = 8192; // >= 2x node cap
const GVN_TABLE_MASK: usize = GVN_TABLE_SIZE - 1;

fn imm_key(imm: Imm) -> (u8, u64) {
    match imm {
        Imm::None => (0, 0),
        Imm::Num(v) => (1, v.to_bits()),
        Imm::Bool(b) => (2, b as u64),
        Imm::Int(v) => (3, v as u64),
        Imm::Ptr(p) => (4, p),
        Imm::Snapshot(s) => (5, s as u64),
        Imm::Slot(s) => (6, s as u64),
        Imm::Field(f) => (7, f as u64),
        Imm::ModuleVar(v) => (8, v as u64),
    }
}

fn gvn_hash(buf: &IrBuffer, id: IrRef) -> usize {
    let n = buf.node(id);
    let (tag, bits) = imm_key(n.imm);
    let mut h = (n.op as u32).wrapping_mul(2_654_435_761);
    h ^= (n.ty as u32).wrapping_mul(2_246_822_519);
    h ^= (n.op1 as u32).wrapping_mul(3_266_489_917);
    h ^= (n.op2 as u32).wrapping_mul(668_265_263);
    h ^= (bits as u32).wrapping_mul(374_761_393);
    h ^= ((bits >> 32) as u32 ^ tag as u32).wrapping_mul(2_246_822_519);
    h as usize & GVN_TABLE_MASK
}

fn gvn_equal(buf: &IrBuffer, a: IrRef, b: IrRef) -> bool {
    let x = buf.node(a);
    let y = buf.node(b);
    x.op == y.op
        && x.ty == y.ty
        && x.op1 == y.op1
        && x.op2 == y.op2
        && imm_key(x.imm) == imm_key(y.imm)
}

/// Hash-based common subexpression elimination over pure nodes.
///
/// Loads of a location that is stored anywhere in the trace are excluded;
/// merging them across the store would change the loaded value.
pub fn gvn(buf: &mut IrBuffer) {
    let mut stored_slots: HashSet<u16> = HashSet::default();
    let mut stored_vars: HashSet<u16> = HashSet::default();
    for n in buf.nodes() {
        match (n.op, n.imm) {
            (IrOp::StoreStack, Imm::Slot(s)) => {
                stored_slots.insert(s);
            }
            (IrOp::StoreModuleVar, Imm::ModuleVar(v)) => {
                stored_vars.insert(v);
            }
            _ => {}
        }
    }

    let mut table = vec![NONE; GVN_TABLE_SIZE];

    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.op == IrOp::Nop || n.op.has_side_effect() || n.op == IrOp::Phi {
            continue;
        }
        match (n.op, n.imm) {
            (IrOp::LoadField, _) => continue,
            (IrOp::LoadStack, Imm::Slot(s)) if stored_slots.contains(&s) => continue,
            (IrOp::LoadModuleVar, Imm::ModuleVar(v)) if stored_vars.contains(&v) => continue,
            _ => {}
        }

        let h = gvn_hash(buf, i);
        for probe in 0..GVN_TABLE_SIZE {
            let idx = (h + probe) & GVN_TABLE_MASK;
            let existing = table[idx];
            if existing == NONE || buf.node(existing).op == IrOp::Nop {
                table[idx] = i;
                break;
            }
            if gvn_equal(buf, existing, i) {
                buf.replace_uses(i, existing);
                buf.kill(i);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: loop-invariant code motion
// ---------------------------------------------------------------------------

/// True when `slot` is written by any store-stack inside the loop body.
fn slot_stored_in_loop(buf: &IrBuffer, header: IrRef, back: IrRef, slot: u16) -> bool {
    (header..=back).any(|i| {
        let n = buf.node(i);
        n.op == IrOp::StoreStack && n.imm == Imm::Slot(slot)
    })
}

/// Hoist loop-invariant nodes into the pre-header no-op slots.
pub fn licm(buf: &mut IrBuffer) {
    let (header, back) = match (buf.loop_header(), buf.loop_back()) {
        (Some(h), Some(b)) => (h, b),
        _ => return,
    };

    // Fixed-point marking.
    let mut changed = true;
    while changed {
        changed = false;
        for i in header + 1..back {
            let n = *buf.node(i);
            if n.op == IrOp::Nop || n.op.has_side_effect() || n.op == IrOp::Phi {
                continue;
            }
            if n.flags & FLAG_INVARIANT != 0 {
                continue;
            }
            // A load of a slot that the loop writes must re-execute each
            // iteration.
            if n.op == IrOp::LoadStack {
                if let Imm::Slot(s) = n.imm {
                    if slot_stored_in_loop(buf, header, back, s) {
                        continue;
                    }
                }
            }

            let mut invariant = true;
            for op in n.operands() {
                if op == NONE || (op as usize) >= buf.len() {
                    continue;
                }
                if op >= header {
                    let o = buf.node(op);
                    if o.flags & FLAG_INVARIANT == 0 && !o.op.is_const() {
                        invariant = false;
                    }
                }
            }
            if invariant {
                buf.node_mut(i).flags |= FLAG_INVARIANT;
                changed = true;
            }
        }
    }

    // Move marked nodes into pre-header no-op slots.
    for i in header + 1..back {
        let n = *buf.node(i);
        if n.flags & FLAG_INVARIANT == 0 || n.flags & FLAG_HOISTED != 0 {
            continue;
        }
        // Every operand must already live before the header, or ordering
        // would break.
        let ready = n
            .operands()
            .iter()
            .all(|&op| op == NONE || op < header);
        if !ready {
            continue;
        }
        for j in 0..header {
            if buf.node(j).op == IrOp::Nop {
                let mut moved = n;
                moved.id = j;
                moved.flags |= FLAG_HOISTED;
                moved.flags &= !crate::ir::FLAG_DEAD;
                *buf.node_mut(j) = moved;
                buf.replace_uses(i, j);
                buf.kill(i);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: guard hoisting
// ---------------------------------------------------------------------------

/// Move guards whose operand is defined before the loop into pre-header
/// slots, so the check runs once instead of per iteration.
pub fn guard_hoist(buf: &mut IrBuffer) {
    let (header, back) = match (buf.loop_header(), buf.loop_back()) {
        (Some(h), Some(b)) => (h, b),
        _ => return,
    };

    for i in header + 1..back {
        let n = *buf.node(i);
        if !n.op.is_guard() || n.flags & FLAG_HOISTED != 0 {
            continue;
        }
        if n.op1 == NONE || n.op1 >= header {
            continue;
        }
        for j in 0..header {
            if buf.node(j).op == IrOp::Nop {
                let mut moved = n;
                moved.id = j;
                moved.flags |= FLAG_HOISTED;
                moved.flags &= !crate::ir::FLAG_DEAD;
                *buf.node_mut(j) = moved;
                buf.kill(i);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: strength reduction
// ---------------------------------------------------------------------------

/// Exponent of `v` when it is a positive power-of-two integer within
/// shifting range, else None.
fn pow2_exponent(v: f64) -> Option<u32> {
    if !(v > 0.0) || v > (1u64 << 30) as f64 {
        return None;
    }
    let iv = v as i64;
    if iv as f64 != v || iv == 0 || iv & (iv - 1) != 0 {
        return None;
    }
    Some(iv.trailing_zeros())
}

/// Replace expensive operations with cheaper forms: `x*2 → x+x`,
/// `x*(2^k) → x<<k` and `x mod 2^k → x & (2^k - 1)` for integer-typed
/// nodes, `x/c → x*(1/c)` for nonzero constant c.
pub fn strength_reduce(buf: &mut IrBuffer) {
    // Constant nodes are rewritten in place, so only singly-used constants
    // are eligible for the rewriting forms.
    let counts = use_counts(buf);

    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);

        if n.op == IrOp::Mul && n.op1 != NONE && n.op2 != NONE {
            if const_num(buf, n.op2) == Some(2.0) {
                let m = buf.node_mut(i);
                m.op = IrOp::Add;
                m.op2 = m.op1;
                continue;
            }
            if const_num(buf, n.op1) == Some(2.0) {
                let m = buf.node_mut(i);
                m.op = IrOp::Add;
                m.op1 = m.op2;
                continue;
            }
            if n.ty == IrType::Int && counts[n.op2 as usize] == 1 {
                if let Some(shift) = const_num(buf, n.op2).and_then(pow2_exponent) {
                    if shift > 0 {
                        let rhs = buf.node_mut(n.op2);
                        rhs.op = IrOp::ConstInt;
                        rhs.ty = IrType::Int;
                        rhs.imm = Imm::Int(shift as i64);
                        let m = buf.node_mut(i);
                        m.op = IrOp::Shl;
                        m.ty = IrType::Int;
                        continue;
                    }
                }
            }
        }

        if n.op == IrOp::Div && n.op2 != NONE && counts[n.op2 as usize] == 1 {
            if let Some(c) = const_num(buf, n.op2) {
                if c != 0.0 {
                    buf.node_mut(n.op2).imm = Imm::Num(1.0 / c);
                    buf.node_mut(i).op = IrOp::Mul;
                    continue;
                }
            }
        }

        if n.op == IrOp::Mod
            && n.ty == IrType::Int
            && n.op2 != NONE
            && counts[n.op2 as usize] == 1
        {
            if let Some(shift) = const_num(buf, n.op2).and_then(pow2_exponent) {
                let mask = (1i64 << shift) - 1;
                let rhs = buf.node_mut(n.op2);
                rhs.op = IrOp::ConstInt;
                rhs.ty = IrType::Int;
                rhs.imm = Imm::Int(mask);
                let m = buf.node_mut(i);
                m.op = IrOp::BitAnd;
                m.ty = IrType::Int;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: bounds-check deduplication
// ---------------------------------------------------------------------------

/// Dedupe `guard-true(lt(iv, bound))` checks for induction PHIs against
/// loop-invariant bounds.
pub fn bounds_check_elim(buf: &mut IrBuffer) {
    let (header, back) = match (buf.loop_header(), buf.loop_back()) {
        (Some(h), Some(b)) => (h, b),
        _ => return,
    };

    // Positive-step add-recurrence PHIs.
    let mut ivs: Vec<IrRef> = Vec::new();
    for i in 0..buf.len() as IrRef {
        let n = buf.node(i);
        if n.op != IrOp::Phi || n.op1 == NONE || n.op2 == NONE {
            continue;
        }
        if (n.op2 as usize) >= buf.len() {
            continue;
        }
        let next = buf.node(n.op2);
        if next.op != IrOp::Add {
            continue;
        }
        let step_id = if next.op1 == i {
            next.op2
        } else if next.op2 == i {
            next.op1
        } else {
            continue;
        };
        let positive = match const_num(buf, step_id) {
            Some(s) => s > 0.0,
            None => const_int(buf, step_id).is_some_and(|s| s > 0),
        };
        if positive {
            ivs.push(i);
        }
    }
    if ivs.is_empty() {
        return;
    }

    let mut seen: HashSet<(IrRef, IrRef)> = HashSet::default();
    for i in header + 1..back {
        let n = *buf.node(i);
        if n.op != IrOp::GuardTrue || n.op1 == NONE {
            continue;
        }
        let cmp = *buf.node(n.op1);
        if cmp.op != IrOp::Lt || cmp.op1 == NONE || cmp.op2 == NONE {
            continue;
        }
        if !ivs.contains(&cmp.op1) {
            continue;
        }
        // The bound must be loop-invariant.
        if cmp.op2 >= header {
            continue;
        }
        if !seen.insert((cmp.op1, cmp.op2)) {
            buf.kill(i);
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: escape analysis
// ---------------------------------------------------------------------------

/// True when `id` is used by anything other than a field load of itself,
/// or appears in a snapshot entry.
fn escapes(buf: &IrBuffer, id: IrRef) -> bool {
    for n in buf.nodes() {
        if n.op == IrOp::Nop {
            continue;
        }
        let uses = n.operands().contains(&id);
        if !uses {
            continue;
        }
        if n.op == IrOp::LoadField && n.op1 == id {
            continue;
        }
        return true;
    }
    buf.entry_pool().iter().any(|e| e.ssa == id)
}

/// (A) Scalar-replace non-escaping allocations whose fields are only read;
/// (B) forward stored field values to later loads of the same field.
pub fn escape_analysis(buf: &mut IrBuffer) {
    // (A) Scalar replacement for native-call allocations.
    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.op != IrOp::CallNative || n.ty != IrType::Ptr {
            continue;
        }
        if n.op1 == NONE || n.op2 == NONE {
            continue;
        }
        if escapes(buf, i) {
            continue;
        }

        for j in 0..buf.len() as IrRef {
            let u = *buf.node(j);
            if u.op != IrOp::LoadField || u.op1 != i {
                continue;
            }
            let replacement = match u.field() {
                Some(0) => n.op1,
                Some(1) => n.op2,
                _ => NONE,
            };
            if replacement != NONE {
                buf.replace_uses(j, replacement);
                buf.kill(j);
            }
        }

        let still_used = buf
            .nodes()
            .iter()
            .any(|u| u.op != IrOp::Nop && u.operands().contains(&i));
        if !still_used {
            buf.kill(i);
        }
    }

    // (B) Store-load forwarding.
    for i in 0..buf.len() as IrRef {
        let n = *buf.node(i);
        if n.op != IrOp::LoadField || n.op1 == NONE {
            continue;
        }
        let obj = n.op1;
        let field = n.field();

        for j in (0..i).rev() {
            let s = *buf.node(j);
            if s.is_dead() {
                continue;
            }
            if s.op == IrOp::StoreField && s.op1 == obj && s.field() == field {
                buf.replace_uses(i, s.op2);
                buf.kill(i);
                break;
            }
            if s.op == IrOp::CallNative || s.op == IrOp::CallMethod {
                break;
            }
            if s.op == IrOp::StoreField && s.op1 == obj {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass: dead code elimination
// ---------------------------------------------------------------------------

/// Mark-sweep from side-effect roots and snapshot entries; kill everything
/// unreachable.
pub fn dce(buf: &mut IrBuffer) {
    let len = buf.len();
    let mut live = Bitset::new(len);
    let mut worklist: Vec<IrRef> = Vec::with_capacity(len);

    for i in 0..len as IrRef {
        let n = buf.node(i);
        if n.op == IrOp::Nop {
            continue;
        }
        let is_root = match n.op {
            // Stores pre-marked dispensable by proof-based guard
            // elimination are not roots; the sweep removes them.
            IrOp::StoreStack => !n.is_dead(),
            IrOp::StoreField
            | IrOp::StoreModuleVar
            | IrOp::SideExit
            | IrOp::LoopBack
            | IrOp::LoopHeader
            | IrOp::CallNative
            | IrOp::CallMethod
            | IrOp::Snapshot
            | IrOp::Phi => true,
            op => op.is_guard(),
        };
        if is_root && !live.test(i) {
            live.set(i);
            worklist.push(i);
        }
    }

    for entry in buf.entry_pool() {
        if entry.ssa != NONE && (entry.ssa as usize) < len && !live.test(entry.ssa) {
            live.set(entry.ssa);
            worklist.push(entry.ssa);
        }
    }

    while let Some(id) = worklist.pop() {
        for op in buf.node(id).operands() {
            if op != NONE && (op as usize) < len && !live.test(op) {
                live.set(op);
                worklist.push(op);
            }
        }
    }

    for i in 0..len as IrRef {
        if buf.node(i).op != IrOp::Nop && !live.test(i) {
            buf.kill(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuffer, IrOp, IrType, NONE};

    fn num_pair(buf: &mut IrBuffer) -> (IrRef, IrRef) {
        let a = buf.emit_const_num(10.0).unwrap();
        let b = buf.emit_const_num(3.0).unwrap();
        (a, b)
    }

    #[test]
    fn test_box_unbox_adjacent_cancellation() {
        let mut buf = IrBuffer::new();
        let raw = buf.emit_const_num(1.5).unwrap();
        let boxed = buf.emit_box_num(raw).unwrap();
        let unboxed = buf.emit_unbox_num(boxed).unwrap();
        let add = buf.emit(IrOp::Add, unboxed, unboxed, IrType::Num).unwrap();
        let store = buf.emit_store_stack(0, add).unwrap();

        box_unbox_elim(&mut buf);

        // unbox(box(raw)) collapses to raw.
        assert!(buf.node(unboxed).is_dead());
        assert_eq!(buf.node(add).op1, raw);
        assert_eq!(buf.node(add).op2, raw);
        assert!(!buf.node(store).is_dead());
    }

    #[test]
    fn test_box_unbox_use_count_elimination() {
        let mut buf = IrBuffer::new();
        let raw = buf.emit(IrOp::Add, NONE, NONE, IrType::Num).unwrap();
        let boxed = buf.emit_box_num(raw).unwrap();
        let u1 = buf.emit_unbox_num(boxed).unwrap();
        let u2 = buf.emit_unbox_num(boxed).unwrap();
        let add = buf.emit(IrOp::Add, u1, u2, IrType::Num).unwrap();

        box_unbox_elim(&mut buf);

        assert!(buf.node(boxed).is_dead());
        assert!(buf.node(u1).is_dead());
        assert!(buf.node(u2).is_dead());
        assert_eq!(buf.node(add).op1, raw);
        assert_eq!(buf.node(add).op2, raw);
    }

    #[test]
    fn test_box_survives_snapshot_reference() {
        let mut buf = IrBuffer::new();
        let raw = buf.emit(IrOp::Add, NONE, NONE, IrType::Num).unwrap();
        let boxed = buf.emit_box_num(raw).unwrap();
        let _u = buf.emit_unbox_num(boxed).unwrap();
        let snap = buf.emit_snapshot(0, 1).unwrap();
        buf.snapshot_add_entry(snap, 0, boxed).unwrap();

        box_unbox_elim(&mut buf);

        // Referenced by a snapshot entry: the box must stay.
        assert!(!buf.node(boxed).is_dead());
    }

    #[test]
    fn test_redundant_guard_elim_dedupes() {
        let mut buf = IrBuffer::new();
        buf.emit_loop_header().unwrap();
        let v = buf.emit_load_stack(0).unwrap();
        let snap = buf.emit_snapshot(0, 1).unwrap();
        let g1 = buf.emit_guard_num(v, snap).unwrap();
        let g2 = buf.emit_guard_num(v, snap).unwrap();

        redundant_guard_elim(&mut buf);

        assert!(!buf.node(g1).is_dead());
        assert!(buf.node(g2).is_dead());
    }

    #[test]
    fn test_redundant_guard_elim_resets_at_header() {
        let mut buf = IrBuffer::new();
        let v = buf.emit_load_stack(0).unwrap();
        let snap = buf.emit_snapshot(0, 1).unwrap();
        let g1 = buf.emit_guard_num(v, snap).unwrap();
        buf.emit_loop_header().unwrap();
        let g2 = buf.emit_guard_num(v, snap).unwrap();

        redundant_guard_elim(&mut buf);

        // Knowledge resets at the header: the in-loop guard survives.
        assert!(!buf.node(g1).is_dead());
        assert!(!buf.node(g2).is_dead());
    }

    #[test]
    fn test_guard_class_dedupe_by_class() {
        let mut buf = IrBuffer::new();
        buf.emit_loop_header().unwrap();
        let v = buf.emit_load_stack(0).unwrap();
        let snap = buf.emit_snapshot(0, 1).unwrap();
        let g1 = buf.emit_guard_class(v, 0x10, snap).unwrap();
        let g2 = buf.emit_guard_class(v, 0x10, snap).unwrap();
        let g3 = buf.emit_guard_class(v, 0x20, snap).unwrap();

        redundant_guard_elim(&mut buf);

        assert!(!buf.node(g1).is_dead());
        assert!(buf.node(g2).is_dead());
        assert!(!buf.node(g3).is_dead()); // different class
    }

    #[test]
    fn test_const_fold_arithmetic() {
        let mut buf = IrBuffer::new();
        let (a, b) = num_pair(&mut buf);
        let add = buf.emit(IrOp::Add, a, b, IrType::Num).unwrap();
        let lt = buf.emit(IrOp::Lt, a, b, IrType::Bool).unwrap();

        const_prop_fold(&mut buf);

        assert_eq!(buf.node(add).op, IrOp::ConstNum);
        assert_eq!(buf.node(add).imm, Imm::Num(13.0));
        assert_eq!(buf.node(lt).op, IrOp::ConstBool);
        assert_eq!(buf.node(lt).imm, Imm::Bool(false));
    }

    #[test]
    fn test_const_fold_identities() {
        let mut buf = IrBuffer::new();
        let x = buf.emit_load_stack(0).unwrap();
        let zero = buf.emit_const_num(0.0).unwrap();
        let one = buf.emit_const_num(1.0).unwrap();
        let add0 = buf.emit(IrOp::Add, x, zero, IrType::Num).unwrap();
        let mul1 = buf.emit(IrOp::Mul, x, one, IrType::Num).unwrap();
        let mul0 = buf.emit(IrOp::Mul, x, zero, IrType::Num).unwrap();
        let sink = buf.emit(IrOp::Add, add0, mul1, IrType::Num).unwrap();

        const_prop_fold(&mut buf);

        assert!(buf.node(add0).is_dead());
        assert!(buf.node(mul1).is_dead());
        assert_eq!(buf.node(sink).op1, x);
        assert_eq!(buf.node(sink).op2, x);
        assert_eq!(buf.node(mul0).op, IrOp::ConstNum);
        assert_eq!(buf.node(mul0).imm, Imm::Num(0.0));
    }

    #[test]
    fn test_const_fold_phi_collapse() {
        let mut buf = IrBuffer::new();
        let x = buf.emit_load_stack(0).unwrap();
        let phi = buf.emit_phi(x, x, IrType::Num).unwrap();
        let use_phi = buf.emit(IrOp::Neg, phi, NONE, IrType::Num).unwrap();

        const_prop_fold(&mut buf);

        assert!(buf.node(phi).is_dead());
        assert_eq!(buf.node(use_phi).op1, x);
    }

    #[test]
    fn test_const_fold_kills_proven_guards() {
        let mut buf = IrBuffer::new();
        let t = buf.emit_const_bool(true).unwrap();
        let snap = buf.emit_snapshot(0, 0).unwrap();
        let g_true = buf.emit_guard_true(t, snap).unwrap();
        let n = buf.emit_const_num(4.0).unwrap();
        let g_num = buf.emit_guard_num(n, snap).unwrap();

        const_prop_fold(&mut buf);

        assert!(buf.node(g_true).is_dead());
        assert!(buf.node(g_num).is_dead());
    }

    #[test]
    fn test_gvn_merges_pure_duplicates() {
        let mut buf = IrBuffer::new();
        let (a, b) = num_pair(&mut buf);
        let x = buf.emit_load_stack(0).unwrap();
        let add1 = buf.emit(IrOp::Add, x, a, IrType::Num).unwrap();
        let add2 = buf.emit(IrOp::Add, x, a, IrType::Num).unwrap();
        let sink = buf.emit(IrOp::Mul, add1, add2, IrType::Num).unwrap();
        let _ = b;

        gvn(&mut buf);

        assert!(buf.node(add2).is_dead());
        assert_eq!(buf.node(sink).op1, add1);
        assert_eq!(buf.node(sink).op2, add1);
    }

    #[test]
    fn test_gvn_skips_loads_of_stored_slots() {
        let mut buf = IrBuffer::new();
        let l1 = buf.emit_load_stack(3).unwrap();
        let st = buf.emit_store_stack(3, l1).unwrap();
        let l2 = buf.emit_load_stack(3).unwrap();
        let _ = st;

        gvn(&mut buf);

        assert!(!buf.node(l2).is_dead());
    }

    #[test]
    fn test_gvn_keeps_side_effects() {
        let mut buf = IrBuffer::new();
        let v = buf.emit_load_stack(0).unwrap();
        let s1 = buf.emit_store_stack(1, v).unwrap();
        let s2 = buf.emit_store_stack(1, v).unwrap();

        gvn(&mut buf);

        assert!(!buf.node(s1).is_dead());
        assert!(!buf.node(s2).is_dead());
    }

    #[test]
    fn test_licm_hoists_invariant_work() {
        let mut buf = IrBuffer::new();
        for _ in 0..4 {
            buf.emit_nop().unwrap();
        }
        let pre = buf.emit_load_stack(0).unwrap();
        let header = buf.emit_loop_header().unwrap();
        let c = buf.emit_const_num(2.0).unwrap();
        let inv = buf.emit(IrOp::Mul, pre, c, IrType::Num).unwrap();
        let st = buf.emit_store_stack(1, inv).unwrap();
        buf.emit_loop_back().unwrap();

        licm(&mut buf);

        // Both the constant and the multiply moved before the header.
        let hoisted_mul = (0..header)
            .find(|&j| buf.node(j).op == IrOp::Mul)
            .expect("multiply hoisted");
        assert!(buf.node(inv).is_dead());
        assert_eq!(buf.node(st).op1, hoisted_mul);
        assert!((0..header).any(|j| buf.node(j).op == IrOp::ConstNum));
    }

    #[test]
    fn test_licm_respects_stored_slots() {
        let mut buf = IrBuffer::new();
        for _ in 0..4 {
            buf.emit_nop().unwrap();
        }
        buf.emit_loop_header().unwrap();
        let load = buf.emit_load_stack(0).unwrap();
        let st = buf.emit_store_stack(0, load).unwrap();
        buf.emit_loop_back().unwrap();
        let _ = st;

        licm(&mut buf);

        // Slot 0 is written in the loop; its load must not be hoisted.
        assert!(!buf.node(load).is_dead());
        assert_eq!(buf.node(load).op, IrOp::LoadStack);
    }

    #[test]
    fn test_guard_hoist_moves_preloop_guard() {
        let mut buf = IrBuffer::new();
        for _ in 0..2 {
            buf.emit_nop().unwrap();
        }
        let pre = buf.emit_load_stack(0).unwrap();
        let snap = buf.emit_snapshot(0, 1).unwrap();
        let header = buf.emit_loop_header().unwrap();
        let g = buf.emit_guard_num(pre, snap).unwrap();
        buf.emit_loop_back().unwrap();

        guard_hoist(&mut buf);

        assert!(buf.node(g).is_dead());
        let hoisted = (0..header).find(|&j| buf.node(j).op == IrOp::GuardNum);
        assert!(hoisted.is_some());
    }

    #[test]
    fn test_strength_reduce_mul_by_two() {
        let mut buf = IrBuffer::new();
        let x = buf.emit_load_stack(0).unwrap();
        let two = buf.emit_const_num(2.0).unwrap();
        let mul = buf.emit(IrOp::Mul, x, two, IrType::Num).unwrap();

        strength_reduce(&mut buf);

        assert_eq!(buf.node(mul).op, IrOp::Add);
        assert_eq!(buf.node(mul).op1, x);
        assert_eq!(buf.node(mul).op2, x);
    }

    #[test]
    fn test_strength_reduce_int_shift_and_mask() {
        let mut buf = IrBuffer::new();
        let x = buf.emit(IrOp::Add, NONE, NONE, IrType::Int).unwrap();
        let eight = buf.emit_const_num(8.0).unwrap();
        let mul = buf.emit(IrOp::Mul, x, eight, IrType::Int).unwrap();
        let sixteen = buf.emit_const_num(16.0).unwrap();
        let modulo = buf.emit(IrOp::Mod, x, sixteen, IrType::Int).unwrap();

        strength_reduce(&mut buf);

        assert_eq!(buf.node(mul).op, IrOp::Shl);
        assert_eq!(buf.node(eight).imm, Imm::Int(3));
        assert_eq!(buf.node(modulo).op, IrOp::BitAnd);
        assert_eq!(buf.node(sixteen).imm, Imm::Int(15));
    }

    #[test]
    fn test_strength_reduce_div_to_reciprocal() {
        let mut buf = IrBuffer::new();
        let x = buf.emit_load_stack(0).unwrap();
        let four = buf.emit_const_num(4.0).unwrap();
        let div = buf.emit(IrOp::Div, x, four, IrType::Num).unwrap();

        strength_reduce(&mut buf);

        assert_eq!(buf.node(div).op, IrOp::Mul);
        assert_eq!(buf.node(four).imm, Imm::Num(0.25));
    }

    #[test]
    fn test_strength_reduce_keeps_shared_constants() {
        let mut buf = IrBuffer::new();
        let x = buf.emit_load_stack(0).unwrap();
        let y = buf.emit_load_stack(1).unwrap();
        let four = buf.emit_const_num(4.0).unwrap();
        let d1 = buf.emit(IrOp::Div, x, four, IrType::Num).unwrap();
        let d2 = buf.emit(IrOp::Div, y, four, IrType::Num).unwrap();

        strength_reduce(&mut buf);

        // A shared constant cannot be rewritten in place.
        assert_eq!(buf.node(d1).op, IrOp::Div);
        assert_eq!(buf.node(d2).op, IrOp::Div);
        assert_eq!(buf.node(four).imm, Imm::Num(4.0));
    }

    #[test]
    fn test_bounds_check_dedup() {
        let mut buf = IrBuffer::new();
        let bound = buf.emit_load_stack(1).unwrap();
        let init = buf.emit_const_num(0.0).unwrap();
        let header = buf.emit_loop_header().unwrap();
        let phi = buf.emit_phi(init, NONE, IrType::Num).unwrap();
        let one = buf.emit_const_num(1.0).unwrap();
        let next = buf.emit(IrOp::Add, phi, one, IrType::Num).unwrap();
        buf.node_mut(phi).op2 = next;
        let snap = buf.emit_snapshot(0, 2).unwrap();
        let cmp1 = buf.emit(IrOp::Lt, phi, bound, IrType::Bool).unwrap();
        let g1 = buf.emit_guard_true(cmp1, snap).unwrap();
        let cmp2 = buf.emit(IrOp::Lt, phi, bound, IrType::Bool).unwrap();
        let g2 = buf.emit_guard_true(cmp2, snap).unwrap();
        buf.emit_loop_back().unwrap();
        let _ = header;

        gvn(&mut buf); // merge the two compares first
        bounds_check_elim(&mut buf);

        assert!(!buf.node(g1).is_dead());
        assert!(buf.node(g2).is_dead());
    }

    #[test]
    fn test_escape_scalar_replacement() {
        let mut buf = IrBuffer::new();
        let from = buf.emit_const_num(1.0).unwrap();
        let to = buf.emit_const_num(10.0).unwrap();
        let alloc = buf.emit(IrOp::CallNative, from, to, IrType::Ptr).unwrap();
        let lf = buf.emit_load_field(alloc, 0).unwrap();
        let lt = buf.emit_load_field(alloc, 1).unwrap();
        let sum = buf.emit(IrOp::Add, lf, lt, IrType::Num).unwrap();

        escape_analysis(&mut buf);

        assert!(buf.node(alloc).is_dead());
        assert!(buf.node(lf).is_dead());
        assert!(buf.node(lt).is_dead());
        assert_eq!(buf.node(sum).op1, from);
        assert_eq!(buf.node(sum).op2, to);
    }

    #[test]
    fn test_escape_blocked_by_store() {
        let mut buf = IrBuffer::new();
        let from = buf.emit_const_num(1.0).unwrap();
        let to = buf.emit_const_num(10.0).unwrap();
        let alloc = buf.emit(IrOp::CallNative, from, to, IrType::Ptr).unwrap();
        let _store = buf.emit_store_field(alloc, 0, to).unwrap();
        let lf = buf.emit_load_field(alloc, 0).unwrap();
        let _sink = buf.emit(IrOp::Add, lf, lf, IrType::Num).unwrap();

        escape_analysis(&mut buf);

        // The store makes the allocation escape, so it survives...
        assert!(!buf.node(alloc).is_dead());
        // ...but store-load forwarding still rewires the load.
        assert!(buf.node(lf).is_dead());
    }

    #[test]
    fn test_store_load_forwarding() {
        let mut buf = IrBuffer::new();
        let obj = buf.emit_load_stack(0).unwrap();
        let v = buf.emit_load_stack(1).unwrap();
        let _st = buf.emit_store_field(obj, 2, v).unwrap();
        let ld = buf.emit_load_field(obj, 2).unwrap();
        let sink = buf.emit(IrOp::Add, ld, ld, IrType::Num).unwrap();

        escape_analysis(&mut buf);

        assert!(buf.node(ld).is_dead());
        assert_eq!(buf.node(sink).op1, v);
    }

    #[test]
    fn test_store_load_forwarding_blocked_by_call() {
        let mut buf = IrBuffer::new();
        let obj = buf.emit_load_stack(0).unwrap();
        let v = buf.emit_load_stack(1).unwrap();
        let _st = buf.emit_store_field(obj, 2, v).unwrap();
        let _call = buf.emit(IrOp::CallMethod, NONE, NONE, IrType::Value).unwrap();
        let ld = buf.emit_load_field(obj, 2).unwrap();
        let _sink = buf.emit(IrOp::Add, ld, ld, IrType::Num).unwrap();

        escape_analysis(&mut buf);

        assert!(!buf.node(ld).is_dead());
    }

    #[test]
    fn test_dce_sweeps_unreachable() {
        let mut buf = IrBuffer::new();
        let used = buf.emit_const_num(1.0).unwrap();
        let unused = buf.emit_const_num(2.0).unwrap();
        let st = buf.emit_store_stack(0, used).unwrap();

        dce(&mut buf);

        assert!(!buf.node(used).is_dead());
        assert!(buf.node(unused).is_dead());
        assert!(!buf.node(st).is_dead());
    }

    #[test]
    fn test_dce_snapshot_entries_are_roots() {
        let mut buf = IrBuffer::new();
        let v = buf.emit_const_num(7.0).unwrap();
        let snap = buf.emit_snapshot(0, 1).unwrap();
        buf.snapshot_add_entry(snap, 0, v).unwrap();

        dce(&mut buf);

        assert!(!buf.node(v).is_dead());
    }

    #[test]
    fn test_optimize_idempotent() {
        // Running the pipeline twice must yield the single-run result.
        let mut buf = IrBuffer::new();
        for _ in 0..4 {
            buf.emit_nop().unwrap();
        }
        buf.emit_loop_header().unwrap();
        let l = buf.emit_load_stack(0).unwrap();
        let snap = buf.emit_snapshot(4, 1).unwrap();
        buf.snapshot_add_entry(snap, 0, l).unwrap();
        let _g = buf.emit_guard_num(l, snap).unwrap();
        let u = buf.emit_unbox_num(l).unwrap();
        let two = buf.emit_const_num(2.0).unwrap();
        let m = buf.emit(IrOp::Mul, u, two, IrType::Num).unwrap();
        let b = buf.emit_box_num(m).unwrap();
        let _st = buf.emit_store_stack(0, b).unwrap();
        buf.emit_loop_back().unwrap();

        optimize(&mut buf);
        let once: Vec<_> = buf.nodes().to_vec();
        optimize(&mut buf);
        assert_eq!(buf.nodes(), &once[..]);
    }
}
