//! Lowering from optimized IR to native code.
//!
//! Walks the buffer in order, emitting each non-dead node through the
//! assembler backend. The frame holds the allocator's spill slots plus a
//! 16-byte scratch area used to marshal values between the GP and FP files
//! (NaN-boxing is bit reinterpretation, so box/unbox is a round trip
//! through memory). Guards compile to compare-and-jump sites collected per
//! snapshot; after the body, one stub per snapshot writes the live values
//! back to the interpreter stack and returns `snapshot_index + 1`. Falling
//! off the end returns 0, meaning the loop back edge completed.

use rustc_hash::FxHashSet as HashSet;

use crate::backend::{
    AluOp, Backend, Cond, FpCond, FpOp, FrameInfo, FP_SAVED_BASE, JumpId, Label, Operand,
    REG_MODULE_VARS, REG_STACK_BASE,
};
use crate::error::{Error, Result};
use crate::ir::{Imm, IrBuffer, IrOp, IrRef, IrType, NONE};
use crate::regalloc::{Allocation, PoolReg, RegAllocator};
use crate::trace::TraceSnapshot;
use crate::value::{FALSE_VAL, NULL_VAL, OBJ_CLASS_OFFSET, OBJ_HEADER_SIZE, QNAN, SIGN_BIT, TRUE_VAL};

/// Scratch bytes past the spill area, for GP/FP marshalling.
const TMP_AREA_SIZE: u32 = 16;

/// Side tables produced alongside the emitted code.
pub struct CodegenOutput {
    pub snapshots: Vec<TraceSnapshot>,
    pub gc_roots: Vec<u64>,
}

/// Lower `buf` through `backend`. The caller finalizes the backend into a
/// code object afterwards.
pub fn generate(
    buf: &IrBuffer,
    ra: &RegAllocator,
    backend: &mut dyn Backend,
) -> Result<CodegenOutput> {
    Generator {
        buf,
        ra,
        b: backend,
        tmp_off: ra.spill_slot_count() as i32 * 8,
        exit_jumps: vec![Vec::new(); buf.snapshot_count()],
        loop_label: None,
    }
    .run()
}

struct Generator<'a> {
    buf: &'a IrBuffer,
    ra: &'a RegAllocator,
    b: &'a mut dyn Backend,
    tmp_off: i32,
    exit_jumps: Vec<Vec<JumpId>>,
    loop_label: Option<Label>,
}

fn is_mem(op: Operand) -> bool {
    matches!(op, Operand::Frame(_) | Operand::Mem(..))
}

impl<'a> Generator<'a> {
    fn run(mut self) -> Result<CodegenOutput> {
        let spill_bytes = self.ra.spill_slot_count() as u32 * 8;
        self.b.emit_prologue(&FrameInfo {
            gp_scratch: 6,
            gp_saved: 4,
            fp_scratch: 6,
            fp_saved: 4,
            frame_size: spill_bytes + TMP_AREA_SIZE,
        })?;

        for i in 0..self.buf.len() as IrRef {
            let n = *self.buf.node(i);
            if n.is_dead() || n.op == IrOp::Nop {
                continue;
            }
            self.lower(i)?;
        }

        // Completing the body means the loop closed.
        self.b.emit_return(Operand::Imm(0));
        self.emit_exit_stubs();

        Ok(CodegenOutput {
            snapshots: self.copy_snapshots(),
            gc_roots: self.collect_gc_roots(),
        })
    }

    // ----- Location helpers -----

    fn loc(&self, ssa: IrRef) -> Operand {
        match self.ra.allocation(ssa) {
            Some(Allocation::Reg(PoolReg::GpScratch(r))) => Operand::Gp(r),
            Some(Allocation::Reg(PoolReg::FpScratch(r))) => Operand::Fp(r),
            Some(Allocation::Reg(PoolReg::FpSaved(r))) => Operand::Fp(FP_SAVED_BASE + r),
            Some(Allocation::Spill(slot)) => Operand::Frame(slot as i32 * 8),
            None => Operand::Gp(0),
        }
    }

    fn tmp(&self) -> Operand {
        Operand::Frame(self.tmp_off)
    }

    /// GP move that stages through R0 when no direct form exists.
    fn mov_gp(&mut self, dst: Operand, src: Operand) {
        if is_mem(dst) && !matches!(src, Operand::Gp(_)) {
            self.b.emit_mov(Operand::Gp(0), src);
            self.b.emit_mov(dst, Operand::Gp(0));
        } else {
            self.b.emit_mov(dst, src);
        }
    }

    /// FP move that stages through FR0 when no direct form exists.
    fn mov_f64(&mut self, dst: Operand, src: Operand) {
        if is_mem(dst) && !matches!(src, Operand::Fp(_)) {
            self.b.emit_fmov(Operand::Fp(0), src);
            self.b.emit_fmov(dst, Operand::Fp(0));
        } else {
            self.b.emit_fmov(dst, src);
        }
    }

    /// Ensure a GP operand is in a register, staging into `scratch`.
    fn stage_gp(&mut self, op: Operand, scratch: u8) -> Operand {
        match op {
            Operand::Gp(_) => op,
            _ => {
                self.b.emit_mov(Operand::Gp(scratch), op);
                Operand::Gp(scratch)
            }
        }
    }

    /// Ensure an FP operand is in a register, staging into `scratch`.
    fn stage_fp(&mut self, op: Operand, scratch: u8) -> Operand {
        match op {
            Operand::Fp(_) => op,
            _ => {
                self.b.emit_fmov(Operand::Fp(scratch), op);
                Operand::Fp(scratch)
            }
        }
    }

    /// Store an SSA value into a Value-typed memory slot. Boxed values and
    /// pointers move as words; raw doubles are bit-identical under
    /// NaN-boxing and move through the FP file; raw integers convert to
    /// their double encoding first.
    fn store_value(&mut self, dst: Operand, ssa: IrRef) {
        let ty = self.buf.node(ssa).ty;
        let src = self.loc(ssa);
        match ty {
            IrType::Num => self.mov_f64(dst, src),
            IrType::Int => {
                self.b.emit_int_to_f64(Operand::Fp(0), src);
                self.b.emit_fmov(dst, Operand::Fp(0));
            }
            _ => self.mov_gp(dst, src),
        }
    }

    /// Base register holding an object pointer, staging into R1.
    fn object_base(&mut self, obj: IrRef) -> u8 {
        match self.loc(obj) {
            Operand::Gp(r) => r,
            other => {
                self.b.emit_mov(Operand::Gp(1), other);
                1
            }
        }
    }

    fn record_exit(&mut self, snapshot: Option<u16>, jump: JumpId) {
        if let Some(snap) = snapshot {
            if let Some(list) = self.exit_jumps.get_mut(snap as usize) {
                list.push(jump);
            }
        }
    }

    // ----- Node lowering -----

    fn lower(&mut self, i: IrRef) -> Result<()> {
        let n = *self.buf.node(i);
        match n.op {
            IrOp::ConstNum => {
                let bits = match n.imm {
                    Imm::Num(v) => v.to_bits() as i64,
                    _ => 0,
                };
                let tmp = self.tmp();
                self.mov_gp(tmp, Operand::Imm(bits));
                let dst = self.loc(i);
                self.mov_f64(dst, tmp);
            }
            IrOp::ConstBool | IrOp::ConstNull | IrOp::ConstObj | IrOp::ConstInt => {
                let imm = match (n.op, n.imm) {
                    (IrOp::ConstBool, Imm::Bool(b)) => {
                        (if b { TRUE_VAL } else { FALSE_VAL }) as i64
                    }
                    (IrOp::ConstNull, _) => NULL_VAL as i64,
                    (IrOp::ConstObj, Imm::Ptr(p)) => p as i64,
                    (IrOp::ConstInt, Imm::Int(v)) => v,
                    _ => 0,
                };
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Imm(imm));
            }

            IrOp::LoadStack => {
                let slot = n.slot().unwrap_or(0) as i32;
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Mem(REG_STACK_BASE, slot * 8));
            }
            IrOp::StoreStack => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let slot = n.slot().unwrap_or(0) as i32;
                self.store_value(Operand::Mem(REG_STACK_BASE, slot * 8), n.op1);
            }

            IrOp::LoadField => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let off = OBJ_HEADER_SIZE as i32 + n.field().unwrap_or(0) as i32 * 8;
                let base = self.object_base(n.op1);
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Mem(base, off));
            }
            IrOp::StoreField => {
                if n.op1 == NONE || n.op2 == NONE {
                    return Ok(());
                }
                let off = OBJ_HEADER_SIZE as i32 + n.field().unwrap_or(0) as i32 * 8;
                let base = self.object_base(n.op1);
                self.store_value(Operand::Mem(base, off), n.op2);
            }

            IrOp::LoadModuleVar => {
                let idx = match n.imm {
                    Imm::ModuleVar(v) => v as i32,
                    _ => 0,
                };
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Mem(REG_MODULE_VARS, idx * 8));
            }
            IrOp::StoreModuleVar => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let idx = match n.imm {
                    Imm::ModuleVar(v) => v as i32,
                    _ => 0,
                };
                self.store_value(Operand::Mem(REG_MODULE_VARS, idx * 8), n.op1);
            }

            IrOp::UnboxNum => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let tmp = self.tmp();
                let src = self.loc(n.op1);
                self.mov_gp(tmp, src);
                let dst = self.loc(i);
                self.mov_f64(dst, tmp);
            }
            IrOp::BoxNum => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let tmp = self.tmp();
                let src = self.loc(n.op1);
                self.mov_f64(tmp, src);
                let dst = self.loc(i);
                self.mov_gp(dst, tmp);
            }
            IrOp::BoxObj => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(1), src);
                self.b.emit_alu(
                    AluOp::Or,
                    Operand::Gp(1),
                    Operand::Gp(1),
                    Operand::Imm((SIGN_BIT | QNAN) as i64),
                );
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Gp(1));
            }
            IrOp::UnboxObj => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(1), src);
                self.b.emit_alu(
                    AluOp::And,
                    Operand::Gp(1),
                    Operand::Gp(1),
                    Operand::Imm(!(SIGN_BIT | QNAN) as i64),
                );
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Gp(1));
            }
            IrOp::BoxBool => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(0), src);
                let is_false =
                    self.b
                        .emit_cmp_jump(Cond::Eq, Operand::Gp(0), Operand::Imm(0));
                self.b.emit_mov(Operand::Gp(0), Operand::Imm(TRUE_VAL as i64));
                let done = self.b.emit_jump();
                let false_label = self.b.emit_label();
                self.b.bind(is_false, false_label);
                self.b
                    .emit_mov(Operand::Gp(0), Operand::Imm(FALSE_VAL as i64));
                let done_label = self.b.emit_label();
                self.b.bind(done, done_label);
                let dst = self.loc(i);
                self.mov_gp(dst, Operand::Gp(0));
            }
            IrOp::BoxInt => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                self.b.emit_int_to_f64(Operand::Fp(0), src);
                let tmp = self.tmp();
                self.b.emit_fmov(tmp, Operand::Fp(0));
                let dst = self.loc(i);
                self.mov_gp(dst, tmp);
            }
            IrOp::UnboxInt => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let tmp = self.tmp();
                let src = self.loc(n.op1);
                self.mov_gp(tmp, src);
                self.b.emit_fmov(Operand::Fp(0), tmp);
                let dst = self.loc(i);
                match dst {
                    Operand::Gp(_) => self.b.emit_f64_to_int(dst, Operand::Fp(0)),
                    _ => {
                        self.b.emit_f64_to_int(Operand::Gp(0), Operand::Fp(0));
                        self.mov_gp(dst, Operand::Gp(0));
                    }
                }
            }

            IrOp::Add | IrOp::Sub | IrOp::Mul | IrOp::Div | IrOp::Mod => {
                if n.op1 == NONE || n.op2 == NONE {
                    return Ok(());
                }
                if n.ty == IrType::Int {
                    let op = match n.op {
                        IrOp::Add => AluOp::Add,
                        IrOp::Sub => AluOp::Sub,
                        IrOp::Mul => AluOp::Mul,
                        _ => {
                            return Err(Error::InvariantViolation(
                                "integer division in trace".into(),
                            ))
                        }
                    };
                    let a = self.loc(n.op1);
                    let b = self.loc(n.op2);
                    let a = self.stage_gp(a, 0);
                    let b = self.stage_gp(b, 1);
                    let dst = self.loc(i);
                    match dst {
                        Operand::Gp(_) => self.b.emit_alu(op, dst, a, b),
                        _ => {
                            self.b.emit_alu(op, Operand::Gp(0), a, b);
                            self.mov_gp(dst, Operand::Gp(0));
                        }
                    }
                } else {
                    let op = match n.op {
                        IrOp::Add => FpOp::Add,
                        IrOp::Sub => FpOp::Sub,
                        IrOp::Mul => FpOp::Mul,
                        IrOp::Div => FpOp::Div,
                        IrOp::Mod => FpOp::Rem,
                        _ => unreachable!(),
                    };
                    let a = self.loc(n.op1);
                    let b = self.loc(n.op2);
                    let a = self.stage_fp(a, 0);
                    let b = self.stage_fp(b, 1);
                    let dst = self.loc(i);
                    match dst {
                        Operand::Fp(_) => self.b.emit_fop(op, dst, a, b),
                        _ => {
                            self.b.emit_fop(op, Operand::Fp(0), a, b);
                            self.mov_f64(dst, Operand::Fp(0));
                        }
                    }
                }
            }
            IrOp::Neg => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                let src = self.stage_fp(src, 0);
                let dst = self.loc(i);
                match dst {
                    Operand::Fp(_) => self.b.emit_fneg(dst, src),
                    _ => {
                        self.b.emit_fneg(Operand::Fp(0), src);
                        self.mov_f64(dst, Operand::Fp(0));
                    }
                }
            }

            IrOp::BitAnd | IrOp::BitOr | IrOp::BitXor | IrOp::Shl | IrOp::Shr => {
                if n.op1 == NONE || n.op2 == NONE {
                    return Ok(());
                }
                let op = match n.op {
                    IrOp::BitAnd => AluOp::And,
                    IrOp::BitOr => AluOp::Or,
                    IrOp::BitXor => AluOp::Xor,
                    IrOp::Shl => AluOp::Shl,
                    IrOp::Shr => AluOp::Sar,
                    _ => unreachable!(),
                };
                let a = self.loc(n.op1);
                let b = self.loc(n.op2);
                let a = self.stage_gp(a, 0);
                let b = self.stage_gp(b, 1);
                let dst = self.loc(i);
                match dst {
                    Operand::Gp(_) => self.b.emit_alu(op, dst, a, b),
                    _ => {
                        self.b.emit_alu(op, Operand::Gp(0), a, b);
                        self.mov_gp(dst, Operand::Gp(0));
                    }
                }
            }
            IrOp::BitNot => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let a = self.loc(n.op1);
                let a = self.stage_gp(a, 0);
                let dst = self.loc(i);
                match dst {
                    Operand::Gp(_) => self.b.emit_alu(AluOp::Xor, dst, a, Operand::Imm(-1)),
                    _ => {
                        self.b
                            .emit_alu(AluOp::Xor, Operand::Gp(0), a, Operand::Imm(-1));
                        self.mov_gp(dst, Operand::Gp(0));
                    }
                }
            }

            IrOp::Lt | IrOp::Gt | IrOp::Lte | IrOp::Gte | IrOp::Eq | IrOp::Neq => {
                if n.op1 == NONE || n.op2 == NONE {
                    return Ok(());
                }
                if n.ty == IrType::Int {
                    let cond = match n.op {
                        IrOp::Lt => Cond::Lt,
                        IrOp::Gt => Cond::Gt,
                        IrOp::Lte => Cond::Le,
                        IrOp::Gte => Cond::Ge,
                        IrOp::Eq => Cond::Eq,
                        IrOp::Neq => Cond::Ne,
                        _ => unreachable!(),
                    };
                    let a = self.loc(n.op1);
                    let b = self.loc(n.op2);
                    let a = self.stage_gp(a, 0);
                    let b = self.stage_gp(b, 1);
                    let dst = self.loc(i);
                    match dst {
                        Operand::Gp(_) => self.b.emit_cmp_set(cond, dst, a, b),
                        _ => {
                            self.b.emit_cmp_set(cond, Operand::Gp(0), a, b);
                            self.mov_gp(dst, Operand::Gp(0));
                        }
                    }
                } else {
                    // GT/GTE swap operands and reuse the LT/LTE forms;
                    // equality uses the ordered comparisons.
                    let (cond, swap) = match n.op {
                        IrOp::Lt => (FpCond::Lt, false),
                        IrOp::Gt => (FpCond::Lt, true),
                        IrOp::Lte => (FpCond::Le, false),
                        IrOp::Gte => (FpCond::Le, true),
                        IrOp::Eq => (FpCond::OrderedEq, false),
                        IrOp::Neq => (FpCond::OrderedNe, false),
                        _ => unreachable!(),
                    };
                    let a = self.loc(n.op1);
                    let b = self.loc(n.op2);
                    let a = self.stage_fp(a, 0);
                    let b = self.stage_fp(b, 1);
                    let (a, b) = if swap { (b, a) } else { (a, b) };
                    let dst = self.loc(i);
                    match dst {
                        Operand::Gp(_) => self.b.emit_fcmp_set(cond, dst, a, b),
                        _ => {
                            self.b.emit_fcmp_set(cond, Operand::Gp(0), a, b);
                            self.mov_gp(dst, Operand::Gp(0));
                        }
                    }
                }
            }

            IrOp::GuardNum => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(0), src);
                self.b.emit_alu(
                    AluOp::And,
                    Operand::Gp(0),
                    Operand::Gp(0),
                    Operand::Imm(QNAN as i64),
                );
                let jump =
                    self.b
                        .emit_cmp_jump(Cond::Eq, Operand::Gp(0), Operand::Imm(QNAN as i64));
                self.record_exit(n.snapshot_id(), jump);
            }
            IrOp::GuardClass => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let class = match n.imm {
                    Imm::Ptr(p) => p,
                    _ => 0,
                };
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(1), src);
                self.b.emit_alu(
                    AluOp::And,
                    Operand::Gp(1),
                    Operand::Gp(1),
                    Operand::Imm(!(SIGN_BIT | QNAN) as i64),
                );
                self.b
                    .emit_mov(Operand::Gp(0), Operand::Mem(1, OBJ_CLASS_OFFSET as i32));
                let jump =
                    self.b
                        .emit_cmp_jump(Cond::Ne, Operand::Gp(0), Operand::Imm(class as i64));
                self.record_exit(n.snapshot_id(), jump);
            }
            IrOp::GuardTrue => {
                if n.op1 == NONE {
                    return Ok(());
                }
                // Raw comparison results (bool, or int after induction
                // retyping) are 0/1; boxed values check the host encodings.
                let raw_bool =
                    matches!(self.buf.node(n.op1).ty, IrType::Bool | IrType::Int);
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(0), src);
                if raw_bool {
                    let jump =
                        self.b
                            .emit_cmp_jump(Cond::Eq, Operand::Gp(0), Operand::Imm(0));
                    self.record_exit(n.snapshot_id(), jump);
                } else {
                    let j_false = self.b.emit_cmp_jump(
                        Cond::Eq,
                        Operand::Gp(0),
                        Operand::Imm(FALSE_VAL as i64),
                    );
                    let j_null = self.b.emit_cmp_jump(
                        Cond::Eq,
                        Operand::Gp(0),
                        Operand::Imm(NULL_VAL as i64),
                    );
                    self.record_exit(n.snapshot_id(), j_false);
                    self.record_exit(n.snapshot_id(), j_null);
                }
            }
            IrOp::GuardFalse => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let raw_bool =
                    matches!(self.buf.node(n.op1).ty, IrType::Bool | IrType::Int);
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(0), src);
                if raw_bool {
                    let jump =
                        self.b
                            .emit_cmp_jump(Cond::Ne, Operand::Gp(0), Operand::Imm(0));
                    self.record_exit(n.snapshot_id(), jump);
                } else {
                    let is_false = self.b.emit_cmp_jump(
                        Cond::Eq,
                        Operand::Gp(0),
                        Operand::Imm(FALSE_VAL as i64),
                    );
                    let is_null = self.b.emit_cmp_jump(
                        Cond::Eq,
                        Operand::Gp(0),
                        Operand::Imm(NULL_VAL as i64),
                    );
                    let exit = self.b.emit_jump();
                    self.record_exit(n.snapshot_id(), exit);
                    let ok = self.b.emit_label();
                    self.b.bind(is_false, ok);
                    self.b.bind(is_null, ok);
                }
            }
            IrOp::GuardNotNull => {
                if n.op1 == NONE {
                    return Ok(());
                }
                let src = self.loc(n.op1);
                self.b.emit_mov(Operand::Gp(0), src);
                let jump = self.b.emit_cmp_jump(
                    Cond::Eq,
                    Operand::Gp(0),
                    Operand::Imm(NULL_VAL as i64),
                );
                self.record_exit(n.snapshot_id(), jump);
            }

            IrOp::Phi => {
                // The allocator coalesces the PHI with its inputs; a move
                // is only needed when the pre-loop input kept its own
                // location.
                if n.op1 != NONE && !self.ra.same_allocation(i, n.op1) {
                    let dst = self.loc(i);
                    let src = self.loc(n.op1);
                    if n.ty == IrType::Num {
                        self.mov_f64(dst, src);
                    } else {
                        self.mov_gp(dst, src);
                    }
                }
            }
            IrOp::LoopHeader => {
                self.loop_label = Some(self.b.emit_label());
            }
            IrOp::LoopBack => {
                // Resolve back-edge values into their PHI locations before
                // jumping.
                for p in 0..self.buf.len() as IrRef {
                    let phi = *self.buf.node(p);
                    if phi.op != IrOp::Phi || phi.is_dead() || phi.op2 == NONE {
                        continue;
                    }
                    if self.ra.same_allocation(p, phi.op2) {
                        continue;
                    }
                    let dst = self.loc(p);
                    let src = self.loc(phi.op2);
                    if phi.ty == IrType::Num {
                        self.mov_f64(dst, src);
                    } else {
                        self.mov_gp(dst, src);
                    }
                }
                let jump = self.b.emit_jump();
                match self.loop_label {
                    Some(label) => self.b.bind(jump, label),
                    None => {
                        return Err(Error::InvariantViolation(
                            "loop back edge without loop header".into(),
                        ))
                    }
                }
            }
            IrOp::Snapshot => {}
            IrOp::SideExit => {
                let jump = self.b.emit_jump();
                self.record_exit(n.snapshot_id(), jump);
            }

            IrOp::CallNative | IrOp::CallMethod => {
                return Err(Error::Backend("call nodes are not lowered in traces".into()));
            }
            IrOp::Nop => {}
        }
        Ok(())
    }

    // ----- Side exits and tables -----

    /// One stub per snapshot: write live values back to the interpreter
    /// stack, then return the one-based exit index.
    fn emit_exit_stubs(&mut self) {
        for snap in 0..self.buf.snapshot_count() as u16 {
            let label = self.b.emit_label();
            for jump in std::mem::take(&mut self.exit_jumps[snap as usize]) {
                self.b.bind(jump, label);
            }
            let entries: Vec<_> = self.buf.snapshot_entries(snap).to_vec();
            for entry in entries {
                if entry.ssa == NONE || (entry.ssa as usize) >= self.buf.len() {
                    continue;
                }
                if self.buf.node(entry.ssa).is_dead() {
                    continue;
                }
                let slot_mem = Operand::Mem(REG_STACK_BASE, entry.slot as i32 * 8);
                self.store_value(slot_mem, entry.ssa);
            }
            self.b.emit_return(Operand::Imm(snap as i64 + 1));
        }
    }

    fn copy_snapshots(&self) -> Vec<TraceSnapshot> {
        (0..self.buf.snapshot_count() as u16)
            .map(|snap| {
                let info = self.buf.snapshot(snap);
                TraceSnapshot {
                    resume_pc: info.resume_pc,
                    stack_depth: info.stack_depth as usize,
                    entries: self
                        .buf
                        .snapshot_entries(snap)
                        .iter()
                        .map(|e| (e.slot, e.ssa))
                        .collect(),
                }
            })
            .collect()
    }

    fn collect_gc_roots(&self) -> Vec<u64> {
        let mut seen: HashSet<u64> = HashSet::default();
        let mut roots = Vec::new();
        for n in self.buf.nodes() {
            if n.is_dead() || n.op != IrOp::ConstObj {
                continue;
            }
            if let Imm::Ptr(p) = n.imm {
                if p != 0 && seen.insert(p) {
                    roots.push(p);
                }
            }
        }
        roots
    }
}
