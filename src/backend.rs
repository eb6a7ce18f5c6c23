//! Code-emission backend abstraction.
//!
//! The code generator drives an abstract assembler: a prologue declaring
//! the register file and frame size, one- and two-operand integer and FP
//! ops over register/immediate/frame/indirect operands, compares that
//! either materialize a flag or jump, labels with patchable jumps, and
//! returns. `finalize` relocates the assembled stream into a callable code
//! object that owns its memory for the trace's lifetime.
//!
//! [`EvalBackend`] is the portable reference implementation: it assembles
//! the instruction stream into a buffer and executes it with a small
//! evaluator over real machine state. The entry contract is identical to a
//! hardware backend's; compiled traces mutate the interpreter's stack and
//! module variables through the pointers they are handed.

use crate::error::{Error, Result};

/// GP register indices. 0..5 are scratch (R0..R5); 8..11 are the pinned
/// saved registers holding the four entry arguments.
pub const REG_VM: u8 = 8;
pub const REG_FRAME: u8 = 9;
pub const REG_STACK_BASE: u8 = 10;
pub const REG_MODULE_VARS: u8 = 11;

const GP_FILE_SIZE: usize = 12;
/// FP register indices: FR0..FR5 are 0..5, FS0..FS3 are 6..9.
const FP_FILE_SIZE: usize = 10;
pub const FP_SAVED_BASE: u8 = 6;

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// General-purpose register.
    Gp(u8),
    /// Floating-point register.
    Fp(u8),
    /// 64-bit immediate.
    Imm(i64),
    /// Frame-relative memory: `[sp + disp]`.
    Frame(i32),
    /// Indirect memory through a GP base register: `[gp + disp]`.
    Mem(u8, i32),
}

/// Two-operand integer ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Sar,
}

/// Two-operand floating-point operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Signed integer comparison conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Floating-point comparison conditions (ordered: NaN compares false).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpCond {
    Lt,
    Le,
    OrderedEq,
    OrderedNe,
}

/// Frame and register-file declaration for the prologue.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub gp_scratch: u8,
    pub gp_saved: u8,
    pub fp_scratch: u8,
    pub fp_saved: u8,
    /// Local frame size in bytes (spill slots plus scratch area).
    pub frame_size: u32,
}

/// A forward-patchable jump site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpId(pub usize);

/// A bound label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub usize);

/// The four pointer arguments every compiled trace receives, bound to the
/// saved registers declared in the prologue.
#[derive(Debug, Clone, Copy)]
pub struct EntryArgs {
    pub vm: u64,
    pub frame: u64,
    pub stack_base: *mut u64,
    pub module_vars: *mut u64,
}

/// Executable trace code. Returns 0 when the loop back edge completed, or
/// `snapshot_index + 1` on a side exit. Dropping the object releases its
/// code memory.
pub trait TraceCode {
    fn execute(&self, args: &EntryArgs) -> u64;
    fn code_size(&self) -> usize;
}

/// Abstract assembler the code generator emits through.
pub trait Backend {
    fn emit_prologue(&mut self, frame: &FrameInfo) -> Result<()>;
    /// 64-bit integer move; either operand may be memory.
    fn emit_mov(&mut self, dst: Operand, src: Operand);
    /// 64-bit FP move; either operand may be memory.
    fn emit_fmov(&mut self, dst: Operand, src: Operand);
    fn emit_alu(&mut self, op: AluOp, dst: Operand, a: Operand, b: Operand);
    fn emit_fop(&mut self, op: FpOp, dst: Operand, a: Operand, b: Operand);
    fn emit_fneg(&mut self, dst: Operand, src: Operand);
    /// Compare and materialize the condition as 0/1 into `dst`.
    fn emit_cmp_set(&mut self, cond: Cond, dst: Operand, a: Operand, b: Operand);
    fn emit_fcmp_set(&mut self, cond: FpCond, dst: Operand, a: Operand, b: Operand);
    /// Compare and branch when the condition holds.
    fn emit_cmp_jump(&mut self, cond: Cond, a: Operand, b: Operand) -> JumpId;
    fn emit_jump(&mut self) -> JumpId;
    fn emit_label(&mut self) -> Label;
    fn bind(&mut self, jump: JumpId, label: Label);
    /// Signed 64-bit integer to double.
    fn emit_int_to_f64(&mut self, dst: Operand, src: Operand);
    /// Double to signed 64-bit integer, truncating.
    fn emit_f64_to_int(&mut self, dst: Operand, src: Operand);
    fn emit_return(&mut self, value: Operand);
    /// Relocate into executable form.
    fn finalize(self: Box<Self>) -> Result<Box<dyn TraceCode>>;
}

// ---------------------------------------------------------------------------
// Portable evaluating backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Inst {
    Mov { dst: Operand, src: Operand },
    Fmov { dst: Operand, src: Operand },
    Alu { op: AluOp, dst: Operand, a: Operand, b: Operand },
    Fop { op: FpOp, dst: Operand, a: Operand, b: Operand },
    Fneg { dst: Operand, src: Operand },
    CmpSet { cond: Cond, dst: Operand, a: Operand, b: Operand },
    FcmpSet { cond: FpCond, dst: Operand, a: Operand, b: Operand },
    CmpJump { cond: Cond, a: Operand, b: Operand, target: usize },
    Jump { target: usize },
    IntToF64 { dst: Operand, src: Operand },
    F64ToInt { dst: Operand, src: Operand },
    Ret { value: Operand },
}

const UNBOUND: usize = usize::MAX;

/// Assembles the abstract stream and evaluates it on demand.
#[derive(Default)]
pub struct EvalBackend {
    insts: Vec<Inst>,
    frame_size: u32,
    prologue_done: bool,
}

impl EvalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for EvalBackend {
    fn emit_prologue(&mut self, frame: &FrameInfo) -> Result<()> {
        if self.prologue_done {
            return Err(Error::Backend("prologue emitted twice".into()));
        }
        if frame.gp_scratch as usize > 6 || frame.fp_scratch as usize > 6 {
            return Err(Error::Backend("register file too large".into()));
        }
        self.frame_size = frame.frame_size;
        self.prologue_done = true;
        Ok(())
    }

    fn emit_mov(&mut self, dst: Operand, src: Operand) {
        self.insts.push(Inst::Mov { dst, src });
    }

    fn emit_fmov(&mut self, dst: Operand, src: Operand) {
        self.insts.push(Inst::Fmov { dst, src });
    }

    fn emit_alu(&mut self, op: AluOp, dst: Operand, a: Operand, b: Operand) {
        self.insts.push(Inst::Alu { op, dst, a, b });
    }

    fn emit_fop(&mut self, op: FpOp, dst: Operand, a: Operand, b: Operand) {
        self.insts.push(Inst::Fop { op, dst, a, b });
    }

    fn emit_fneg(&mut self, dst: Operand, src: Operand) {
        self.insts.push(Inst::Fneg { dst, src });
    }

    fn emit_cmp_set(&mut self, cond: Cond, dst: Operand, a: Operand, b: Operand) {
        self.insts.push(Inst::CmpSet { cond, dst, a, b });
    }

    fn emit_fcmp_set(&mut self, cond: FpCond, dst: Operand, a: Operand, b: Operand) {
        self.insts.push(Inst::FcmpSet { cond, dst, a, b });
    }

    fn emit_cmp_jump(&mut self, cond: Cond, a: Operand, b: Operand) -> JumpId {
        self.insts.push(Inst::CmpJump {
            cond,
            a,
            b,
            target: UNBOUND,
        });
        JumpId(self.insts.len() - 1)
    }

    fn emit_jump(&mut self) -> JumpId {
        self.insts.push(Inst::Jump { target: UNBOUND });
        JumpId(self.insts.len() - 1)
    }

    fn emit_label(&mut self) -> Label {
        Label(self.insts.len())
    }

    fn bind(&mut self, jump: JumpId, label: Label) {
        match &mut self.insts[jump.0] {
            Inst::CmpJump { target, .. } | Inst::Jump { target } => *target = label.0,
            _ => debug_assert!(false, "bind target is not a jump"),
        }
    }

    fn emit_int_to_f64(&mut self, dst: Operand, src: Operand) {
        self.insts.push(Inst::IntToF64 { dst, src });
    }

    fn emit_f64_to_int(&mut self, dst: Operand, src: Operand) {
        self.insts.push(Inst::F64ToInt { dst, src });
    }

    fn emit_return(&mut self, value: Operand) {
        self.insts.push(Inst::Ret { value });
    }

    fn finalize(self: Box<Self>) -> Result<Box<dyn TraceCode>> {
        if !self.prologue_done {
            return Err(Error::Backend("finalize without prologue".into()));
        }
        if let Some(inst) = self.insts.iter().find(|i| {
            matches!(
                **i,
                Inst::Jump { target: UNBOUND } | Inst::CmpJump { target: UNBOUND, .. }
            )
        }) {
            return Err(Error::Backend(format!("unbound jump: {:?}", inst)));
        }
        Ok(Box::new(EvalCode {
            insts: self.insts,
            frame_size: self.frame_size as usize,
        }))
    }
}

/// Finalized code for the evaluating backend.
pub struct EvalCode {
    insts: Vec<Inst>,
    frame_size: usize,
}

struct Machine {
    gp: [u64; GP_FILE_SIZE],
    fp: [f64; FP_FILE_SIZE],
    frame: Vec<u64>,
}

impl Machine {
    fn frame_index(&self, disp: i32) -> usize {
        debug_assert!(disp >= 0 && disp % 8 == 0);
        (disp / 8) as usize
    }

    fn read_u64(&self, op: Operand) -> u64 {
        match op {
            Operand::Gp(r) => self.gp[r as usize],
            Operand::Imm(v) => v as u64,
            Operand::Frame(d) => self.frame[self.frame_index(d)],
            Operand::Mem(base, disp) => {
                let addr = (self.gp[base as usize] as i64 + disp as i64) as usize;
                unsafe { std::ptr::read(addr as *const u64) }
            }
            Operand::Fp(_) => {
                debug_assert!(false, "fp operand in integer context");
                0
            }
        }
    }

    fn write_u64(&mut self, op: Operand, val: u64) {
        match op {
            Operand::Gp(r) => self.gp[r as usize] = val,
            Operand::Frame(d) => {
                let idx = self.frame_index(d);
                self.frame[idx] = val;
            }
            Operand::Mem(base, disp) => {
                let addr = (self.gp[base as usize] as i64 + disp as i64) as usize;
                unsafe { std::ptr::write(addr as *mut u64, val) }
            }
            _ => debug_assert!(false, "bad integer destination"),
        }
    }

    fn read_f64(&self, op: Operand) -> f64 {
        match op {
            Operand::Fp(r) => self.fp[r as usize],
            _ => f64::from_bits(self.read_u64(op)),
        }
    }

    fn write_f64(&mut self, op: Operand, val: f64) {
        match op {
            Operand::Fp(r) => self.fp[r as usize] = val,
            _ => self.write_u64(op, val.to_bits()),
        }
    }
}

fn int_cond(cond: Cond, a: i64, b: i64) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::Ne => a != b,
        Cond::Lt => a < b,
        Cond::Le => a <= b,
        Cond::Gt => a > b,
        Cond::Ge => a >= b,
    }
}

fn fp_cond(cond: FpCond, a: f64, b: f64) -> bool {
    match cond {
        FpCond::Lt => a < b,
        FpCond::Le => a <= b,
        FpCond::OrderedEq => a == b,
        FpCond::OrderedNe => !a.is_nan() && !b.is_nan() && a != b,
    }
}

impl TraceCode for EvalCode {
    fn execute(&self, args: &EntryArgs) -> u64 {
        let mut m = Machine {
            gp: [0; GP_FILE_SIZE],
            fp: [0.0; FP_FILE_SIZE],
            frame: vec![0; (self.frame_size + 7) / 8],
        };
        m.gp[REG_VM as usize] = args.vm;
        m.gp[REG_FRAME as usize] = args.frame;
        m.gp[REG_STACK_BASE as usize] = args.stack_base as u64;
        m.gp[REG_MODULE_VARS as usize] = args.module_vars as u64;

        let mut pc = 0usize;
        while pc < self.insts.len() {
            match self.insts[pc] {
                Inst::Mov { dst, src } => {
                    let v = m.read_u64(src);
                    m.write_u64(dst, v);
                }
                Inst::Fmov { dst, src } => {
                    let v = m.read_f64(src);
                    m.write_f64(dst, v);
                }
                Inst::Alu { op, dst, a, b } => {
                    let x = m.read_u64(a) as i64;
                    let y = m.read_u64(b) as i64;
                    let r = match op {
                        AluOp::Add => x.wrapping_add(y),
                        AluOp::Sub => x.wrapping_sub(y),
                        AluOp::Mul => x.wrapping_mul(y),
                        AluOp::And => x & y,
                        AluOp::Or => x | y,
                        AluOp::Xor => x ^ y,
                        AluOp::Shl => x.wrapping_shl(y as u32),
                        AluOp::Sar => x.wrapping_shr(y as u32),
                    };
                    m.write_u64(dst, r as u64);
                }
                Inst::Fop { op, dst, a, b } => {
                    let x = m.read_f64(a);
                    let y = m.read_f64(b);
                    let r = match op {
                        FpOp::Add => x + y,
                        FpOp::Sub => x - y,
                        FpOp::Mul => x * y,
                        FpOp::Div => x / y,
                        FpOp::Rem => x % y,
                    };
                    m.write_f64(dst, r);
                }
                Inst::Fneg { dst, src } => {
                    let v = m.read_f64(src);
                    m.write_f64(dst, -v);
                }
                Inst::CmpSet { cond, dst, a, b } => {
                    let x = m.read_u64(a) as i64;
                    let y = m.read_u64(b) as i64;
                    m.write_u64(dst, int_cond(cond, x, y) as u64);
                }
                Inst::FcmpSet { cond, dst, a, b } => {
                    let x = m.read_f64(a);
                    let y = m.read_f64(b);
                    m.write_u64(dst, fp_cond(cond, x, y) as u64);
                }
                Inst::CmpJump { cond, a, b, target } => {
                    let x = m.read_u64(a) as i64;
                    let y = m.read_u64(b) as i64;
                    if int_cond(cond, x, y) {
                        pc = target;
                        continue;
                    }
                }
                Inst::Jump { target } => {
                    pc = target;
                    continue;
                }
                Inst::IntToF64 { dst, src } => {
                    let v = m.read_u64(src) as i64;
                    m.write_f64(dst, v as f64);
                }
                Inst::F64ToInt { dst, src } => {
                    let v = m.read_f64(src);
                    m.write_u64(dst, (v as i64) as u64);
                }
                Inst::Ret { value } => return m.read_u64(value),
            }
            pc += 1;
        }
        0
    }

    fn code_size(&self) -> usize {
        self.insts.len() * std::mem::size_of::<Inst>()
    }
}
