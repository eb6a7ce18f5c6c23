//! Trace recorder.
//!
//! Translates one executed iteration of a hot loop into SSA IR, one
//! bytecode instruction at a time. The recorder mirrors the interpreter's
//! stack with a slot map from stack slot to SSA id, inspects the concrete
//! runtime values the interpreter is about to operate on to bias its
//! guards, and captures a deoptimization snapshot before every speculative
//! decision. Recording ends at a backward branch to the anchor (success)
//! or at anything it cannot inline (abort).
//!
//! Aborts are ordinary control flow, not errors: the interpreter state is
//! untouched and execution simply continues in the slow path.

mod widen;

use std::fmt;

use crate::bytecode::{read_u16, read_u8, Opcode};
use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::host::{RecordView, SymbolTable};
use crate::ir::{IrBuffer, IrOp, IrRef, IrType, NONE};

/// Recorder slot map capacity.
pub const MAX_SLOTS: usize = 256;

/// Why a recording ended without producing a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UnsupportedOpcode(u8),
    UnsupportedCallArity,
    UnsupportedUpvalue,
    UnsupportedReceiver,
    UnsupportedMethod,
    TraceTooLong,
    CallDepthExceeded,
    StackUnderflow(&'static str),
    UntrackedValue(&'static str),
    ConstantOutOfRange,
    ModuleVarOutOfRange,
    NonAnchorLoopTarget,
    ReturnFromRoot,
    IrLimit,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::UnsupportedOpcode(byte) => write!(f, "unsupported opcode {}", byte),
            AbortReason::UnsupportedCallArity => {
                write!(f, "unsupported call with two or more arguments")
            }
            AbortReason::UnsupportedUpvalue => write!(f, "unsupported upvalue access"),
            AbortReason::UnsupportedReceiver => write!(f, "unsupported receiver type"),
            AbortReason::UnsupportedMethod => write!(f, "unsupported method on numeric receiver"),
            AbortReason::TraceTooLong => write!(f, "trace too long"),
            AbortReason::CallDepthExceeded => write!(f, "call depth too deep"),
            AbortReason::StackUnderflow(op) => write!(f, "stack underflow at {}", op),
            AbortReason::UntrackedValue(op) => write!(f, "untracked value at {}", op),
            AbortReason::ConstantOutOfRange => write!(f, "constant index out of range"),
            AbortReason::ModuleVarOutOfRange => write!(f, "module variable index out of range"),
            AbortReason::NonAnchorLoopTarget => {
                write!(f, "loop target is not the anchor (nested loop)")
            }
            AbortReason::ReturnFromRoot => write!(f, "returning out of the trace root"),
            AbortReason::IrLimit => write!(f, "IR buffer limit reached"),
        }
    }
}

impl From<Error> for AbortReason {
    fn from(_: Error) -> Self {
        AbortReason::IrLimit
    }
}

/// Outcome of recording one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Keep recording.
    Continue,
    /// Loop closed at the anchor; the trace is ready to compile.
    Complete,
    /// Recording ended without a trace.
    Abort(AbortReason),
}

/// State for one in-progress recording.
pub struct Recorder {
    pub(crate) ir: IrBuffer,
    anchor: usize,
    slot_map: [IrRef; MAX_SLOTS],
    slot_live: [bool; MAX_SLOTS],
    pub(crate) num_slots: usize,
    pub(crate) stack_top: usize,
    instr_count: u32,
    call_depth: u32,
    max_instructions: u32,
    max_call_depth: u32,
    aborted: bool,
}

impl Recorder {
    /// Begin recording at `anchor` with `num_slots` live interpreter slots.
    ///
    /// Reserves the pre-header no-op slots, emits the loop header, and
    /// seeds the slot map with a stack load per live slot so values
    /// flowing into the loop have SSA names.
    pub fn start(anchor: usize, num_slots: usize, config: &JitConfig) -> Result<Recorder> {
        let mut rec = Recorder {
            ir: IrBuffer::new(),
            anchor,
            slot_map: [NONE; MAX_SLOTS],
            slot_live: [false; MAX_SLOTS],
            num_slots: 0,
            stack_top: 0,
            instr_count: 0,
            call_depth: 0,
            max_instructions: config.max_instructions_per_trace,
            max_call_depth: config.max_call_depth,
            aborted: false,
        };
        for _ in 0..config.pre_header_slots {
            rec.ir.emit_nop()?;
        }
        rec.ir.emit_loop_header()?;

        let slots = num_slots.min(MAX_SLOTS);
        rec.num_slots = slots;
        rec.stack_top = slots;
        for slot in 0..slots {
            let ssa = rec.ir.emit_load_stack(slot as u16)?;
            rec.slot_set(slot, ssa);
        }
        Ok(rec)
    }

    pub fn anchor(&self) -> usize {
        self.anchor
    }

    pub fn ir(&self) -> &IrBuffer {
        &self.ir
    }

    pub fn into_ir(self) -> IrBuffer {
        self.ir
    }

    /// Record the instruction at `pc`, observing the interpreter state in
    /// `view` as it is immediately before execution.
    pub fn step(&mut self, view: &RecordView<'_>, pc: usize) -> StepResult {
        if self.aborted {
            return StepResult::Abort(AbortReason::IrLimit);
        }
        match self.try_step(view, pc) {
            Ok(result) => result,
            Err(reason) => {
                self.aborted = true;
                StepResult::Abort(reason)
            }
        }
    }

    // ----- Slot map -----

    pub(crate) fn slot_get(&self, slot: usize) -> IrRef {
        if slot < MAX_SLOTS && self.slot_live[slot] {
            self.slot_map[slot]
        } else {
            NONE
        }
    }

    pub(crate) fn slot_set(&mut self, slot: usize, ssa: IrRef) {
        if slot >= MAX_SLOTS {
            return;
        }
        self.slot_map[slot] = ssa;
        self.slot_live[slot] = true;
        if slot + 1 > self.num_slots {
            self.num_slots = slot + 1;
        }
    }

    pub(crate) fn slot_kill(&mut self, slot: usize) {
        if slot < MAX_SLOTS {
            self.slot_live[slot] = false;
        }
    }

    /// SSA id of `slot`, emitting a stack load when it is untracked.
    fn ensure_slot(&mut self, slot: usize) -> Result<IrRef> {
        let ssa = self.slot_get(slot);
        if ssa != NONE {
            return Ok(ssa);
        }
        let ssa = self.ir.emit_load_stack(slot as u16)?;
        self.slot_set(slot, ssa);
        Ok(ssa)
    }

    // ----- Snapshots -----

    /// Capture a snapshot of every live slot below the logical stack top.
    pub(crate) fn emit_snapshot_here(&mut self, resume_pc: usize) -> Result<u16> {
        let depth = self.stack_top;
        self.emit_snapshot_depth(resume_pc, depth)
    }

    pub(crate) fn emit_snapshot_depth(&mut self, resume_pc: usize, depth: usize) -> Result<u16> {
        let snap = self.ir.emit_snapshot(resume_pc, depth as u16)?;
        for slot in 0..depth.min(MAX_SLOTS) {
            if self.slot_live[slot] {
                self.ir.snapshot_add_entry(snap, slot as u16, self.slot_map[slot])?;
            }
        }
        Ok(snap)
    }

    // ----- Method symbol classification -----

    fn binary_num_op(symbols: &SymbolTable, symbol: u16) -> Option<IrOp> {
        match symbols.name(symbol)? {
            "+(_)" => Some(IrOp::Add),
            "-(_)" => Some(IrOp::Sub),
            "*(_)" => Some(IrOp::Mul),
            "/(_)" => Some(IrOp::Div),
            "%(_)" => Some(IrOp::Mod),
            "<(_)" => Some(IrOp::Lt),
            ">(_)" => Some(IrOp::Gt),
            "<=(_)" => Some(IrOp::Lte),
            ">=(_)" => Some(IrOp::Gte),
            "==(_)" => Some(IrOp::Eq),
            "!=(_)" => Some(IrOp::Neq),
            _ => None,
        }
    }

    fn unary_num_op(symbols: &SymbolTable, symbol: u16) -> Option<IrOp> {
        match symbols.name(symbol)? {
            "-" => Some(IrOp::Neg),
            _ => None,
        }
    }

    // ----- Main dispatch -----

    fn try_step(
        &mut self,
        view: &RecordView<'_>,
        pc: usize,
    ) -> std::result::Result<StepResult, AbortReason> {
        self.instr_count += 1;
        if self.instr_count > self.max_instructions {
            return Err(AbortReason::TraceTooLong);
        }

        let byte = view.code[pc];
        let opcode = Opcode::from_byte(byte).ok_or(AbortReason::UnsupportedOpcode(byte))?;

        match opcode {
            Opcode::Constant => {
                let index = read_u16(view.code, pc) as usize;
                let constant = *view
                    .constants
                    .get(index)
                    .ok_or(AbortReason::ConstantOutOfRange)?;
                let ssa = if constant.is_num() {
                    self.ir.emit_const_num(constant.as_num())?
                } else if constant.is_null() {
                    self.ir.emit_const_null()?
                } else if constant.is_bool() {
                    self.ir.emit_const_bool(constant == crate::value::Value::TRUE)?
                } else {
                    self.ir.emit_const_obj(constant.as_obj_ptr())?
                };
                self.push(ssa);
            }
            Opcode::Null => {
                let ssa = self.ir.emit_const_null()?;
                self.push(ssa);
            }
            Opcode::False => {
                let ssa = self.ir.emit_const_bool(false)?;
                self.push(ssa);
            }
            Opcode::True => {
                let ssa = self.ir.emit_const_bool(true)?;
                self.push(ssa);
            }

            Opcode::LoadLocal => {
                let slot = read_u8(view.code, pc) as usize;
                let ssa = self.ensure_slot(slot)?;
                self.push(ssa);
            }
            Opcode::StoreLocal => {
                let slot = read_u8(view.code, pc) as usize;
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("store local"));
                }
                let ssa = self.slot_get(self.stack_top - 1);
                if ssa == NONE {
                    return Err(AbortReason::UntrackedValue("store local"));
                }
                // Written back so the stack load at the loop header sees
                // the updated value on re-entry; proof-based guard
                // elimination prunes stores no later read needs.
                self.ir.emit_store_stack(slot as u16, ssa)?;
                self.slot_set(slot, ssa);
            }

            Opcode::LoadFieldThis => {
                let field = read_u8(view.code, pc) as u16;
                let receiver = self.ensure_slot(0)?;
                let ssa = self.ir.emit_load_field(receiver, field)?;
                self.push(ssa);
            }
            Opcode::StoreFieldThis => {
                let field = read_u8(view.code, pc) as u16;
                let receiver = self.ensure_slot(0)?;
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("store field"));
                }
                let val = self.slot_get(self.stack_top - 1);
                if val == NONE {
                    return Err(AbortReason::UntrackedValue("store field"));
                }
                self.ir.emit_store_field(receiver, field, val)?;
            }
            Opcode::LoadField => {
                let field = read_u8(view.code, pc) as u16;
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("load field"));
                }
                let obj_slot = self.stack_top - 1;
                let obj = self.ensure_slot(obj_slot)?;
                let ssa = self.ir.emit_load_field(obj, field)?;
                // Pops the instance, pushes the value: net zero.
                self.slot_set(obj_slot, ssa);
            }
            Opcode::StoreField => {
                let field = read_u8(view.code, pc) as u16;
                if self.stack_top < 2 {
                    return Err(AbortReason::StackUnderflow("store field"));
                }
                let inst_slot = self.stack_top - 1;
                let val_slot = self.stack_top - 2;
                let inst = self.ensure_slot(inst_slot)?;
                let val = self.ensure_slot(val_slot)?;
                self.ir.emit_store_field(inst, field, val)?;
                self.stack_top -= 1;
                self.slot_kill(self.stack_top);
            }

            Opcode::LoadModuleVar => {
                let index = read_u16(view.code, pc);
                if index as usize >= view.module_vars.len() {
                    return Err(AbortReason::ModuleVarOutOfRange);
                }
                let ssa = self.ir.emit_load_module_var(index)?;
                self.push(ssa);
            }
            Opcode::StoreModuleVar => {
                let index = read_u16(view.code, pc);
                if index as usize >= view.module_vars.len() {
                    return Err(AbortReason::ModuleVarOutOfRange);
                }
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("store module variable"));
                }
                let mut val = self.slot_get(self.stack_top - 1);
                if val == NONE {
                    val = self.ir.emit_load_stack((self.stack_top - 1) as u16)?;
                }
                self.ir.emit_store_module_var(index, val)?;
            }

            Opcode::Pop => {
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("pop"));
                }
                self.stack_top -= 1;
                self.slot_kill(self.stack_top);
            }

            Opcode::Call0 => {
                let symbol = read_u16(view.code, pc);
                if self.stack_top < 1 {
                    return Err(AbortReason::StackUnderflow("unary call"));
                }
                let recv_slot = self.stack_top - 1;
                let recv_val = view.stack[recv_slot];

                if recv_val.is_num() {
                    let op = Self::unary_num_op(view.symbols, symbol)
                        .ok_or(AbortReason::UnsupportedMethod)?;
                    let snap = self.emit_snapshot_here(pc)?;
                    let recv = self.ensure_slot(recv_slot)?;
                    self.ir.emit_guard_num(recv, snap)?;
                    let unboxed = self.ir.emit_unbox_num(recv)?;
                    let result = self.ir.emit(op, unboxed, NONE, IrType::Num)?;
                    let boxed = self.ir.emit_box_num(result)?;
                    // Receiver replaced by the result; no stack effect.
                    self.slot_set(recv_slot, boxed);
                } else {
                    return Err(AbortReason::UnsupportedReceiver);
                }
            }
            Opcode::Call1 => {
                let symbol = read_u16(view.code, pc);
                if self.stack_top < 2 {
                    return Err(AbortReason::StackUnderflow("binary call"));
                }
                let recv_slot = self.stack_top - 2;
                let arg_slot = self.stack_top - 1;
                let recv_val = view.stack[recv_slot];

                if recv_val.is_num() {
                    let op = Self::binary_num_op(view.symbols, symbol)
                        .ok_or(AbortReason::UnsupportedMethod)?;
                    let snap = self.emit_snapshot_here(pc)?;
                    let recv = self.ensure_slot(recv_slot)?;
                    let arg = self.ensure_slot(arg_slot)?;
                    self.ir.emit_guard_num(recv, snap)?;
                    self.ir.emit_guard_num(arg, snap)?;
                    let left = self.ir.emit_unbox_num(recv)?;
                    let right = self.ir.emit_unbox_num(arg)?;
                    let is_cmp = op.is_cmp();
                    let result_ty = if is_cmp { IrType::Bool } else { IrType::Num };
                    let result = self.ir.emit(op, left, right, result_ty)?;
                    // Comparisons produce a raw bool; re-box through the
                    // dedicated form so later guards check the host's
                    // boxed encoding rather than 0/1.
                    let boxed = if is_cmp {
                        self.ir.emit_box_bool(result)?
                    } else {
                        self.ir.emit_box_num(result)?
                    };
                    // Pops the argument, replaces the receiver.
                    self.stack_top -= 1;
                    self.slot_kill(self.stack_top);
                    self.slot_set(recv_slot, boxed);
                } else if self.try_widen_call1(view, symbol, pc)? {
                    // Inlined by the monomorphic widener.
                } else {
                    return Err(AbortReason::UnsupportedReceiver);
                }
            }
            Opcode::CallN => return Err(AbortReason::UnsupportedCallArity),

            Opcode::Jump => {
                // Recording follows the taken path; no IR.
            }
            Opcode::JumpIf => {
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("conditional jump"));
                }
                self.stack_top -= 1;
                let mut cond = self.slot_get(self.stack_top);
                if cond == NONE {
                    cond = self.ir.emit_load_stack(self.stack_top as u16)?;
                }
                self.slot_kill(self.stack_top);

                // The interpreter has already decided; inspect the value
                // it is about to pop to learn which way.
                let taken = view.stack[self.stack_top].is_falsy();
                let offset = read_u16(view.code, pc) as usize;
                let not_taken_pc = if taken { pc + 3 } else { pc + 3 + offset };

                let snap = self.emit_snapshot_here(not_taken_pc)?;
                if taken {
                    self.ir.emit_guard_false(cond, snap)?;
                } else {
                    self.ir.emit_guard_true(cond, snap)?;
                }
            }
            Opcode::And => {
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("and"));
                }
                let cond_slot = self.stack_top - 1;
                let cond = self.ensure_slot(cond_slot)?;
                let falsy = view.stack[cond_slot].is_falsy();
                let offset = read_u16(view.code, pc) as usize;

                if falsy {
                    // Observed: keep the value and jump. Deopt resumes on
                    // the fall-through path, where it has been popped.
                    let snap = self.emit_snapshot_depth(pc + 3, cond_slot)?;
                    self.ir.emit_guard_false(cond, snap)?;
                } else {
                    // Observed: pop and continue. Deopt resumes at the
                    // jump target with the value still on the stack.
                    let snap = self.emit_snapshot_here(pc + 3 + offset)?;
                    self.ir.emit_guard_true(cond, snap)?;
                    self.stack_top -= 1;
                    self.slot_kill(self.stack_top);
                }
            }
            Opcode::Or => {
                if self.stack_top == 0 {
                    return Err(AbortReason::StackUnderflow("or"));
                }
                let cond_slot = self.stack_top - 1;
                let cond = self.ensure_slot(cond_slot)?;
                let truthy = !view.stack[cond_slot].is_falsy();
                let offset = read_u16(view.code, pc) as usize;

                if truthy {
                    let snap = self.emit_snapshot_depth(pc + 3, cond_slot)?;
                    self.ir.emit_guard_true(cond, snap)?;
                } else {
                    let snap = self.emit_snapshot_here(pc + 3 + offset)?;
                    self.ir.emit_guard_false(cond, snap)?;
                    self.stack_top -= 1;
                    self.slot_kill(self.stack_top);
                }
            }

            Opcode::Loop => {
                let offset = read_u16(view.code, pc) as usize;
                let target = pc + 3 - offset;
                if target == self.anchor {
                    self.ir.emit_loop_back()?;
                    return Ok(StepResult::Complete);
                }
                return Err(AbortReason::NonAnchorLoopTarget);
            }

            Opcode::Return => {
                if self.call_depth > 0 {
                    // The interpreter restores the caller's frame; only
                    // the depth is tracked here.
                    self.call_depth -= 1;
                } else {
                    return Err(AbortReason::ReturnFromRoot);
                }
            }

            Opcode::LoadUpvalue | Opcode::StoreUpvalue => {
                return Err(AbortReason::UnsupportedUpvalue);
            }
        }

        if self.call_depth > self.max_call_depth {
            return Err(AbortReason::CallDepthExceeded);
        }
        Ok(StepResult::Continue)
    }

    fn push(&mut self, ssa: IrRef) {
        let top = self.stack_top;
        self.slot_set(top, ssa);
        self.stack_top += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode as Op;
    use crate::value::Value;

    struct Harness {
        code: Vec<u8>,
        constants: Vec<Value>,
        stack: Vec<Value>,
        module_vars: Vec<Value>,
        symbols: SymbolTable,
    }

    impl Harness {
        fn new() -> Self {
            let mut symbols = SymbolTable::new();
            for name in ["+(_)", "-(_)", "*(_)", "/(_)", "<(_)", "-"] {
                symbols.ensure(name);
            }
            Self {
                code: Vec::new(),
                constants: Vec::new(),
                stack: vec![Value::NULL; 16],
                module_vars: vec![Value::num(0.0); 4],
                symbols,
            }
        }

        fn op(&mut self, op: Op) -> &mut Self {
            self.code.push(op as u8);
            self
        }

        fn op8(&mut self, op: Op, arg: u8) -> &mut Self {
            self.code.push(op as u8);
            self.code.push(arg);
            self
        }

        fn op16(&mut self, op: Op, arg: u16) -> &mut Self {
            self.code.push(op as u8);
            self.code.push((arg >> 8) as u8);
            self.code.push(arg as u8);
            self
        }

        fn view(&self) -> RecordView<'_> {
            RecordView {
                code: &self.code,
                constants: &self.constants,
                stack: &self.stack,
                module_vars: &self.module_vars,
                symbols: &self.symbols,
                range_class: 0,
            }
        }
    }

    fn recorder(num_slots: usize) -> Recorder {
        Recorder::start(0, num_slots, &JitConfig::default()).unwrap()
    }

    fn ops_of(rec: &Recorder) -> Vec<IrOp> {
        rec.ir
            .nodes()
            .iter()
            .filter(|n| n.op != IrOp::Nop)
            .map(|n| n.op)
            .collect()
    }

    #[test]
    fn test_startup_protocol() {
        let config = JitConfig::default();
        let rec = Recorder::start(12, 2, &config).unwrap();
        // Pre-header no-ops, then the header, then one load per slot.
        let header = rec.ir.loop_header().unwrap();
        assert_eq!(header as usize, config.pre_header_slots as usize);
        let loads: Vec<_> = rec
            .ir
            .nodes()
            .iter()
            .filter(|n| n.op == IrOp::LoadStack)
            .collect();
        assert_eq!(loads.len(), 2);
        assert_eq!(rec.stack_top, 2);
    }

    #[test]
    fn test_numeric_binary_call_shape() {
        let mut h = Harness::new();
        let plus = h.symbols.lookup("+(_)").unwrap();
        h.op8(Op::LoadLocal, 0);
        h.op8(Op::LoadLocal, 1);
        h.op16(Op::Call1, plus);
        // Slots 0/1 are the locals; 2/3 are the pushed copies the call
        // will observe.
        h.stack[0] = Value::num(2.0);
        h.stack[1] = Value::num(3.0);
        h.stack[2] = Value::num(2.0);
        h.stack[3] = Value::num(3.0);

        let mut rec = recorder(2);
        let mut pc = 0;
        for _ in 0..3 {
            let view = h.view();
            assert_eq!(rec.step(&view, pc), StepResult::Continue);
            pc += Op::from_byte(h.code[pc]).unwrap().len();
        }

        let ops = ops_of(&rec);
        // Snapshot, two guards, two unboxes, the add, and the re-box.
        assert!(ops.contains(&IrOp::Snapshot));
        assert_eq!(ops.iter().filter(|&&o| o == IrOp::GuardNum).count(), 2);
        assert_eq!(ops.iter().filter(|&&o| o == IrOp::UnboxNum).count(), 2);
        assert!(ops.contains(&IrOp::Add));
        assert!(ops.contains(&IrOp::BoxNum));
        // Binary call pops one: receiver slot now holds the boxed result.
        assert_eq!(rec.stack_top, 1);
    }

    #[test]
    fn test_comparison_boxes_bool() {
        let mut h = Harness::new();
        let lt = h.symbols.lookup("<(_)").unwrap();
        h.op8(Op::LoadLocal, 0);
        h.op8(Op::LoadLocal, 1);
        h.op16(Op::Call1, lt);
        h.stack[0] = Value::num(1.0);
        h.stack[1] = Value::num(2.0);
        h.stack[2] = Value::num(1.0);
        h.stack[3] = Value::num(2.0);

        let mut rec = recorder(2);
        let mut pc = 0;
        for _ in 0..3 {
            let view = h.view();
            rec.step(&view, pc);
            pc += Op::from_byte(h.code[pc]).unwrap().len();
        }

        let ops = ops_of(&rec);
        assert!(ops.contains(&IrOp::Lt));
        assert!(ops.contains(&IrOp::BoxBool));
        assert!(!ops.contains(&IrOp::BoxNum));
    }

    #[test]
    fn test_jump_if_biases_guard() {
        // Truthy condition: falls through, guard-true against the taken
        // target as the deopt path.
        let mut h = Harness::new();
        h.op8(Op::LoadLocal, 0);
        h.op16(Op::JumpIf, 10);
        h.stack[0] = Value::TRUE;
        h.stack[1] = Value::TRUE; // the pushed copy the branch pops

        let mut rec = recorder(1);
        let view = h.view();
        rec.step(&view, 0);
        rec.step(&view, 2);

        let ops = ops_of(&rec);
        assert!(ops.contains(&IrOp::GuardTrue));
        // Snapshot resumes at the not-taken (jump) target: 2 + 3 + 10.
        let snap = rec.ir.snapshot(rec.ir.snapshot_count() as u16 - 1);
        assert_eq!(snap.resume_pc, 15);
        assert_eq!(rec.stack_top, 0);
    }

    #[test]
    fn test_jump_if_falsy_guards_false() {
        let mut h = Harness::new();
        h.op8(Op::LoadLocal, 0);
        h.op16(Op::JumpIf, 10);
        h.stack[0] = Value::FALSE;
        h.stack[1] = Value::FALSE;

        let mut rec = recorder(1);
        let view = h.view();
        rec.step(&view, 0);
        rec.step(&view, 2);

        let ops = ops_of(&rec);
        assert!(ops.contains(&IrOp::GuardFalse));
        let snap = rec.ir.snapshot(rec.ir.snapshot_count() as u16 - 1);
        assert_eq!(snap.resume_pc, 5); // fall-through
    }

    #[test]
    fn test_loop_to_anchor_completes() {
        let mut h = Harness::new();
        h.op(Op::Pop);
        // Loop back to pc 0: offset = pc + 3 - target = 1 + 3 - 0.
        h.op16(Op::Loop, 4);
        h.stack[0] = Value::num(1.0);

        let mut rec = recorder(1);
        let view = h.view();
        assert_eq!(rec.step(&view, 0), StepResult::Continue);
        assert_eq!(rec.step(&view, 1), StepResult::Complete);
        assert!(rec.ir.loop_back().is_some());
    }

    #[test]
    fn test_loop_to_other_target_aborts() {
        let mut h = Harness::new();
        h.op(Op::Pop);
        h.op16(Op::Loop, 3); // target pc 1, not the anchor
        h.stack[0] = Value::num(1.0);

        let mut rec = recorder(1);
        let view = h.view();
        rec.step(&view, 0);
        assert_eq!(
            rec.step(&view, 1),
            StepResult::Abort(AbortReason::NonAnchorLoopTarget)
        );
    }

    #[test]
    fn test_unsupported_receiver_aborts() {
        let mut h = Harness::new();
        let plus = h.symbols.lookup("+(_)").unwrap();
        h.op8(Op::LoadLocal, 0);
        h.op8(Op::LoadLocal, 1);
        h.op16(Op::Call1, plus);
        h.stack[0] = Value::TRUE; // not a number, not a range
        h.stack[1] = Value::num(1.0);
        h.stack[2] = Value::TRUE;
        h.stack[3] = Value::num(1.0);

        let mut rec = recorder(2);
        let view = h.view();
        rec.step(&view, 0);
        rec.step(&view, 2);
        assert_eq!(
            rec.step(&view, 4),
            StepResult::Abort(AbortReason::UnsupportedReceiver)
        );
    }

    #[test]
    fn test_call_arity_aborts() {
        let mut h = Harness::new();
        h.op16(Op::CallN, 0);
        let mut rec = recorder(0);
        let view = h.view();
        assert_eq!(
            rec.step(&view, 0),
            StepResult::Abort(AbortReason::UnsupportedCallArity)
        );
    }

    #[test]
    fn test_return_from_root_aborts() {
        let mut h = Harness::new();
        h.op(Op::Return);
        let mut rec = recorder(0);
        let view = h.view();
        assert_eq!(
            rec.step(&view, 0),
            StepResult::Abort(AbortReason::ReturnFromRoot)
        );
    }

    #[test]
    fn test_instruction_limit_aborts() {
        let mut h = Harness::new();
        h.op(Op::True);
        h.op(Op::Pop);
        let config = JitConfig {
            max_instructions_per_trace: 10,
            ..JitConfig::default()
        };
        let mut rec = Recorder::start(0, 0, &config).unwrap();
        let view = h.view();
        let mut steps = 0;
        loop {
            let pc = steps % 2;
            match rec.step(&view, pc) {
                StepResult::Continue => steps += 1,
                StepResult::Abort(reason) => {
                    assert_eq!(reason, AbortReason::TraceTooLong);
                    break;
                }
                StepResult::Complete => panic!("unexpected completion"),
            }
        }
        // Stops exactly at the limit plus one.
        assert_eq!(steps, 10);
    }

    #[test]
    fn test_store_local_does_not_pop() {
        let mut h = Harness::new();
        h.op(Op::True);
        h.op8(Op::StoreLocal, 0);
        let mut rec = recorder(1);
        let view = h.view();
        rec.step(&view, 0);
        let before = rec.stack_top;
        rec.step(&view, 1);
        assert_eq!(rec.stack_top, before);
        assert!(ops_of(&rec).contains(&IrOp::StoreStack));
    }

    #[test]
    fn test_module_var_roundtrip() {
        let mut h = Harness::new();
        h.op16(Op::LoadModuleVar, 1);
        h.op16(Op::StoreModuleVar, 2);
        let mut rec = recorder(0);
        let view = h.view();
        rec.step(&view, 0);
        rec.step(&view, 3);
        let ops = ops_of(&rec);
        assert!(ops.contains(&IrOp::LoadModuleVar));
        assert!(ops.contains(&IrOp::StoreModuleVar));
        assert_eq!(rec.stack_top, 1); // store does not pop
    }

    #[test]
    fn test_module_var_out_of_range_aborts() {
        let mut h = Harness::new();
        h.op16(Op::LoadModuleVar, 99);
        let mut rec = recorder(0);
        let view = h.view();
        assert_eq!(
            rec.step(&view, 0),
            StepResult::Abort(AbortReason::ModuleVarOutOfRange)
        );
    }
}
