//! Miniature host VM for end-to-end trace compiler tests.
//!
//! A small stack interpreter over the bytecode subset the recorder
//! understands, wired to the JIT exactly as a production interpreter loop
//! would be: hot counters bump on backward branches, executed instructions
//! are offered to the recorder before they run, installed traces execute
//! at their anchors, and side exits resume interpretation at the
//! snapshot's target. A shadow recorder captures the optimized IR of the
//! first compiled trace so tests can assert on its shape.

use rustc_hash::FxHashMap as HashMap;

use quickstep::bytecode::{read_u16, read_u8, Opcode};
use quickstep::ir::IrBuffer;
use quickstep::recorder::{Recorder, StepResult};
use quickstep::value::RangeObj;
use quickstep::{EntryArgs, Jit, JitConfig, RecordView, SymbolTable, Value};

pub const RANGE_CLASS: u64 = 0x5ead_1000;

/// Bytecode assembler for test programs.
pub struct ProgramBuilder {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub symbols: SymbolTable,
    ranges: Vec<Box<RangeObj>>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        for name in [
            "+(_)", "-(_)", "*(_)", "/(_)", "%(_)", "<(_)", ">(_)", "<=(_)", ">=(_)", "==(_)",
            "!=(_)", "-", "abs", "iterate(_)", "iteratorValue(_)",
        ] {
            symbols.ensure(name);
        }
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            symbols,
            ranges: Vec::new(),
        }
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.code.push(op as u8);
        self
    }

    pub fn op8(&mut self, op: Opcode, arg: u8) -> &mut Self {
        self.code.push(op as u8);
        self.code.push(arg);
        self
    }

    pub fn op16(&mut self, op: Opcode, arg: u16) -> &mut Self {
        self.code.push(op as u8);
        self.code.push((arg >> 8) as u8);
        self.code.push(arg as u8);
        self
    }

    /// Push a numeric constant instruction.
    pub fn num(&mut self, value: f64) -> &mut Self {
        let index = self.intern_const(Value::num(value));
        self.op16(Opcode::Constant, index)
    }

    /// Push a range constant instruction; the object lives as long as the
    /// builder/VM does.
    pub fn range(&mut self, from: f64, to: f64, inclusive: bool) -> &mut Self {
        let obj = Box::new(RangeObj::new(RANGE_CLASS, from, to, inclusive));
        let ptr = Box::as_ref(&obj) as *const RangeObj as u64;
        self.ranges.push(obj);
        let index = self.intern_const(Value::from_obj_ptr(ptr));
        self.op16(Opcode::Constant, index)
    }

    fn intern_const(&mut self, value: Value) -> u16 {
        let index = self.constants.len() as u16;
        self.constants.push(value);
        index
    }

    /// Binary method call by spelling.
    pub fn call1(&mut self, name: &str) -> &mut Self {
        let symbol = self.symbols.lookup(name).expect("unknown method symbol");
        self.op16(Opcode::Call1, symbol)
    }

    pub fn call0(&mut self, name: &str) -> &mut Self {
        let symbol = self.symbols.lookup(name).expect("unknown method symbol");
        self.op16(Opcode::Call0, symbol)
    }

    /// Emit a forward branch with a zero offset; patch it later.
    pub fn forward(&mut self, op: Opcode) -> usize {
        let at = self.here();
        self.op16(op, 0);
        at
    }

    /// Point the forward branch at `at` to the current position.
    pub fn patch_to_here(&mut self, at: usize) {
        let offset = (self.here() - (at + 3)) as u16;
        self.code[at + 1] = (offset >> 8) as u8;
        self.code[at + 2] = offset as u8;
    }

    /// Backward branch to `target`.
    pub fn loop_to(&mut self, target: usize) -> &mut Self {
        let offset = (self.here() + 3 - target) as u16;
        self.op16(Opcode::Loop, offset)
    }
}

/// Interpreter + JIT harness.
pub struct TestVm {
    code: Vec<u8>,
    constants: Vec<Value>,
    symbols: SymbolTable,
    _ranges: Vec<Box<RangeObj>>,
    pub stack: Vec<Value>,
    pub module_vars: Vec<Value>,
    pub jit: Jit,
    hot_counts: HashMap<usize, u16>,
    shadow: Option<Recorder>,
    /// Optimized IR of the first completed recording.
    pub captured_ir: Option<IrBuffer>,
    /// Number of side exits taken from compiled traces.
    pub deopts: u64,
    config: JitConfig,
}

impl TestVm {
    pub fn new(builder: ProgramBuilder, module_var_count: usize, config: JitConfig) -> Self {
        Self {
            code: builder.code,
            constants: builder.constants,
            symbols: builder.symbols,
            _ranges: builder.ranges,
            stack: vec![Value::NULL; 64],
            module_vars: vec![Value::num(0.0); module_var_count],
            jit: Jit::new(config.clone()),
            hot_counts: HashMap::default(),
            shadow: None,
            captured_ir: None,
            deopts: 0,
            config,
        }
    }

    pub fn set_var(&mut self, index: usize, value: f64) {
        self.module_vars[index] = Value::num(value);
    }

    pub fn var(&self, index: usize) -> f64 {
        assert!(self.module_vars[index].is_num(), "module var {} not numeric", index);
        self.module_vars[index].as_num()
    }

    fn entry_args(&mut self) -> EntryArgs {
        EntryArgs {
            vm: 0,
            frame: 0,
            stack_base: self.stack.as_mut_ptr() as *mut u64,
            module_vars: self.module_vars.as_mut_ptr() as *mut u64,
        }
    }

    /// Interpret from pc 0 until the top-level return.
    pub fn run(&mut self) {
        let mut pc = 0usize;
        let mut sp = 0usize;
        let mut fuel: u64 = 10_000_000;

        loop {
            fuel -= 1;
            assert!(fuel > 0, "interpreter ran away");

            // Dispatch to an installed trace at its anchor.
            if !self.jit.is_recording() && self.jit.has_trace(pc) {
                let args = self.entry_args();
                match self.jit.execute(pc, &args) {
                    Some(target) => {
                        self.deopts += 1;
                        pc = target.resume_pc;
                        sp = target.stack_depth;
                        continue;
                    }
                    None => unreachable!("trace completed without a side exit"),
                }
            }

            // Offer the instruction to the recorder (and the shadow) with
            // the pre-execution state.
            if self.jit.is_recording() {
                let view = RecordView {
                    code: &self.code,
                    constants: &self.constants,
                    stack: &self.stack,
                    module_vars: &self.module_vars,
                    symbols: &self.symbols,
                    range_class: RANGE_CLASS,
                };
                if let Some(mut shadow) = self.shadow.take() {
                    match shadow.step(&view, pc) {
                        StepResult::Complete => {
                            let mut ir = shadow.into_ir();
                            quickstep::opt::optimize(&mut ir);
                            self.captured_ir.get_or_insert(ir);
                        }
                        StepResult::Abort(_) => {}
                        StepResult::Continue => self.shadow = Some(shadow),
                    }
                }
                self.jit.record_instruction(&view, pc);
            }

            // Execute.
            let op = Opcode::from_byte(self.code[pc]).expect("undecodable opcode");
            let mut next_pc = pc + op.len();
            match op {
                Opcode::Constant => {
                    let index = read_u16(&self.code, pc) as usize;
                    self.stack[sp] = self.constants[index];
                    sp += 1;
                }
                Opcode::Null => {
                    self.stack[sp] = Value::NULL;
                    sp += 1;
                }
                Opcode::False => {
                    self.stack[sp] = Value::FALSE;
                    sp += 1;
                }
                Opcode::True => {
                    self.stack[sp] = Value::TRUE;
                    sp += 1;
                }
                Opcode::LoadLocal => {
                    let slot = read_u8(&self.code, pc) as usize;
                    self.stack[sp] = self.stack[slot];
                    sp += 1;
                }
                Opcode::StoreLocal => {
                    let slot = read_u8(&self.code, pc) as usize;
                    self.stack[slot] = self.stack[sp - 1];
                }
                Opcode::LoadModuleVar => {
                    let index = read_u16(&self.code, pc) as usize;
                    self.stack[sp] = self.module_vars[index];
                    sp += 1;
                }
                Opcode::StoreModuleVar => {
                    let index = read_u16(&self.code, pc) as usize;
                    self.module_vars[index] = self.stack[sp - 1];
                }
                Opcode::Pop => sp -= 1,
                Opcode::Call0 => {
                    let symbol = read_u16(&self.code, pc);
                    let recv = self.stack[sp - 1];
                    self.stack[sp - 1] = self.dispatch_unary(symbol, recv);
                }
                Opcode::Call1 => {
                    let symbol = read_u16(&self.code, pc);
                    let recv = self.stack[sp - 2];
                    let arg = self.stack[sp - 1];
                    let result = self.dispatch_binary(symbol, recv, arg);
                    sp -= 1;
                    self.stack[sp - 1] = result;
                }
                Opcode::Jump => {
                    next_pc = pc + 3 + read_u16(&self.code, pc) as usize;
                }
                Opcode::JumpIf => {
                    sp -= 1;
                    if self.stack[sp].is_falsy() {
                        next_pc = pc + 3 + read_u16(&self.code, pc) as usize;
                    }
                }
                Opcode::And => {
                    if self.stack[sp - 1].is_falsy() {
                        next_pc = pc + 3 + read_u16(&self.code, pc) as usize;
                    } else {
                        sp -= 1;
                    }
                }
                Opcode::Or => {
                    if !self.stack[sp - 1].is_falsy() {
                        next_pc = pc + 3 + read_u16(&self.code, pc) as usize;
                    } else {
                        sp -= 1;
                    }
                }
                Opcode::Loop => {
                    let offset = read_u16(&self.code, pc) as usize;
                    let target = pc + 3 - offset;
                    next_pc = target;

                    let counter = self.hot_counts.entry(target).or_insert(0);
                    if self.jit.note_loop_edge(counter) && !self.jit.is_recording() {
                        self.jit.start_recording(target, sp);
                        if self.jit.is_recording() {
                            self.shadow =
                                Recorder::start(target, sp, &self.config).ok();
                        }
                    }
                }
                Opcode::Return => return,
                Opcode::LoadFieldThis
                | Opcode::StoreFieldThis
                | Opcode::LoadField
                | Opcode::StoreField
                | Opcode::CallN
                | Opcode::LoadUpvalue
                | Opcode::StoreUpvalue => {
                    panic!("opcode {:?} not implemented by the test interpreter", op)
                }
            }
            pc = next_pc;
        }
    }

    fn dispatch_unary(&self, symbol: u16, recv: Value) -> Value {
        let name = self.symbols.name(symbol).expect("bad symbol");
        assert!(recv.is_num(), "unary {} on non-number", name);
        let n = recv.as_num();
        match name {
            "-" => Value::num(-n),
            "abs" => Value::num(n.abs()),
            other => panic!("unary method {} not implemented", other),
        }
    }

    fn dispatch_binary(&self, symbol: u16, recv: Value, arg: Value) -> Value {
        let name = self.symbols.name(symbol).expect("bad symbol");
        if recv.is_num() {
            let a = recv.as_num();
            let b = arg.as_num();
            return match name {
                "+(_)" => Value::num(a + b),
                "-(_)" => Value::num(a - b),
                "*(_)" => Value::num(a * b),
                "/(_)" => Value::num(a / b),
                "%(_)" => Value::num(a % b),
                "<(_)" => Value::from_bool(a < b),
                ">(_)" => Value::from_bool(a > b),
                "<=(_)" => Value::from_bool(a <= b),
                ">=(_)" => Value::from_bool(a >= b),
                "==(_)" => Value::from_bool(a == b),
                "!=(_)" => Value::from_bool(a != b),
                other => panic!("binary method {} not implemented", other),
            };
        }
        if recv.class_ptr() == Some(RANGE_CLASS) {
            let range = unsafe { recv.as_range() };
            return match name {
                "iterate(_)" => range_iterate(range, arg),
                "iteratorValue(_)" => arg,
                other => panic!("range method {} not implemented", other),
            };
        }
        panic!("binary {} on unsupported receiver", name);
    }
}

/// The host's range iteration primitive: null starts at `from`, each call
/// advances by one toward `to`, and stepping out of range yields false.
fn range_iterate(range: &RangeObj, iterator: Value) -> Value {
    if iterator.is_null() {
        if range.from == range.to && range.is_inclusive == 0 {
            return Value::FALSE;
        }
        return Value::num(range.from);
    }
    let i = iterator.as_num();
    let next = if range.is_ascending() { i + 1.0 } else { i - 1.0 };
    let in_range = match (range.is_ascending(), range.is_inclusive != 0) {
        (true, true) => next <= range.to,
        (true, false) => next < range.to,
        (false, true) => next >= range.to,
        (false, false) => next > range.to,
    };
    if in_range {
        Value::num(next)
    } else {
        Value::FALSE
    }
}
