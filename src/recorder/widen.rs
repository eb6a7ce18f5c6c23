//! Monomorphic widening for the range iteration primitives.
//!
//! `for` loops desugar into `iterate(_)` / `iteratorValue(_)` calls on the
//! sequence. When the receiver is a range, both calls inline to a few IR
//! nodes: the iteration step becomes an add with a bound check, and the
//! iterator value is the iterator itself. Direction, bound, and
//! inclusivity are read from the concrete receiver at record time and
//! frozen into the trace; the class guard keeps the speculation honest.
//! Every other non-numeric receiver declines, which aborts the trace.

use super::{AbortReason, Recorder};
use crate::host::RecordView;
use crate::ir::{IrOp, IrType};
use crate::value::Value;

impl Recorder {
    /// Try to inline a binary call on a non-numeric receiver. Returns
    /// `Ok(false)` when the receiver or method is not supported.
    pub(crate) fn try_widen_call1(
        &mut self,
        view: &RecordView<'_>,
        symbol: u16,
        pc: usize,
    ) -> Result<bool, AbortReason> {
        if self.stack_top < 2 {
            return Ok(false);
        }
        let recv_slot = self.stack_top - 2;
        let arg_slot = self.stack_top - 1;
        let recv_val = view.stack[recv_slot];

        if recv_val.class_ptr() != Some(view.range_class) {
            return Ok(false);
        }
        let name = view.symbols.name(symbol).unwrap_or("");
        let is_iterate = name == "iterate(_)";
        let is_iter_value = name == "iteratorValue(_)";
        if !is_iterate && !is_iter_value {
            return Ok(false);
        }

        let snap = self.emit_snapshot_here(pc)?;
        let recv = self.ensure_slot(recv_slot)?;
        let arg = self.ensure_slot(arg_slot)?;
        self.ir.emit_guard_class(recv, view.range_class, snap)?;

        if is_iterate {
            self.inline_range_iterate(recv_val, recv_slot, snap, arg)?;
        } else {
            // iteratorValue: the iterator is the value. Guard it is a
            // number and alias it as the result.
            self.ir.emit_guard_num(arg, snap)?;
            self.stack_top -= 1;
            self.slot_kill(self.stack_top);
            self.slot_set(recv_slot, arg);
        }
        Ok(true)
    }

    fn inline_range_iterate(
        &mut self,
        recv_val: Value,
        recv_slot: usize,
        snap: u16,
        arg: u16,
    ) -> Result<(), AbortReason> {
        // Direction and bound are fixed at record time. The first
        // iteration passes null and is never seen here: the loop only
        // gets hot after the iterator is already numeric.
        let range = unsafe { recv_val.as_range() };
        let ascending = range.is_ascending();
        let inclusive = range.is_inclusive != 0;
        let step = if ascending { 1.0 } else { -1.0 };
        let limit = range.to;

        self.ir.emit_guard_num(arg, snap)?;
        let iter = self.ir.emit_unbox_num(arg)?;
        let step_ssa = self.ir.emit_const_num(step)?;
        let next = self.ir.emit(IrOp::Add, iter, step_ssa, IrType::Num)?;

        // Exit the trace when the advanced iterator leaves the range:
        // ascending guards <= / < of the bound, descending >= / >.
        let limit_ssa = self.ir.emit_const_num(limit)?;
        let cmp_op = match (ascending, inclusive) {
            (true, true) => IrOp::Lte,
            (true, false) => IrOp::Lt,
            (false, true) => IrOp::Gte,
            (false, false) => IrOp::Gt,
        };
        let in_range = self.ir.emit(cmp_op, next, limit_ssa, IrType::Bool)?;
        let boxed_cmp = self.ir.emit_box_bool(in_range)?;
        self.ir.emit_guard_true(boxed_cmp, snap)?;

        let boxed_iter = self.ir.emit_box_num(next)?;
        self.stack_top -= 1;
        self.slot_kill(self.stack_top);
        self.slot_set(recv_slot, boxed_iter);
        Ok(())
    }

}
