//! Linear-scan register allocation over the trace IR.
//!
//! Two register classes: general-purpose for values, pointers, booleans
//! and integers, floating-point for unboxed doubles. Each class has a
//! scratch pool whose first two registers stay reserved as code-generator
//! temporaries; the FP class additionally owns four callee-saved
//! registers. Values that cannot get a register spill to consecutively
//! numbered frame slots.
//!
//! PHIs compile to no code, so a PHI, its pre-loop input, and its
//! back-edge input are coalesced into a single interval under the PHI's
//! id; they share one register and the back-edge computation lands
//! directly where the next iteration reads it.

use crate::error::{Error, Result};
use crate::ir::{IrBuffer, IrOp, IrRef, IrType, NONE};

pub const GP_SCRATCH_COUNT: usize = 6;
pub const FP_SCRATCH_COUNT: usize = 6;
pub const FP_SAVED_COUNT: usize = 4;
/// R0/R1 and FR0/FR1 are codegen temporaries, never allocated.
pub const RESERVED_TEMPS: usize = 2;

/// Register class needed by an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Gp,
    Fp,
}

/// A physical register, tagged with its originating pool so expiration
/// returns it to the right free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolReg {
    GpScratch(u8),
    FpScratch(u8),
    FpSaved(u8),
}

impl PoolReg {
    pub fn class(self) -> RegClass {
        match self {
            PoolReg::GpScratch(_) => RegClass::Gp,
            PoolReg::FpScratch(_) | PoolReg::FpSaved(_) => RegClass::Fp,
        }
    }
}

/// Where an SSA value lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Reg(PoolReg),
    /// Index of an 8-byte frame slot.
    Spill(u16),
}

/// Live interval of one SSA value (or one coalesced PHI group).
#[derive(Debug, Clone, Copy)]
pub struct LiveRange {
    pub ssa: IrRef,
    pub start: IrRef,
    pub end: IrRef,
    pub class: RegClass,
    pub alloc: Option<Allocation>,
}

fn classify(ty: IrType) -> RegClass {
    if ty == IrType::Num {
        RegClass::Fp
    } else {
        RegClass::Gp
    }
}

/// Allocator state and results.
pub struct RegAllocator {
    ranges: Vec<LiveRange>,
    map: Vec<Option<Allocation>>,
    leader: Vec<IrRef>,
    gp_free: [bool; GP_SCRATCH_COUNT],
    fp_scratch_free: [bool; FP_SCRATCH_COUNT],
    fp_saved_free: [bool; FP_SAVED_COUNT],
    next_spill: u16,
    max_spill: u16,
}

impl RegAllocator {
    /// Compute live ranges for `buf` and run the scan.
    pub fn allocate(buf: &IrBuffer) -> Result<RegAllocator> {
        let mut ra = RegAllocator {
            ranges: Vec::new(),
            map: vec![None; buf.len()],
            leader: (0..buf.len() as IrRef).collect(),
            gp_free: [true; GP_SCRATCH_COUNT],
            fp_scratch_free: [true; FP_SCRATCH_COUNT],
            fp_saved_free: [true; FP_SAVED_COUNT],
            next_spill: 0,
            max_spill: 0,
        };
        for i in 0..RESERVED_TEMPS {
            ra.gp_free[i] = false;
            ra.fp_scratch_free[i] = false;
        }
        ra.compute_ranges(buf)?;
        ra.scan();
        Ok(ra)
    }

    /// Allocation of an SSA value, resolving PHI coalescing.
    pub fn allocation(&self, ssa: IrRef) -> Option<Allocation> {
        let leader = self.leader.get(ssa as usize).copied()? as usize;
        self.map.get(leader).copied().flatten()
    }

    /// Number of spill slots used; determines the frame size.
    pub fn spill_slot_count(&self) -> u16 {
        self.max_spill
    }

    pub fn ranges(&self) -> &[LiveRange] {
        &self.ranges
    }

    /// True when `a` and `b` resolved to the same location.
    pub fn same_allocation(&self, a: IrRef, b: IrRef) -> bool {
        self.allocation(a).is_some() && self.allocation(a) == self.allocation(b)
    }

    // ----- Live range computation -----

    fn compute_ranges(&mut self, buf: &IrBuffer) -> Result<()> {
        let len = buf.len();

        // Coalesce each PHI with its operands. An operand already claimed
        // by another PHI, or itself a PHI, keeps its own interval and gets
        // a resolution move from the code generator instead.
        for i in 0..len as IrRef {
            let n = buf.node(i);
            if n.op != IrOp::Phi || n.is_dead() {
                continue;
            }
            for op in [n.op1, n.op2] {
                if op == NONE || (op as usize) >= len {
                    continue;
                }
                if buf.node(op).op == IrOp::Phi {
                    continue;
                }
                if self.leader[op as usize] == op {
                    self.leader[op as usize] = i;
                }
            }
        }

        let mut defined = vec![false; len];
        let mut start = vec![0 as IrRef; len];
        let mut end = vec![0 as IrRef; len];
        let mut class = vec![RegClass::Gp; len];

        // Definitions and operand uses.
        for i in 0..len as IrRef {
            let n = buf.node(i);
            if n.is_dead() || n.op == IrOp::Nop || n.ty == IrType::Void {
                // Still extend operand uses of void nodes (stores, guards).
            } else {
                let leader = self.leader[i as usize] as usize;
                if !defined[leader] {
                    defined[leader] = true;
                    start[leader] = i;
                    end[leader] = end[leader].max(i);
                    class[leader] = classify(buf.node(leader as IrRef).ty);
                } else {
                    start[leader] = start[leader].min(i);
                    end[leader] = end[leader].max(i);
                }
            }
            if n.is_dead() || n.op == IrOp::Nop {
                continue;
            }
            for op in n.operands() {
                if op == NONE || (op as usize) >= len {
                    continue;
                }
                let leader = self.leader[op as usize] as usize;
                if defined[leader] && i > end[leader] {
                    end[leader] = i;
                }
            }
        }

        // A value defined before the loop and used inside it is read again
        // on every iteration; its interval runs through the back edge.
        let loop_bounds = match (buf.loop_header(), buf.loop_back()) {
            (Some(h), Some(b)) => Some((h, b)),
            _ => None,
        };
        if let Some((header, back)) = loop_bounds {
            for i in header..=back {
                let n = buf.node(i);
                if n.is_dead() || n.op == IrOp::Nop {
                    continue;
                }
                for op in n.operands() {
                    if op == NONE || (op as usize) >= len || op >= header {
                        continue;
                    }
                    let leader = self.leader[op as usize] as usize;
                    if defined[leader] && back > end[leader] {
                        end[leader] = back;
                    }
                }
            }
        }

        // Snapshot entries stay live through the last side exit that
        // consumes their snapshot.
        let mut last_exit = vec![0 as IrRef; buf.snapshot_count()];
        for i in 0..len as IrRef {
            let n = buf.node(i);
            if n.is_dead() {
                continue;
            }
            if n.op.is_guard() || n.op == IrOp::SideExit {
                if let Some(snap) = n.snapshot_id() {
                    if (snap as usize) < last_exit.len() {
                        last_exit[snap as usize] = last_exit[snap as usize].max(i);
                    }
                }
            }
        }
        for snap in 0..buf.snapshot_count() as u16 {
            let mut exit = last_exit[snap as usize];
            // An exit inside the loop can fire on any iteration; its
            // snapshot values must survive the back edge like any other
            // loop-crossing interval.
            if let Some((header, back)) = loop_bounds {
                if exit > header {
                    exit = exit.max(back);
                }
            }
            for entry in buf.snapshot_entries(snap) {
                if entry.ssa == NONE || (entry.ssa as usize) >= len {
                    continue;
                }
                let leader = self.leader[entry.ssa as usize] as usize;
                if defined[leader] && exit > end[leader] {
                    end[leader] = exit;
                }
            }
        }

        // PHIs (and their coalesced groups) live through the loop back
        // edge: the next iteration reads them at the header.
        let loop_end = buf.loop_back().unwrap_or((len.max(1) - 1) as IrRef);
        for i in 0..len as IrRef {
            let n = buf.node(i);
            if n.op != IrOp::Phi || n.is_dead() {
                continue;
            }
            let leader = self.leader[i as usize] as usize;
            if defined[leader] {
                end[leader] = end[leader].max(loop_end);
            }
            // A non-coalesced back-edge operand must also survive to the
            // back edge, where its value is copied into the PHI register.
            if n.op2 != NONE && (n.op2 as usize) < len {
                let ol = self.leader[n.op2 as usize] as usize;
                if defined[ol] {
                    end[ol] = end[ol].max(loop_end);
                }
            }
        }

        for id in 0..len {
            if !defined[id] {
                continue;
            }
            self.ranges.push(LiveRange {
                ssa: id as IrRef,
                start: start[id],
                end: end[id],
                class: class[id],
                alloc: None,
            });
        }
        if self.ranges.len() > crate::ir::MAX_NODES {
            return Err(Error::LiveRangeOverflow(self.ranges.len()));
        }
        self.ranges.sort_by_key(|r| (r.start, r.end));
        Ok(())
    }

    // ----- Linear scan -----

    fn take_reg(&mut self, class: RegClass) -> Option<PoolReg> {
        match class {
            RegClass::Gp => {
                for i in 0..GP_SCRATCH_COUNT {
                    if self.gp_free[i] {
                        self.gp_free[i] = false;
                        return Some(PoolReg::GpScratch(i as u8));
                    }
                }
                None
            }
            RegClass::Fp => {
                for i in 0..FP_SCRATCH_COUNT {
                    if self.fp_scratch_free[i] {
                        self.fp_scratch_free[i] = false;
                        return Some(PoolReg::FpScratch(i as u8));
                    }
                }
                for i in 0..FP_SAVED_COUNT {
                    if self.fp_saved_free[i] {
                        self.fp_saved_free[i] = false;
                        return Some(PoolReg::FpSaved(i as u8));
                    }
                }
                None
            }
        }
    }

    fn release_reg(&mut self, reg: PoolReg) {
        match reg {
            PoolReg::GpScratch(i) => self.gp_free[i as usize] = true,
            PoolReg::FpScratch(i) => self.fp_scratch_free[i as usize] = true,
            PoolReg::FpSaved(i) => self.fp_saved_free[i as usize] = true,
        }
    }

    fn new_spill(&mut self) -> Allocation {
        let slot = self.next_spill;
        self.next_spill += 1;
        self.max_spill = self.max_spill.max(self.next_spill);
        Allocation::Spill(slot)
    }

    fn scan(&mut self) {
        // Indices into self.ranges, kept sorted by end ascending.
        let mut active: Vec<usize> = Vec::new();

        for idx in 0..self.ranges.len() {
            let (cur_start, cur_end, cur_class) = {
                let r = &self.ranges[idx];
                (r.start, r.end, r.class)
            };

            // Expire intervals that ended before this one starts.
            while let Some(&first) = active.first() {
                if self.ranges[first].end >= cur_start {
                    break;
                }
                if let Some(Allocation::Reg(reg)) = self.ranges[first].alloc {
                    self.release_reg(reg);
                }
                active.remove(0);
            }

            let alloc = match self.take_reg(cur_class) {
                Some(reg) => Allocation::Reg(reg),
                None => {
                    // Steal from the same-class active range with the
                    // furthest end, or spill the current range.
                    let victim = active
                        .iter()
                        .rposition(|&ri| self.ranges[ri].class == cur_class);
                    match victim {
                        Some(pos) if self.ranges[active[pos]].end > cur_end => {
                            let vi = active.remove(pos);
                            let stolen = self.ranges[vi].alloc.take();
                            let spill = self.new_spill();
                            self.ranges[vi].alloc = Some(spill);
                            self.map[self.ranges[vi].ssa as usize] = Some(spill);
                            stolen.unwrap_or_else(|| self.new_spill())
                        }
                        _ => self.new_spill(),
                    }
                }
            };

            self.ranges[idx].alloc = Some(alloc);
            self.map[self.ranges[idx].ssa as usize] = Some(alloc);

            if matches!(alloc, Allocation::Reg(_)) {
                let pos = active
                    .iter()
                    .position(|&ri| self.ranges[ri].end > cur_end)
                    .unwrap_or(active.len());
                active.insert(pos, idx);
            }
        }
    }
}
