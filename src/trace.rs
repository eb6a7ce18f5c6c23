//! Compiled traces, the trace cache, and deoptimization targets.

use crate::backend::{EntryArgs, TraceCode};

/// Deoptimization snapshot carried by a compiled trace: where the
/// interpreter resumes and how deep its stack is at that point. The
/// slot-to-SSA entries record what the side-exit stub wrote back.
#[derive(Debug, Clone)]
pub struct TraceSnapshot {
    pub resume_pc: usize,
    pub stack_depth: usize,
    pub entries: Vec<(u16, u16)>,
}

/// Where the interpreter resumes after a side exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptTarget {
    pub resume_pc: usize,
    pub stack_depth: usize,
    pub exit_index: usize,
}

/// An installed trace: executable code plus the tables the runtime needs.
pub struct CompiledTrace {
    pub anchor: usize,
    pub snapshots: Vec<TraceSnapshot>,
    pub gc_roots: Vec<u64>,
    pub exec_count: u64,
    pub exit_count: u64,
    code: Box<dyn TraceCode>,
}

impl CompiledTrace {
    pub fn new(
        anchor: usize,
        code: Box<dyn TraceCode>,
        snapshots: Vec<TraceSnapshot>,
        gc_roots: Vec<u64>,
    ) -> Self {
        Self {
            anchor,
            snapshots,
            gc_roots,
            exec_count: 0,
            exit_count: 0,
            code,
        }
    }

    /// Run the trace. Returns the raw result word: 0 for loop-back
    /// completion, `exit_index + 1` for a side exit.
    pub fn execute(&mut self, args: &EntryArgs) -> u64 {
        self.exec_count += 1;
        let result = self.code.execute(args);
        if result != 0 {
            self.exit_count += 1;
        }
        result
    }

    /// Resolve a nonzero execute result to its deopt target. The side-exit
    /// stub already wrote the live values back to the interpreter stack;
    /// nothing remains beyond the pointer adjustments described here.
    pub fn exit_target(&self, result: u64) -> Option<DeoptTarget> {
        if result == 0 {
            return None;
        }
        let exit_index = (result - 1) as usize;
        self.snapshots.get(exit_index).map(|snap| DeoptTarget {
            resume_pc: snap.resume_pc,
            stack_depth: snap.stack_depth,
            exit_index,
        })
    }

    pub fn code_size(&self) -> usize {
        self.code.code_size()
    }
}

/// Open-addressed trace cache keyed by anchor PC.
pub struct TraceCache {
    slots: Vec<Option<CompiledTrace>>,
    len: usize,
}

fn hash_anchor(anchor: usize) -> usize {
    (anchor >> 2).wrapping_mul(2_654_435_761)
}

impl TraceCache {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Probe index of `anchor`: its occupied slot, or the first empty slot
    /// on its chain.
    fn probe(&self, anchor: usize) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut idx = hash_anchor(anchor) & mask;
        for _ in 0..self.slots.len() {
            match self.slots[idx].as_ref().map(|t| t.anchor) {
                None => return Some(idx),
                Some(a) if a == anchor => return Some(idx),
                Some(_) => idx = (idx + 1) & mask,
            }
        }
        None
    }

    pub fn lookup(&self, anchor: usize) -> Option<&CompiledTrace> {
        let idx = self.probe(anchor)?;
        self.slots[idx].as_ref().filter(|t| t.anchor == anchor)
    }

    pub fn lookup_mut(&mut self, anchor: usize) -> Option<&mut CompiledTrace> {
        let idx = self.probe(anchor)?;
        self.slots[idx].as_mut().filter(|t| t.anchor == anchor)
    }

    /// Install a trace. An existing trace at the same anchor is replaced
    /// (dropping it frees its code and tables). Grows by doubling at a
    /// load factor of 0.7.
    pub fn insert(&mut self, trace: CompiledTrace) {
        if self.len * 10 >= self.capacity() * 7 {
            self.grow();
        }
        let idx = match self.probe(trace.anchor) {
            Some(idx) => idx,
            None => {
                // Every slot occupied by other anchors; force room.
                self.grow();
                self.probe(trace.anchor).expect("capacity after growth")
            }
        };
        if self.slots[idx].is_none() {
            self.len += 1;
        }
        self.slots[idx] = Some(trace);
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity() * 2;
        let old: Vec<Option<CompiledTrace>> = std::mem::replace(
            &mut self.slots,
            (0..new_capacity).map(|_| None).collect(),
        );
        let mask = new_capacity - 1;
        for trace in old.into_iter().flatten() {
            let mut idx = hash_anchor(trace.anchor) & mask;
            while self.slots[idx].is_some() {
                idx = (idx + 1) & mask;
            }
            self.slots[idx] = Some(trace);
        }
    }

    /// Iterate installed traces (for GC root marking and stats).
    pub fn iter(&self) -> impl Iterator<Item = &CompiledTrace> {
        self.slots.iter().flatten()
    }
}
