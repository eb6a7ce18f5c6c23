//! Top-level JIT engine: recording state machine, compile pipeline, trace
//! dispatch, and statistics.
//!
//! The interpreter drives this synchronously: it bumps hot counters on
//! backward branches, feeds executed instructions to the recorder while a
//! recording is live, and transfers control to installed traces at their
//! anchors. Compilation is eager — it runs the moment the recorder sees
//! the loop close.

use serde::Serialize;

use crate::backend::{Backend, EntryArgs, EvalBackend};
use crate::codegen;
use crate::config::JitConfig;
use crate::error::{Error, Result};
use crate::host::RecordView;
use crate::opt;
use crate::recorder::{Recorder, StepResult};
use crate::regalloc::RegAllocator;
use crate::trace::{CompiledTrace, DeoptTarget, TraceCache};

/// Counters surfaced to embedders. No JIT failure is user-visible except
/// through these.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JitStats {
    pub traces_compiled: u64,
    pub traces_aborted: u64,
    pub total_exits: u64,
}

/// What happened to the instruction just offered to the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSignal {
    /// No recording is in progress.
    NotRecording,
    /// Recorded; keep feeding instructions.
    Recording,
    /// The loop closed and a trace was compiled and installed.
    Installed,
    /// Recording ended without a trace.
    Aborted,
}

enum State {
    Idle,
    Recording(Box<Recorder>),
}

type BackendFactory = Box<dyn Fn() -> Box<dyn Backend>>;

/// The trace compiler engine, one per VM instance.
pub struct Jit {
    config: JitConfig,
    cache: TraceCache,
    state: State,
    stats: JitStats,
    backend_factory: BackendFactory,
}

impl Jit {
    /// Engine with the portable evaluating backend.
    pub fn new(config: JitConfig) -> Jit {
        Self::with_backend(config, Box::new(|| Box::new(EvalBackend::new())))
    }

    /// Engine with a custom assembler backend.
    pub fn with_backend(config: JitConfig, backend_factory: BackendFactory) -> Jit {
        let capacity = config.trace_cache_capacity;
        Jit {
            config,
            cache: TraceCache::new(capacity),
            state: State::Idle,
            stats: JitStats::default(),
            backend_factory,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Master switch; disabling also drops any in-progress recording.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.state = State::Idle;
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state, State::Recording(_))
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    /// Bump a backward-branch counter. True exactly when the loop just
    /// crossed the hot threshold and recording should begin.
    pub fn note_loop_edge(&self, counter: &mut u16) -> bool {
        if !self.config.enabled {
            return false;
        }
        *counter = counter.saturating_add(1);
        *counter == self.config.hot_threshold
    }

    /// Begin recording at `anchor` with `num_slots` live interpreter
    /// slots. No-op while disabled or already recording.
    pub fn start_recording(&mut self, anchor: usize, num_slots: usize) {
        if !self.config.enabled || self.is_recording() {
            return;
        }
        match Recorder::start(anchor, num_slots, &self.config) {
            Ok(recorder) => {
                if self.config.verbose {
                    eprintln!("[JIT] recording at pc {}", anchor);
                }
                self.state = State::Recording(Box::new(recorder));
            }
            Err(err) => {
                if self.config.verbose {
                    eprintln!("[JIT] recording failed to start: {}", err);
                }
                self.stats.traces_aborted += 1;
            }
        }
    }

    /// Drop the current recording (e.g. on a fiber switch).
    pub fn abort_recording(&mut self) {
        if self.is_recording() {
            self.state = State::Idle;
            self.stats.traces_aborted += 1;
        }
    }

    /// Offer the instruction at `pc` to the recorder. On loop closure the
    /// trace is optimized, compiled, and installed before this returns.
    pub fn record_instruction(&mut self, view: &RecordView<'_>, pc: usize) -> RecordSignal {
        let recorder = match &mut self.state {
            State::Recording(recorder) => recorder,
            State::Idle => return RecordSignal::NotRecording,
        };

        match recorder.step(view, pc) {
            StepResult::Continue => RecordSignal::Recording,
            StepResult::Abort(reason) => {
                if self.config.verbose {
                    eprintln!("[JIT] abort: {}", reason);
                }
                self.state = State::Idle;
                self.stats.traces_aborted += 1;
                RecordSignal::Aborted
            }
            StepResult::Complete => {
                let recorder = match std::mem::replace(&mut self.state, State::Idle) {
                    State::Recording(recorder) => recorder,
                    State::Idle => unreachable!(),
                };
                match self.compile(*recorder) {
                    Ok(()) => RecordSignal::Installed,
                    Err(err) => {
                        if self.config.verbose {
                            eprintln!("[JIT] compile failed: {}", err);
                        }
                        self.stats.traces_aborted += 1;
                        RecordSignal::Aborted
                    }
                }
            }
        }
    }

    fn compile(&mut self, recorder: Recorder) -> Result<()> {
        let anchor = recorder.anchor();
        let mut ir = recorder.into_ir();

        // A trace without snapshots would compile to an inescapable loop.
        if ir.snapshot_count() == 0 {
            return Err(Error::NoSnapshots);
        }

        opt::optimize(&mut ir);

        // Invariant violations are bugs: loud in debug builds, a plain
        // compile failure in release.
        if let Err(err) = ir.validate() {
            debug_assert!(false, "IR invariant violated: {}", err);
            return Err(err);
        }

        let ra = RegAllocator::allocate(&ir)?;

        let mut backend = (self.backend_factory)();
        let output = codegen::generate(&ir, &ra, backend.as_mut())?;
        let code = backend.finalize()?;

        if self.config.verbose {
            eprintln!(
                "[JIT] compiled trace at pc {} ({} nodes, {} snapshots, {} spills)",
                anchor,
                ir.len(),
                ir.snapshot_count(),
                ra.spill_slot_count()
            );
        }

        self.cache
            .insert(CompiledTrace::new(anchor, code, output.snapshots, output.gc_roots));
        self.stats.traces_compiled += 1;
        Ok(())
    }

    /// Installed trace at `anchor`, if any.
    pub fn trace_at(&self, anchor: usize) -> Option<&CompiledTrace> {
        if !self.config.enabled {
            return None;
        }
        self.cache.lookup(anchor)
    }

    pub fn has_trace(&self, anchor: usize) -> bool {
        self.trace_at(anchor).is_some()
    }

    /// Execute the trace at `anchor`. Returns the deopt target of the side
    /// exit that ended execution, or None when there is no trace (or the
    /// trace somehow completed without one).
    pub fn execute(&mut self, anchor: usize, args: &EntryArgs) -> Option<DeoptTarget> {
        if !self.config.enabled {
            return None;
        }
        let trace = self.cache.lookup_mut(anchor)?;
        let result = trace.execute(args);
        let target = trace.exit_target(result);
        if result != 0 {
            self.stats.total_exits += 1;
        }
        target
    }

    /// Gray every object-pointer constant embedded in installed traces.
    pub fn mark_roots(&self, gray: &mut dyn FnMut(u64)) {
        for trace in self.cache.iter() {
            for &root in &trace.gc_roots {
                gray(root);
            }
        }
    }

    /// Number of installed traces.
    pub fn trace_count(&self) -> usize {
        self.cache.len()
    }
}
