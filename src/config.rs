//! JIT configuration.

use serde::{Deserialize, Serialize};

/// Tunable limits and switches for the trace compiler.
///
/// The defaults match the values the engine was measured with; embedders
/// mostly only touch `enabled` and `hot_threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitConfig {
    /// Master switch. When off, recording and trace execution are inert.
    pub enabled: bool,
    /// Backward-branch count at an anchor PC before recording begins.
    pub hot_threshold: u16,
    /// Initial trace cache capacity. Must be a power of two.
    pub trace_cache_capacity: usize,
    /// Recording aborts after this many bytecode instructions.
    pub max_instructions_per_trace: u32,
    /// Recording aborts past this call depth.
    pub max_call_depth: u32,
    /// No-op slots reserved before the loop header for hoisting and
    /// loop-variable promotion. Always even.
    pub pre_header_slots: u16,
    /// Emit `[JIT]` diagnostics to stderr.
    pub verbose: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_threshold: 50,
            trace_cache_capacity: 1024,
            max_instructions_per_trace: 1000,
            max_call_depth: 8,
            pre_header_slots: 12,
            verbose: false,
        }
    }
}
