//! Quickstep: a tracing JIT compiler core for NaN-boxed bytecode VMs
//!
//! Quickstep watches a dynamically typed interpreter run, records hot
//! loops as linear SSA traces, optimizes them, and compiles them to native
//! code with speculative type guards that deoptimize back to the
//! interpreter when the speculation fails. The host VM stays in charge of
//! everything else: parsing, the interpreter loop, the object model, and
//! garbage collection.
//!
//! # Pipeline
//!
//! One compiled trace flows: [`recorder`] → [`opt`] → [`regalloc`] →
//! [`codegen`] → [`trace`] (install + dispatch), coordinated by
//! [`jit::Jit`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`ir`], [`recorder`], [`opt`], [`regalloc`], [`codegen`] |
//! | **Runtime** | [`jit`], [`trace`], [`backend`] |
//! | **Host interface** | [`value`], [`bytecode`], [`host`] |
//! | **Support** | [`config`], [`error`](Error) |
//!
//! # Quick start
//!
//! ```no_run
//! use quickstep::{Jit, JitConfig};
//!
//! let mut jit = Jit::new(JitConfig::default());
//! let mut hot_count = 0u16;
//! // In the interpreter's backward-branch handler:
//! if jit.note_loop_edge(&mut hot_count) {
//!     jit.start_recording(/* anchor pc */ 0, /* live slots */ 0);
//! }
//! ```
// Clippy configuration for the trace compiler.
//
// These suppressions exist because:
// - too_many_arguments: lowering helpers pass emission context
// - needless_range_loop: index-based loops mirror SSA-id indexing
// - new_without_default: engine construction requires a config
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::new_without_default)]

pub mod backend;
pub mod bytecode;
pub mod codegen;
pub mod config;
pub mod error;
pub mod host;
pub mod ir;
pub mod jit;
pub mod opt;
pub mod recorder;
pub mod regalloc;
pub mod trace;
pub mod value;

pub use backend::{Backend, EntryArgs, EvalBackend, TraceCode};
pub use config::JitConfig;
pub use error::{Error, Result};
pub use host::{RecordView, SymbolTable};
pub use jit::{Jit, JitStats, RecordSignal};
pub use trace::{CompiledTrace, DeoptTarget, TraceCache};
pub use value::Value;
