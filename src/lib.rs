//! This crate provides a generic fixpoint dataflow analysis engine for a
//! stack bytecode.
//!
//! An analysis supplies an abstract value type (see
//! [`state::AbstractValue`]) and per-opcode transfer functions (a
//! [`dispatch::Receiver`]); the worklist drivers of [`analysis`] iterate
//! those transfer functions over the bytecode until a fixpoint is reached,
//! merging abstract states wherever control flow joins. Results are
//! retrieved either as a single whole-program final state, or per
//! instruction through a replay cache.
//!
//! Termination of the fixpoint loops is guaranteed only for monotone
//! abstract domains of finite join height; this is an obligation of the
//! analysis, not enforced by the engine.

pub mod analysis;
pub mod code;
pub mod dispatch;
pub mod errors;
pub mod state;

pub use crate::analysis::{BackwardAnalysis, BackwardStates, ForwardAnalysis, ForwardStates};
