//! Worklist fixpoint drivers.
//!
//! Two traversal directions, each with two retrieval strategies:
//!
//! - [`ForwardAnalysis`] / [`BackwardAnalysis`] iterate the abstract
//!   interpretation to a fixpoint and report a single merged final state;
//! - [`ForwardStates`] / [`BackwardStates`] additionally reconstruct the
//!   abstract state at any single instruction, replaying from the nearest
//!   stored merge point through an amortized cache.
//!
//! A driver owns every abstract state it creates (initial, current, final,
//! merge-point snapshots, retrieval cache); `invalidate` or dropping the
//! driver releases them all. Branches are processed depth-first, newest
//! work first; under a monotone finite-height domain the worklist order
//! only affects iteration counts, never the fixpoint itself.

mod backward;
mod forward;

pub use backward::{BackwardAnalysis, BackwardStates};
pub use forward::{ForwardAnalysis, ForwardStates};
