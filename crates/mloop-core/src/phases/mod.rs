//! Per-cycle phases.
//!
//! Each phase module is a set of pure-ish functions over the workspace;
//! process supervision lives in [`crate::runner`] and sequencing in
//! [`crate::orchestrator`].

pub mod analysis;
pub mod training;
