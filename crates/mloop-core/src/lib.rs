//! Core library for mloop: an orchestrator for iterative ML training
//! improvement loops.
//!
//! Each cycle invokes an external code-generation agent, runs training as a
//! supervised subprocess, ingests metrics and analysis from file contracts,
//! captures per-cycle artifacts, and applies a safeguard/plateau stop policy
//! over the metric history.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod phases;
pub mod runner;
pub mod state;
pub mod stopping;
