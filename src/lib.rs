//! Seed scheduling core for a coverage-guided greybox fuzzer.
//!
//! This crate implements the three tightly coupled subsystems that decide,
//! between target executions, which seed to mutate next: favored-set
//! culling over a top-rated table (Component C), an alternative
//! frontier-node set-cover policy (Components D/E), and a weighted
//! alias-table sampler with a bounded testcase-content cache (Components
//! F/G/H). A fourth subsystem, periodic external corpus minimization
//! (Component I), mutates the same queue state out-of-band on a timer.
//!
//! The mutation operators, target execution harness, coverage-bitmap
//! instrumentation runtime, CLI, and LLVM instrumentation passes that
//! produce the CFG are all out of scope — see [`cfg::SuccessorMap`] and
//! the crate-level [`Scheduler`] for where this core's boundary with
//! those collaborators sits.
//!
//! [`Scheduler`] is the single entry point: it owns every piece of
//! mutable state the other modules describe and is what a fuzzer's main
//! loop holds onto across executions. Component I (periodic external
//! minimization) forks and execs a real subprocess via `nix`, so it and
//! the `Scheduler` that drives it are only built on `unix` with the
//! `std` feature enabled — matching this core's own Non-goal of
//! portability to non-POSIX-like filesystems.

pub mod bitmap;
pub mod cfg;
#[cfg(feature = "std")]
pub mod config;
pub mod corpus;
pub mod error;
#[cfg(all(feature = "std", unix))]
pub mod minimize;
pub mod rand;
#[cfg(all(feature = "std", unix))]
mod scheduler;
pub mod schedulers;
pub mod text;

#[cfg(feature = "std")]
pub use config::{FileNameStyle, InstrumentationMode, MinimizerConfig, SchedulerConfig};
pub use error::Error;
#[cfg(all(feature = "std", unix))]
pub use minimize::{MinimizerDriver, MinimizerOutcome};
#[cfg(all(feature = "std", unix))]
pub use scheduler::Scheduler;
