//! leakwatch-core: Core library for leakwatch
//!
//! This crate detects resource leaks in long GUI test runs by snapshotting
//! process resources at test boundaries and failing tests whose resource
//! usage grew beyond tolerance.
//!
//! # Architecture
//!
//! ```text
//! Test hooks → LifecycleController → Snapshot::collect(Introspector)
//!                      ↓
//!              ReconciliationLoop ⇄ UiLoop (pump event loop)
//!                      ↓
//!         Diff → ToleranceEvaluator → Verdict → LeakReport
//!                                                  ↑
//!                                    AllowlistPolicy (presentation)
//! ```
//!
//! # Modules
//!
//! - `introspect`: Raw resource reads from procfs and the managed runtime
//! - `snapshot`: Point-in-time resource records and diffs
//! - `allowlist`: Known-benign thread patterns stripped from reports
//! - `tolerance`: Per-category growth thresholds and verdicts
//! - `reconcile`: Bounded check/pump retry loop
//! - `lifecycle`: Test-boundary orchestration and baseline ownership
//! - `report`: Human-readable leak reports
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod allowlist;
pub mod config;
pub mod error;
pub mod introspect;
pub mod lifecycle;
pub mod logging;
pub mod reconcile;
pub mod report;
pub mod snapshot;
pub mod tolerance;

pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{CheckOutcome, LifecycleController, TestContext};
pub use snapshot::{Diff, Snapshot};
pub use tolerance::{Category, Verdict};
