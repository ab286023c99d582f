//! Bounded retry that pumps the UI event loop before declaring a leak.
//!
//! Native window teardown is asynchronous: disposing a widget queues work for
//! the windowing system that only completes once the event loop runs again.
//! When a check fails and the calling thread owns a live event loop, the loop
//! is pumped one iteration at a time and the check repeated until it passes
//! or the budget runs out.
//!
//! ```text
//! CHECKING ──pass──────────────────────────► PASSED
//!    │
//!    ├──fail, no live loop──────────────────► FAILED
//!    ├──fail, budget spent──────────────────► FAILED
//!    └──fail──► PUMPING ──pump, re-collect──► CHECKING
//! ```
//!
//! On FAILED the caller's baseline is replaced with a fresh snapshot so the
//! next test is not charged for this one.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::config::ReconcileConfig;
use crate::introspect::Introspector;
use crate::snapshot::{Diff, Snapshot};
use crate::tolerance::{Category, ToleranceEvaluator, Verdict};

/// The toolkit's event loop, as seen from the test thread.
pub trait UiLoop {
    /// Whether the calling thread currently owns a live event loop.
    fn has_live_loop(&self) -> bool;

    /// Dispatch at most one pending event. Returns whether anything was
    /// processed; this is accounting only, never a termination signal.
    fn pump_once(&mut self) -> bool;
}

/// For hosts without an event loop: every failed check is final.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUiLoop;

impl UiLoop for NoUiLoop {
    fn has_live_loop(&self) -> bool {
        false
    }

    fn pump_once(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Checking,
    Pumping,
    Passed,
    Failed,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checking => write!(f, "CHECKING"),
            Self::Pumping => write!(f, "PUMPING"),
            Self::Passed => write!(f, "PASSED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Terminal result of a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    /// `Passed` or `Failed`.
    pub state: ReconcileState,
    /// Verdict of the last check.
    pub verdict: Verdict,
    /// Diff of the last check against the baseline it was judged against.
    pub diff: Diff,
    /// Baseline the diff was computed from.
    pub before: Snapshot,
    /// Snapshot of the last check.
    pub after: Snapshot,
    /// Event-loop iterations spent.
    pub pumps: u32,
    /// Iterations in which the loop reported dispatching something.
    pub busy_pumps: u32,
    pub elapsed: Duration,
}

impl Reconciliation {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.state == ReconcileState::Passed
    }
}

/// Runs the check/pump state machine.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationLoop {
    evaluator: ToleranceEvaluator,
    budget: ReconcileConfig,
}

impl ReconciliationLoop {
    #[must_use]
    pub fn new(evaluator: ToleranceEvaluator, budget: ReconcileConfig) -> Self {
        Self { evaluator, budget }
    }

    #[must_use]
    pub fn evaluator(&self) -> &ToleranceEvaluator {
        &self.evaluator
    }

    #[must_use]
    pub fn budget(&self) -> &ReconcileConfig {
        &self.budget
    }

    fn budget_spent(&self, pumps: u32, started: Instant) -> bool {
        if pumps >= self.budget.max_iterations {
            return true;
        }
        self.budget
            .max_duration()
            .is_some_and(|limit| started.elapsed() >= limit)
    }

    /// Check the current state against `baseline`, pumping `ui` as needed.
    ///
    /// On failure `baseline` is replaced by a freshly collected snapshot.
    pub fn run<P, U>(
        &self,
        baseline: &mut Snapshot,
        probe: &P,
        ui: &mut U,
        allowed: &BTreeSet<Category>,
    ) -> Reconciliation
    where
        P: Introspector + ?Sized,
        U: UiLoop + ?Sized,
    {
        let started = Instant::now();
        let mut pumps = 0_u32;
        let mut busy_pumps = 0_u32;

        let mut after = Snapshot::collect(probe);
        let mut diff = Diff::between(baseline, &after);
        let mut verdict = self.evaluator.evaluate_allowing(&diff, allowed);
        let mut state = ReconcileState::Checking;

        loop {
            trace!(%state, pumps, "reconcile step");
            state = match state {
                ReconcileState::Checking => {
                    if verdict.passed() {
                        ReconcileState::Passed
                    } else if !ui.has_live_loop() {
                        debug!(%verdict, "no live event loop; failing immediately");
                        ReconcileState::Failed
                    } else if self.budget_spent(pumps, started) {
                        debug!(%verdict, pumps, "reconcile budget exhausted");
                        ReconcileState::Failed
                    } else {
                        ReconcileState::Pumping
                    }
                }
                ReconcileState::Pumping => {
                    if ui.pump_once() {
                        busy_pumps += 1;
                    }
                    pumps += 1;
                    after = Snapshot::collect(probe);
                    diff = Diff::between(baseline, &after);
                    verdict = self.evaluator.evaluate_allowing(&diff, allowed);
                    ReconcileState::Checking
                }
                ReconcileState::Passed | ReconcileState::Failed => break,
            };
        }

        let before = baseline.clone();
        if state == ReconcileState::Failed {
            warn!(%verdict, pumps, "resource growth persisted; resetting baseline");
            *baseline = Snapshot::collect(probe);
        } else if pumps > 0 {
            debug!(pumps, busy_pumps, "pending cleanup absorbed by event loop");
        }

        Reconciliation {
            state,
            verdict,
            diff,
            before,
            after,
            pumps,
            busy_pumps,
            elapsed: started.elapsed(),
        }
    }
}
