//! Test-boundary orchestration.
//!
//! A [`LifecycleController`] is created once per test run and driven from
//! the test framework's four hooks. It owns the baseline snapshot; nothing
//! else reads or writes it.
//!
//! ```text
//! on_suite_start ──► initial (first ever), suite baseline, baseline
//! on_test_start  ──► baseline = collect()
//! on_test_end    ──► ReconciliationLoop(baseline) ──► Ok | Err(LeakDetected)
//!                        └── failure resets baseline
//! on_suite_end   ──► suite-level check when per-test checks are off
//! ```

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::allowlist::AllowlistPolicy;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::introspect::{FilteredIntrospector, Introspector, ProcIntrospector};
use crate::reconcile::{NoUiLoop, Reconciliation, ReconciliationLoop, UiLoop};
use crate::report::LeakReport;
use crate::snapshot::Snapshot;
use crate::tolerance::{Category, ToleranceEvaluator};

/// Identity and leniency of one test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestContext {
    pub suite: String,
    pub name: String,
    /// Categories this test may grow without failing.
    pub allowed_leak_categories: BTreeSet<Category>,
}

impl TestContext {
    #[must_use]
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            name: name.into(),
            allowed_leak_categories: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn allowing(mut self, category: Category) -> Self {
        self.allowed_leak_categories.insert(category);
        self
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        if self.suite.is_empty() {
            self.name.clone()
        } else {
            format!("{}::{}", self.suite, self.name)
        }
    }
}

/// Result of a passing (or skipped) boundary check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No check ran at this boundary.
    Skipped,
    /// Within tolerance, possibly after pumping the event loop.
    Passed {
        pumps: u32,
        waived: BTreeSet<Category>,
    },
}

/// Holds the baseline and runs the leak check at test boundaries.
pub struct LifecycleController<P = ProcIntrospector, U = NoUiLoop> {
    config: Config,
    probe: P,
    ui: U,
    allowlist: AllowlistPolicy,
    reconciler: ReconciliationLoop,
    initial: Option<Snapshot>,
    suite_baseline: Option<Snapshot>,
    baseline: Option<Snapshot>,
    suite: Option<String>,
}

impl LifecycleController {
    /// Controller for the current process, without an event loop.
    pub fn for_current_process(config: Config) -> Result<Self> {
        Self::new(config, ProcIntrospector::current(), NoUiLoop)
    }
}

impl<P: Introspector, U: UiLoop> LifecycleController<P, U> {
    pub fn new(config: Config, probe: P, ui: U) -> Result<Self> {
        config.validate()?;
        let allowlist = config.allowlist_policy()?;
        let reconciler = ReconciliationLoop::new(
            ToleranceEvaluator::new(config.thresholds.clone()),
            config.reconcile.clone(),
        );
        Ok(Self {
            config,
            probe,
            ui,
            allowlist,
            reconciler,
            initial: None,
            suite_baseline: None,
            baseline: None,
            suite: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn ui_mut(&mut self) -> &mut U {
        &mut self.ui
    }

    /// Baseline the next test end is compared against.
    #[must_use]
    pub fn baseline(&self) -> Option<&Snapshot> {
        self.baseline.as_ref()
    }

    /// First snapshot of the run.
    #[must_use]
    pub fn initial(&self) -> Option<&Snapshot> {
        self.initial.as_ref()
    }

    pub fn on_suite_start(&mut self, suite: &str) {
        if !self.config.enabled {
            return;
        }
        let snapshot = self.collect();
        self.report_stage("Starting suite", suite, &snapshot);
        if self.initial.is_none() {
            self.initial = Some(snapshot.clone());
        }
        self.suite_baseline = Some(snapshot.clone());
        self.baseline = Some(snapshot);
        self.suite = Some(suite.to_string());
    }

    pub fn on_suite_end(&mut self) -> Result<CheckOutcome> {
        let suite = self.suite.take().unwrap_or_default();
        if !self.config.enabled {
            return Ok(CheckOutcome::Skipped);
        }
        if self.config.verbose {
            let snapshot = self.collect();
            self.report_stage("Finished suite", &suite, &snapshot);
        }
        if self.config.collect_on_each_test {
            return Ok(CheckOutcome::Skipped);
        }

        let mut baseline = match self.suite_baseline.take() {
            Some(baseline) => baseline,
            None => {
                warn!(suite = %suite, "suite ended without a baseline; skipping check");
                return Ok(CheckOutcome::Skipped);
            }
        };
        let outcome = self.reconciler.run(
            &mut baseline,
            &FilteredIntrospector::new(&self.probe, &self.config.descriptors),
            &mut self.ui,
            &BTreeSet::new(),
        );
        self.baseline = Some(baseline);
        self.conclude(&suite, &outcome)
    }

    pub fn on_test_start(&mut self, ctx: &TestContext) {
        if !self.config.enabled || !self.config.collect_on_each_test {
            return;
        }
        let snapshot = self.collect();
        self.report_stage("Starting test", &ctx.display_name(), &snapshot);
        if self.initial.is_none() {
            self.initial = Some(snapshot.clone());
        }
        self.baseline = Some(snapshot);
    }

    /// Check the test for growth. A leak that survives reconciliation is
    /// returned as [`Error::LeakDetected`]; the baseline has already been
    /// reset by then.
    pub fn on_test_end(&mut self, ctx: &TestContext) -> Result<CheckOutcome> {
        if !self.config.enabled || !self.config.collect_on_each_test {
            return Ok(CheckOutcome::Skipped);
        }
        let name = ctx.display_name();

        let mut baseline = match self.baseline.take() {
            Some(baseline) => baseline,
            None => {
                warn!(test = %name, "test ended without a baseline; skipping check");
                self.baseline = Some(self.collect());
                return Ok(CheckOutcome::Skipped);
            }
        };
        let outcome = self.reconciler.run(
            &mut baseline,
            &FilteredIntrospector::new(&self.probe, &self.config.descriptors),
            &mut self.ui,
            &ctx.allowed_leak_categories,
        );
        self.baseline = Some(baseline);
        if self.config.verbose {
            self.report_stage("Finished test", &name, &outcome.after);
        }
        self.conclude(&name, &outcome)
    }

    /// Snapshot through the configured descriptor filter.
    fn collect(&self) -> Snapshot {
        Snapshot::collect(&FilteredIntrospector::new(&self.probe, &self.config.descriptors))
    }

    fn conclude(&self, name: &str, outcome: &Reconciliation) -> Result<CheckOutcome> {
        if outcome.passed() {
            if !outcome.verdict.waived.is_empty() {
                debug!(test = name, waived = ?outcome.verdict.waived, "allowed growth waived");
            }
            return Ok(CheckOutcome::Passed {
                pumps: outcome.pumps,
                waived: outcome.verdict.waived.clone(),
            });
        }

        let report = LeakReport::from_reconciliation(
            name,
            outcome,
            &self.allowlist,
            self.initial.as_ref(),
        );
        warn!(
            test = name,
            verdict = %outcome.verdict,
            pumps = outcome.pumps,
            "resource leak detected"
        );
        debug!(test = name, "diff report:\n{}", report.diff);
        Err(Error::LeakDetected(Box::new(report)))
    }

    fn report_stage(&self, stage: &str, name: &str, snapshot: &Snapshot) {
        if self.config.verbose {
            info!(stage, test = name, ">>> {stage}: {name}\n{snapshot}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Counts;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Replays scripted snapshots; repeats the last one when exhausted.
    struct ScriptedProbe {
        script: RefCell<VecDeque<(i64, Vec<&'static str>)>>,
        current: RefCell<(i64, Vec<&'static str>)>,
    }

    impl ScriptedProbe {
        fn new(script: Vec<(i64, Vec<&'static str>)>) -> Self {
            Self {
                script: RefCell::new(script.into()),
                current: RefCell::new((0, Vec::new())),
            }
        }
    }

    impl Introspector for ScriptedProbe {
        fn quiesce(&self) {
            if let Some(next) = self.script.borrow_mut().pop_front() {
                *self.current.borrow_mut() = next;
            }
        }
        fn resident_memory(&self) -> i64 {
            self.current.borrow().0
        }
        fn managed_memory(&self) -> i64 {
            0
        }
        fn os_thread_names(&self) -> Vec<String> {
            self.current
                .borrow()
                .1
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        }
        fn managed_thread_names(&self) -> Vec<String> {
            Vec::new()
        }
        fn open_descriptor_paths(&self) -> Vec<Option<String>> {
            Vec::new()
        }
    }

    fn threads(names: &[&str]) -> Counts {
        crate::snapshot::group_by_name(names.iter().copied())
    }

    #[test]
    fn test_context_display_name() {
        assert_eq!(TestContext::new("Shell", "dispose").display_name(), "Shell::dispose");
        assert_eq!(TestContext::new("", "dispose").display_name(), "dispose");
        let ctx = TestContext::new("S", "t").allowing(Category::OpenDescriptors);
        assert!(ctx.allowed_leak_categories.contains(&Category::OpenDescriptors));
    }

    #[test]
    fn clean_test_passes() {
        let probe = ScriptedProbe::new(vec![(1000, vec!["A"]), (1000, vec!["A"]), (1000, vec!["A"])]);
        let mut ctl = LifecycleController::new(Config::default(), probe, NoUiLoop).unwrap();
        let ctx = TestContext::new("Suite", "clean");
        ctl.on_suite_start("Suite");
        ctl.on_test_start(&ctx);
        let outcome = ctl.on_test_end(&ctx).unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Passed {
                pumps: 0,
                waived: BTreeSet::new()
            }
        );
    }

    #[test]
    fn leaked_thread_fails_and_resets_baseline() {
        let probe = ScriptedProbe::new(vec![
            (1000, vec!["A"]),      // suite start
            (1000, vec!["A"]),      // test start
            (1000, vec!["A", "B"]), // test end
            (1000, vec!["A", "B"]), // baseline reset
        ]);
        let mut ctl = LifecycleController::new(Config::default(), probe, NoUiLoop).unwrap();
        let ctx = TestContext::new("Suite", "leaks");
        ctl.on_suite_start("Suite");
        ctl.on_test_start(&ctx);

        let err = ctl.on_test_end(&ctx).unwrap_err();
        let report = err.leak_report().expect("leak report");
        assert_eq!(report.test_name, "Suite::leaks");
        assert_eq!(
            report.verdict.failed,
            BTreeSet::from([Category::OsThreads])
        );
        assert_eq!(report.diff.system_threads, threads(&["B"]));
        assert_eq!(
            ctl.baseline().map(Snapshot::system_threads),
            Some(&threads(&["A", "B"]))
        );
    }

    #[test]
    fn allowed_category_passes_with_waiver() {
        let probe = ScriptedProbe::new(vec![(1000, vec!["A"]), (1000, vec!["A", "B"])]);
        let mut ctl = LifecycleController::new(Config::default(), probe, NoUiLoop).unwrap();
        let ctx = TestContext::new("Suite", "spawns_pool").allowing(Category::OsThreads);
        ctl.on_test_start(&ctx);
        match ctl.on_test_end(&ctx).unwrap() {
            CheckOutcome::Passed { waived, .. } => {
                assert_eq!(waived, BTreeSet::from([Category::OsThreads]));
            }
            other => panic!("expected pass, got {other:?}"),
        }
    }

    #[test]
    fn disabled_controller_skips_everything() {
        let probe = ScriptedProbe::new(vec![(1000, vec!["A"]), (9_000_000, vec!["A", "B"])]);
        let config = Config {
            enabled: false,
            ..Config::default()
        };
        let mut ctl = LifecycleController::new(config, probe, NoUiLoop).unwrap();
        let ctx = TestContext::new("Suite", "t");
        ctl.on_suite_start("Suite");
        ctl.on_test_start(&ctx);
        assert_eq!(ctl.on_test_end(&ctx).unwrap(), CheckOutcome::Skipped);
        assert_eq!(ctl.on_suite_end().unwrap(), CheckOutcome::Skipped);
        assert!(ctl.baseline().is_none());
    }

    #[test]
    fn suite_level_checks_when_per_test_disabled() {
        let probe = ScriptedProbe::new(vec![
            (1000, vec!["A"]),      // suite start
            (1000, vec!["A", "B"]), // suite end
            (1000, vec!["A", "B"]), // reset
        ]);
        let config = Config {
            collect_on_each_test: false,
            ..Config::default()
        };
        let mut ctl = LifecycleController::new(config, probe, NoUiLoop).unwrap();
        let ctx = TestContext::new("Suite", "t");
        ctl.on_suite_start("Suite");
        ctl.on_test_start(&ctx);
        assert_eq!(ctl.on_test_end(&ctx).unwrap(), CheckOutcome::Skipped);
        let err = ctl.on_suite_end().unwrap_err();
        assert_eq!(err.leak_report().map(|r| r.test_name.as_str()), Some("Suite"));
    }

    #[test]
    fn missing_baseline_skips_and_records_one() {
        let probe = ScriptedProbe::new(vec![(1000, vec!["A"])]);
        let mut ctl = LifecycleController::new(Config::default(), probe, NoUiLoop).unwrap();
        let ctx = TestContext::new("Suite", "orphan");
        assert_eq!(ctl.on_test_end(&ctx).unwrap(), CheckOutcome::Skipped);
        assert!(ctl.baseline().is_some());
    }

    #[test]
    fn initial_snapshot_is_kept_across_suites() {
        let probe = ScriptedProbe::new(vec![(1000, vec!["A"]), (2000, vec!["A"])]);
        let mut ctl = LifecycleController::new(Config::default(), probe, NoUiLoop).unwrap();
        ctl.on_suite_start("First");
        ctl.on_suite_end().unwrap();
        ctl.on_suite_start("Second");
        assert_eq!(ctl.initial().map(Snapshot::used_system_memory), Some(1000));
        assert_eq!(ctl.baseline().map(Snapshot::used_system_memory), Some(2000));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = Config::default();
        config.allowlist.push(crate::config::AllowlistEntry {
            pattern: "(".to_string(),
            quota: None,
        });
        let probe = ScriptedProbe::new(Vec::new());
        assert!(matches!(
            LifecycleController::new(config, probe, NoUiLoop),
            Err(Error::Config(_))
        ));
    }
}
