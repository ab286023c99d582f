//! Human-readable leak reports.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::allowlist::AllowlistPolicy;
use crate::error::Result;
use crate::reconcile::Reconciliation;
use crate::snapshot::{Diff, Snapshot};
use crate::tolerance::Verdict;

/// Everything needed to diagnose a failed check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakReport {
    /// `suite::test` or the suite name for suite-level checks.
    pub test_name: String,
    pub verdict: Verdict,
    /// Event-loop iterations spent before giving up.
    pub pumps: u32,
    /// Growth against the test's baseline.
    pub diff: Diff,
    /// Same diff with allow-listed threads removed. Display only.
    pub presentation_diff: Diff,
    /// Growth since the first snapshot of the run, when known.
    pub diff_from_initial: Option<Diff>,
    pub before: Snapshot,
    pub after: Snapshot,
}

impl LeakReport {
    #[must_use]
    pub fn from_reconciliation(
        test_name: impl Into<String>,
        outcome: &Reconciliation,
        allowlist: &AllowlistPolicy,
        initial: Option<&Snapshot>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            verdict: outcome.verdict.clone(),
            pumps: outcome.pumps,
            presentation_diff: allowlist.filter(&outcome.diff),
            diff: outcome.diff.clone(),
            diff_from_initial: initial.map(|first| Diff::between(first, &outcome.after)),
            before: outcome.before.clone(),
            after: outcome.after.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as JSON into `dir`, named after the test.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let file_name: String = self
            .test_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{file_name}.leak.json"));
        std::fs::write(&path, self.to_json()?)?;
        Ok(path)
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Process stats had unexpected growth in {} ({}, {} event loop pumps)",
            self.test_name, self.verdict, self.pumps
        )?;
        writeln!(f, "DIFF:")?;
        write!(f, "{}", self.diff)?;
        if self.presentation_diff != self.diff {
            writeln!(f, "DIFF (ALLOW-LISTED THREADS REMOVED):")?;
            write!(f, "{}", self.presentation_diff)?;
        }
        if let Some(initial) = &self.diff_from_initial {
            writeln!(f, "DIFF FROM INITIAL:")?;
            write!(f, "{initial}")?;
        }
        writeln!(f, "BEFORE:")?;
        write!(f, "{}", self.before)?;
        writeln!(f, "AFTER:")?;
        write!(f, "{}", self.after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allowlist::AllowlistRule;
    use crate::reconcile::ReconcileState;
    use crate::tolerance::Category;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn threads(entries: &[(&str, i64)]) -> crate::snapshot::Counts {
        entries.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn failed_outcome() -> Reconciliation {
        let before = Snapshot::builder()
            .used_system_memory(1000)
            .system_threads(threads(&[("A", 1)]))
            .build();
        let after = Snapshot::builder()
            .used_system_memory(1000)
            .system_threads(threads(&[("A", 1), ("B", 1), ("GC Thread#0", 1)]))
            .build();
        Reconciliation {
            state: ReconcileState::Failed,
            verdict: Verdict {
                failed: BTreeSet::from([Category::OsThreads]),
                waived: BTreeSet::new(),
            },
            diff: Diff::between(&before, &after),
            before,
            after,
            pumps: 7,
            busy_pumps: 2,
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn report_sections() {
        let policy = AllowlistPolicy::new(vec![AllowlistRule::unlimited("GC Thread.*").unwrap()]);
        let initial = Snapshot::builder().used_system_memory(500).build();
        let report =
            LeakReport::from_reconciliation("Widgets::dispose", &failed_outcome(), &policy, Some(&initial));

        assert_eq!(report.pumps, 7);
        assert_eq!(report.diff.system_thread_total(), 2);
        assert_eq!(report.presentation_diff.system_thread_total(), 1);
        assert_eq!(
            report.diff_from_initial.as_ref().map(|d| d.used_system_memory),
            Some(500)
        );

        let text = report.to_string();
        assert!(text.starts_with(
            "Process stats had unexpected growth in Widgets::dispose (failed: os_threads, 7 event loop pumps)"
        ));
        assert!(text.contains("DIFF:\n"));
        assert!(text.contains("DIFF (ALLOW-LISTED THREADS REMOVED):\n"));
        assert!(text.contains("DIFF FROM INITIAL:\n"));
        assert!(text.contains("BEFORE:\nProcess stats\n"));
        assert!(text.contains("AFTER:\nProcess stats\n"));
        assert!(text.contains("  B x 1\n"));
    }

    #[test]
    fn saved_report_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let report = LeakReport::from_reconciliation(
            "Widgets::dispose",
            &failed_outcome(),
            &AllowlistPolicy::default(),
            None,
        );
        let path = report.save(dir.path()).unwrap();
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("Widgets__dispose.leak.json")
        );
        let loaded: LeakReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.diff, report.diff);
        assert_eq!(loaded.verdict, report.verdict);
    }

    #[test]
    fn save_into_missing_dir_is_io_error() {
        let report = LeakReport::from_reconciliation(
            "t",
            &failed_outcome(),
            &AllowlistPolicy::default(),
            None,
        );
        let err = report.save(Path::new("/nonexistent/leakwatch")).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }

    #[test]
    fn unchanged_presentation_diff_is_not_repeated() {
        let report = LeakReport::from_reconciliation(
            "suite",
            &failed_outcome(),
            &AllowlistPolicy::default(),
            None,
        );
        let text = report.to_string();
        assert!(!text.contains("ALLOW-LISTED"));
        assert!(!text.contains("DIFF FROM INITIAL"));
    }
}
