//! Growth tolerance checks over a [`Diff`].
//!
//! Five independent checks, one per resource category. Memory growth is
//! judged against an absolute byte allowance (a percentage of a near-zero
//! baseline is meaningless); thread and descriptor censuses allow no net
//! growth by default.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Thresholds;
use crate::snapshot::Diff;

/// Resource category a check covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SystemMemory,
    ManagedMemory,
    OsThreads,
    ManagedThreads,
    OpenDescriptors,
}

impl Category {
    pub const ALL: [Self; 5] = [
        Self::SystemMemory,
        Self::ManagedMemory,
        Self::OsThreads,
        Self::ManagedThreads,
        Self::OpenDescriptors,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SystemMemory => "system_memory",
            Self::ManagedMemory => "managed_memory",
            Self::OsThreads => "os_threads",
            Self::ManagedThreads => "managed_threads",
            Self::OpenDescriptors => "open_descriptors",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown resource category: {s}"))
    }
}

/// Outcome of evaluating a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Categories whose growth exceeded tolerance.
    pub failed: BTreeSet<Category>,
    /// Categories that exceeded tolerance but were allowed for this test.
    pub waived: BTreeSet<Category>,
}

impl Verdict {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            return write!(f, "passed");
        }
        let names: Vec<&str> = self.failed.iter().map(|c| c.as_str()).collect();
        write!(f, "failed: {}", names.join(", "))
    }
}

/// Applies [`Thresholds`] to diffs.
#[derive(Debug, Clone, Default)]
pub struct ToleranceEvaluator {
    thresholds: Thresholds,
}

impl ToleranceEvaluator {
    #[must_use]
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Whether a single category is within tolerance.
    #[must_use]
    pub fn within(&self, category: Category, diff: &Diff) -> bool {
        let t = &self.thresholds;
        match category {
            Category::SystemMemory => diff.used_system_memory < t.system_memory_bytes,
            Category::ManagedMemory => diff.used_managed_memory < t.managed_memory_bytes,
            Category::OsThreads => diff.system_thread_total() <= t.os_threads,
            Category::ManagedThreads => diff.managed_thread_total() <= t.managed_threads,
            Category::OpenDescriptors => diff.open_descriptor_total() <= t.open_descriptors,
        }
    }

    #[must_use]
    pub fn evaluate(&self, diff: &Diff) -> Verdict {
        self.evaluate_allowing(diff, &BTreeSet::new())
    }

    /// Evaluate, moving failures in `allowed` to [`Verdict::waived`].
    #[must_use]
    pub fn evaluate_allowing(&self, diff: &Diff, allowed: &BTreeSet<Category>) -> Verdict {
        let (waived, failed) = Category::ALL
            .into_iter()
            .filter(|c| !self.within(*c, diff))
            .partition(|c| allowed.contains(c));
        Verdict { failed, waived }
    }
}
