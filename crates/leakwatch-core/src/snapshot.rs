//! Point-in-time resource snapshots and their signed differences.
//!
//! A [`Snapshot`] groups everything an [`Introspector`] reports into counts:
//! threads by name and descriptors by resolved target, since several threads
//! may share a name and a device node may be open more than once.
//!
//! ```text
//! Snapshot::collect(probe)  ──►  Snapshot (immutable)
//!                                    │
//!        Diff::between(before, after) ◄┘
//!           │
//!           ├── scalars: after - before
//!           └── counts:  after[k] - before[k] over the key union,
//!                        zero entries dropped
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::introspect::{Introspector, UNKNOWN};

/// Grouped counts keyed by thread name or descriptor target.
pub type Counts = BTreeMap<String, i64>;

/// Frequency count of names. Output order does not depend on input order.
pub fn group_by_name<I, S>(names: I) -> Counts
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut counts = Counts::new();
    for name in names {
        *counts.entry(name.into()).or_insert(0) += 1;
    }
    counts
}

/// Sum of all counts in a grouping.
#[must_use]
pub fn total(counts: &Counts) -> i64 {
    counts.values().sum()
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable record of process resource usage at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotBuilder")]
pub struct Snapshot {
    used_system_memory: i64,
    system_threads: Counts,
    used_managed_memory: i64,
    managed_threads: Counts,
    open_descriptors: Counts,
}

impl Snapshot {
    /// Capture the current state reported by `probe`.
    pub fn collect<P: Introspector + ?Sized>(probe: &P) -> Self {
        probe.quiesce();

        let used_system_memory = probe.resident_memory();
        let system_threads = group_by_name(probe.os_thread_names());
        let used_managed_memory = probe.managed_memory();
        let managed_threads = group_by_name(probe.managed_thread_names());

        let descriptors = probe.open_descriptor_paths();
        let unresolved = descriptors.iter().filter(|d| d.is_none()).count();
        if unresolved > 0 {
            debug!(unresolved, "unresolved descriptors left out of snapshot");
        }
        let open_descriptors = group_by_name(descriptors.into_iter().flatten());

        let snapshot = Self {
            used_system_memory,
            system_threads,
            used_managed_memory,
            managed_threads,
            open_descriptors,
        };
        debug!(
            rss = snapshot.used_system_memory,
            threads = snapshot.system_thread_total(),
            managed_threads = snapshot.managed_thread_total(),
            descriptors = snapshot.open_descriptor_total(),
            "snapshot collected"
        );
        snapshot
    }

    #[must_use]
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// Signed change from `before` to `after`.
    #[must_use]
    pub fn diff(before: &Self, after: &Self) -> Diff {
        Diff::between(before, after)
    }

    #[must_use]
    pub fn used_system_memory(&self) -> i64 {
        self.used_system_memory
    }

    #[must_use]
    pub fn system_threads(&self) -> &Counts {
        &self.system_threads
    }

    #[must_use]
    pub fn used_managed_memory(&self) -> i64 {
        self.used_managed_memory
    }

    #[must_use]
    pub fn managed_threads(&self) -> &Counts {
        &self.managed_threads
    }

    #[must_use]
    pub fn open_descriptors(&self) -> &Counts {
        &self.open_descriptors
    }

    #[must_use]
    pub fn system_thread_total(&self) -> i64 {
        total(&self.system_threads)
    }

    #[must_use]
    pub fn managed_thread_total(&self) -> i64 {
        total(&self.managed_threads)
    }

    #[must_use]
    pub fn open_descriptor_total(&self) -> i64 {
        total(&self.open_descriptors)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Process stats")?;
        render_body(
            f,
            self.used_system_memory,
            &self.system_threads,
            self.used_managed_memory,
            &self.managed_threads,
            &self.open_descriptors,
        )
    }
}

/// Builder for snapshots assembled by hand (stubs, fixtures, tests).
///
/// Deserialized snapshots also pass through here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotBuilder {
    used_system_memory: i64,
    system_threads: Counts,
    used_managed_memory: i64,
    managed_threads: Counts,
    open_descriptors: Counts,
}

impl SnapshotBuilder {
    #[must_use]
    pub fn used_system_memory(mut self, bytes: i64) -> Self {
        self.used_system_memory = bytes;
        self
    }

    #[must_use]
    pub fn system_threads(mut self, threads: Counts) -> Self {
        self.system_threads = threads;
        self
    }

    #[must_use]
    pub fn used_managed_memory(mut self, bytes: i64) -> Self {
        self.used_managed_memory = bytes;
        self
    }

    #[must_use]
    pub fn managed_threads(mut self, threads: Counts) -> Self {
        self.managed_threads = threads;
        self
    }

    #[must_use]
    pub fn open_descriptors(mut self, descriptors: Counts) -> Self {
        self.open_descriptors = descriptors;
        self
    }

    /// Zero and negative counts are dropped so absent keys mean zero.
    #[must_use]
    pub fn build(self) -> Snapshot {
        let keep_positive = |mut counts: Counts| {
            counts.retain(|_, v| *v > 0);
            counts
        };
        Snapshot {
            used_system_memory: self.used_system_memory,
            system_threads: keep_positive(self.system_threads),
            used_managed_memory: self.used_managed_memory,
            managed_threads: keep_positive(self.managed_threads),
            open_descriptors: keep_positive(self.open_descriptors),
        }
    }
}

impl From<SnapshotBuilder> for Snapshot {
    fn from(builder: SnapshotBuilder) -> Self {
        builder.build()
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Signed delta between two snapshots. Count maps never hold zero entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub used_system_memory: i64,
    pub system_threads: Counts,
    pub used_managed_memory: i64,
    pub managed_threads: Counts,
    pub open_descriptors: Counts,
}

impl Diff {
    #[must_use]
    pub fn between(before: &Snapshot, after: &Snapshot) -> Self {
        Self {
            used_system_memory: resident_delta(before.used_system_memory, after.used_system_memory),
            system_threads: subtract(&after.system_threads, &before.system_threads),
            used_managed_memory: after.used_managed_memory - before.used_managed_memory,
            managed_threads: subtract(&after.managed_threads, &before.managed_threads),
            open_descriptors: subtract(&after.open_descriptors, &before.open_descriptors),
        }
    }

    /// True when nothing changed at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used_system_memory == 0
            && self.used_managed_memory == 0
            && self.system_threads.is_empty()
            && self.managed_threads.is_empty()
            && self.open_descriptors.is_empty()
    }

    /// Entrywise negation; `a→b` negated equals `b→a`.
    #[must_use]
    pub fn negated(&self) -> Self {
        let negate = |counts: &Counts| -> Counts {
            counts.iter().map(|(k, v)| (k.clone(), -v)).collect()
        };
        Self {
            used_system_memory: -self.used_system_memory,
            system_threads: negate(&self.system_threads),
            used_managed_memory: -self.used_managed_memory,
            managed_threads: negate(&self.managed_threads),
            open_descriptors: negate(&self.open_descriptors),
        }
    }

    #[must_use]
    pub fn system_thread_total(&self) -> i64 {
        total(&self.system_threads)
    }

    #[must_use]
    pub fn managed_thread_total(&self) -> i64 {
        total(&self.managed_threads)
    }

    #[must_use]
    pub fn open_descriptor_total(&self) -> i64 {
        total(&self.open_descriptors)
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render_body(
            f,
            self.used_system_memory,
            &self.system_threads,
            self.used_managed_memory,
            &self.managed_threads,
            &self.open_descriptors,
        )
    }
}

/// Growth is not judged when either read failed.
fn resident_delta(before: i64, after: i64) -> i64 {
    if before == UNKNOWN || after == UNKNOWN {
        debug!(before, after, "resident memory unknown; growth treated as zero");
        return 0;
    }
    after - before
}

fn subtract(after: &Counts, before: &Counts) -> Counts {
    let mut result = after.clone();
    for (name, count) in before {
        *result.entry(name.clone()).or_insert(0) -= count;
    }
    result.retain(|_, v| *v != 0);
    result
}

// =============================================================================
// Rendering
// =============================================================================

fn render_body(
    f: &mut fmt::Formatter<'_>,
    system_memory: i64,
    system_threads: &Counts,
    managed_memory: i64,
    managed_threads: &Counts,
    descriptors: &Counts,
) -> fmt::Result {
    writeln!(
        f,
        "UsedMem={} bytes ({:.2} MB), Threads={}",
        with_separators(system_memory),
        as_mb(system_memory),
        total(system_threads)
    )?;
    render_counts(f, system_threads)?;
    writeln!(
        f,
        "UsedManaged={} bytes ({:.2} MB), Managed threads={}",
        with_separators(managed_memory),
        as_mb(managed_memory),
        total(managed_threads)
    )?;
    render_counts(f, managed_threads)?;
    writeln!(
        f,
        "Open files: (count: {}, unique count: {})",
        total(descriptors),
        descriptors.len()
    )?;
    render_counts(f, descriptors)
}

fn render_counts(f: &mut fmt::Formatter<'_>, counts: &Counts) -> fmt::Result {
    for (key, count) in counts {
        writeln!(f, "  {key} x {count}")?;
    }
    Ok(())
}

fn as_mb(bytes: i64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

fn with_separators(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
