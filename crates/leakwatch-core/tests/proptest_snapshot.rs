//! Property-based tests for snapshot grouping and diff invariants.
//!
//! Validates:
//! 1. Grouping is order independent
//! 2. Group totals equal the number of names
//! 3. Diffs never carry zero entries
//! 4. Diff against self is empty
//! 5. Diff is antisymmetric: diff(a, b) == -diff(b, a)
//! 6. Applying a diff's counts to `before` reproduces `after`

use std::collections::BTreeSet;

use proptest::prelude::*;

use leakwatch_core::snapshot::{Counts, Diff, Snapshot, group_by_name, total};

// =============================================================================
// Strategies
// =============================================================================

fn arb_thread_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("main".to_string()),
        Just("gmain".to_string()),
        Just("GC Thread#0".to_string()),
        "[a-z]{1,6}-[0-9]{1,2}",
    ]
}

fn arb_counts() -> impl Strategy<Value = Counts> {
    proptest::collection::btree_map(arb_thread_name(), 1_i64..5, 0..8)
}

fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
    (
        0_i64..10_000_000,
        arb_counts(),
        0_i64..10_000_000,
        arb_counts(),
        arb_counts(),
    )
        .prop_map(|(mem, threads, managed, managed_threads, fds)| {
            Snapshot::builder()
                .used_system_memory(mem)
                .system_threads(threads)
                .used_managed_memory(managed)
                .managed_threads(managed_threads)
                .open_descriptors(fds)
                .build()
        })
}

fn no_zero_entries(diff: &Diff) -> bool {
    [
        &diff.system_threads,
        &diff.managed_threads,
        &diff.open_descriptors,
    ]
    .iter()
    .all(|counts| counts.values().all(|v| *v != 0))
}

fn apply(before: &Counts, delta: &Counts) -> Counts {
    let keys: BTreeSet<&String> = before.keys().chain(delta.keys()).collect();
    keys.into_iter()
        .filter_map(|k| {
            let v = before.get(k).copied().unwrap_or(0) + delta.get(k).copied().unwrap_or(0);
            (v != 0).then(|| (k.clone(), v))
        })
        .collect()
}

// =============================================================================
// Property: grouping
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn grouping_ignores_order(
        names in proptest::collection::vec(arb_thread_name(), 0..40),
        seed in any::<u64>(),
    ) {
        let mut shuffled = names.clone();
        // deterministic rotate-and-reverse permutation
        if !shuffled.is_empty() {
            let k = (seed as usize) % shuffled.len();
            shuffled.rotate_left(k);
            if seed % 2 == 0 {
                shuffled.reverse();
            }
        }
        prop_assert_eq!(group_by_name(names.iter().cloned()), group_by_name(shuffled));
    }

    #[test]
    fn grouping_total_matches_input_len(
        names in proptest::collection::vec(arb_thread_name(), 0..40),
    ) {
        let grouped = group_by_name(names.iter().cloned());
        prop_assert_eq!(total(&grouped), names.len() as i64);
        prop_assert!(grouped.values().all(|v| *v > 0));
    }
}

// =============================================================================
// Property: diff algebra
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn diff_has_no_zero_entries(a in arb_snapshot(), b in arb_snapshot()) {
        let diff = Diff::between(&a, &b);
        prop_assert!(no_zero_entries(&diff), "zero entry in {:?}", diff);
    }

    #[test]
    fn diff_against_self_is_empty(a in arb_snapshot()) {
        let diff = Diff::between(&a, &a);
        prop_assert!(diff.is_empty());
        prop_assert_eq!(diff.used_system_memory, 0);
        prop_assert_eq!(diff.system_thread_total(), 0);
    }

    #[test]
    fn diff_is_antisymmetric(a in arb_snapshot(), b in arb_snapshot()) {
        prop_assert_eq!(Diff::between(&a, &b), Diff::between(&b, &a).negated());
    }

    #[test]
    fn diff_reconstructs_after(a in arb_snapshot(), b in arb_snapshot()) {
        let diff = Diff::between(&a, &b);
        prop_assert_eq!(
            a.used_system_memory() + diff.used_system_memory,
            b.used_system_memory()
        );
        prop_assert_eq!(&apply(a.system_threads(), &diff.system_threads), b.system_threads());
        prop_assert_eq!(&apply(a.open_descriptors(), &diff.open_descriptors), b.open_descriptors());
        prop_assert_eq!(
            diff.open_descriptor_total(),
            b.open_descriptor_total() - a.open_descriptor_total()
        );
    }
}
