//! Allow-list of known-benign threads.
//!
//! Runtime housekeeping threads (JIT compilers, collectors, debugger agents)
//! come and go independently of the code under test. The policy strips them
//! from the copy of a diff that is shown to humans.
//!
//! The pass/fail verdict in [`crate::tolerance`] is computed from the raw
//! diff and never consults this policy.

use regex::Regex;

use crate::error::ConfigError;
use crate::snapshot::{Counts, Diff};

/// A thread-name pattern and the count below which it is exempt.
#[derive(Debug, Clone)]
pub struct AllowlistRule {
    pattern: Regex,
    source: String,
    quota: i64,
}

impl AllowlistRule {
    /// Compile a rule. The pattern must match the whole thread name.
    pub fn new(pattern: &str, quota: i64) -> Result<Self, ConfigError> {
        let anchored = format!("^(?:{pattern})$");
        let compiled = Regex::new(&anchored).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            pattern: compiled,
            source: pattern.to_string(),
            quota,
        })
    }

    /// Rule with no quota limit.
    pub fn unlimited(pattern: &str) -> Result<Self, ConfigError> {
        Self::new(pattern, i64::MAX)
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn quota(&self) -> i64 {
        self.quota
    }

    #[must_use]
    pub fn exempts(&self, thread_name: &str, count: i64) -> bool {
        self.pattern.is_match(thread_name) && count < self.quota
    }
}

/// Ordered set of allow-list rules. Any matching rule with room in its
/// quota exempts the entry.
#[derive(Debug, Clone, Default)]
pub struct AllowlistPolicy {
    rules: Vec<AllowlistRule>,
}

impl AllowlistPolicy {
    #[must_use]
    pub fn new(rules: Vec<AllowlistRule>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rules(&self) -> &[AllowlistRule] {
        &self.rules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `thread_name`, observed `count` times in a diff, is exempt.
    #[must_use]
    pub fn is_exempt(&self, thread_name: &str, count: i64) -> bool {
        self.rules.iter().any(|rule| rule.exempts(thread_name, count))
    }

    /// Presentation copy of `diff` with exempt thread entries removed from
    /// both thread censuses. Memory and descriptor figures are untouched.
    #[must_use]
    pub fn filter(&self, diff: &Diff) -> Diff {
        Diff {
            system_threads: self.filter_threads(&diff.system_threads),
            managed_threads: self.filter_threads(&diff.managed_threads),
            ..diff.clone()
        }
    }

    fn filter_threads(&self, threads: &Counts) -> Counts {
        threads
            .iter()
            .filter(|(name, count)| !self.is_exempt(name, **count))
            .map(|(name, count)| (name.clone(), *count))
            .collect()
    }
}
