//! `always_assert!` and `sometimes_assert!` with per-thread result tracking.
//!
//! `always_assert!` panics with the current seed when its condition fails.
//! `sometimes_assert!` only records the outcome so a multi-seed run can check
//! that an interesting situation (a stalled admission, a blocked header)
//! actually happened at least once.

use std::cell::RefCell;
use std::collections::HashMap;

/// Outcome counts of one tracked assertion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssertionStats {
    /// Times the assertion was evaluated
    pub total_checks: usize,
    /// Times its condition held
    pub successes: usize,
}

impl AssertionStats {
    /// Create zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Success rate in percent, 0.0 before any check.
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            (self.successes as f64 / self.total_checks as f64) * 100.0
        }
    }

    /// Record one evaluation.
    pub fn record(&mut self, success: bool) {
        self.total_checks += 1;
        if success {
            self.successes += 1;
        }
    }
}

thread_local! {
    static ASSERTION_RESULTS: RefCell<HashMap<String, AssertionStats>> = RefCell::new(HashMap::new());
}

/// Record the outcome of the assertion `name`.
pub fn record_assertion(name: &str, success: bool) {
    ASSERTION_RESULTS.with(|results| {
        results
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .record(success);
    });
}

/// Snapshot of every assertion tracked on this thread.
pub fn get_assertion_results() -> HashMap<String, AssertionStats> {
    ASSERTION_RESULTS.with(|results| results.borrow().clone())
}

/// Forget every tracked assertion.
pub fn reset_assertion_results() {
    ASSERTION_RESULTS.with(|results| results.borrow_mut().clear());
}

/// Names of `sometimes_assert!`s that were evaluated but never held.
pub fn validate_assertion_contracts() -> Vec<String> {
    let mut violations: Vec<String> = get_assertion_results()
        .into_iter()
        .filter(|(_, stats)| stats.total_checks > 0 && stats.successes == 0)
        .map(|(name, stats)| {
            format!(
                "sometimes_assert!('{}') never held in {} checks",
                name, stats.total_checks
            )
        })
        .collect();
    violations.sort();
    violations
}

/// Assert that a condition always holds, panicking with the seed otherwise.
///
/// # Example
///
/// ```rust
/// use nicrx_sim::always_assert;
///
/// let active = 1;
/// always_assert!(budget_respected, active <= 2, "too many active streams");
/// ```
#[macro_export]
macro_rules! always_assert {
    ($name:ident, $condition:expr, $message:expr) => {
        let result = $condition;
        if !result {
            let current_seed = $crate::get_current_sim_seed();
            panic!(
                "Always assertion '{}' failed (seed: {}): {}",
                stringify!($name),
                current_seed,
                $message
            );
        }
    };
}

/// Record whether a condition held, without failing.
///
/// # Example
///
/// ```rust
/// use nicrx_sim::sometimes_assert;
///
/// let stalls = 3;
/// sometimes_assert!(admission_stalled, stalls > 0, "stream budget was exhausted");
/// ```
#[macro_export]
macro_rules! sometimes_assert {
    ($name:ident, $condition:expr, $message:expr) => {
        let result = $condition;
        $crate::assertions::record_assertion(stringify!($name), result);
    };
}
