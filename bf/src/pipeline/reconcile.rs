//! Post-load reconciliation

use serde::{Deserialize, Serialize};

use crate::domain::ReconciliationPolicy;

/// Expected vs. loader-reported counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Records written to the data file
    pub expected: u64,
    /// Loaded + rejected + discarded rows
    pub accounted: u64,
    /// Records the loader reported reading
    pub read: u64,
    pub allowed: u64,
    pub matched: bool,
}

/// Compare what was handed to the loader with what it reported
pub fn reconcile(
    policy: &ReconciliationPolicy,
    expected: u64,
    read: u64,
    loaded: u64,
    rejected: u64,
    discarded: u64,
) -> Reconciliation {
    let accounted = loaded + rejected + discarded;
    let allowed = policy.allowed_difference(expected);
    let matched = expected.abs_diff(accounted) <= allowed && expected.abs_diff(read) <= allowed;
    Reconciliation {
        expected,
        accounted,
        read,
        allowed,
        matched,
    }
}
