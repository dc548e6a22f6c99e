//! Control-loop counters.
//!
//! Plain atomics for unlabeled counters; labeled counters share a small
//! mutex-protected map since label sets are tiny and fixed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use spotgrid_state::DecisionType;

/// Counter keyed by a static label value.
#[derive(Debug, Default)]
struct LabeledCounter {
    values: Mutex<BTreeMap<&'static str, u64>>,
}

impl LabeledCounter {
    fn with_labels(labels: &[&'static str]) -> Self {
        Self {
            values: Mutex::new(labels.iter().map(|l| (*l, 0)).collect()),
        }
    }

    fn inc(&self, label: &'static str) {
        *self.values.lock().entry(label).or_insert(0) += 1;
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values
            .lock()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub telemetry: BTreeMap<String, u64>,
    pub decisions: BTreeMap<String, u64>,
    pub actuations: BTreeMap<String, u64>,
    pub cutovers: BTreeMap<String, u64>,
    pub notices_ingested: u64,
    pub approvals_submitted: u64,
}

/// Counters shared by the control loop and the `/metrics` handler.
#[derive(Debug)]
pub struct ControlMetrics {
    telemetry: LabeledCounter,
    decisions: LabeledCounter,
    actuations: LabeledCounter,
    cutovers: LabeledCounter,
    notices_ingested: AtomicU64,
    approvals_submitted: AtomicU64,
}

impl Default for ControlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlMetrics {
    pub fn new() -> Self {
        Self {
            telemetry: LabeledCounter::with_labels(&["accepted", "rejected"]),
            decisions: LabeledCounter::with_labels(&[
                DecisionType::StaySpot.as_str(),
                DecisionType::SwitchToSpot.as_str(),
                DecisionType::SwitchToOndemand.as_str(),
                DecisionType::StayOndemand.as_str(),
            ]),
            actuations: LabeledCounter::with_labels(&[
                "succeeded",
                "failed",
                "timed_out",
                "superseded",
            ]),
            cutovers: LabeledCounter::with_labels(&["promoted", "no_ready_replica"]),
            notices_ingested: AtomicU64::new(0),
            approvals_submitted: AtomicU64::new(0),
        }
    }

    pub fn record_telemetry(&self, accepted: bool) {
        self.telemetry
            .inc(if accepted { "accepted" } else { "rejected" });
    }

    pub fn record_decision(&self, decision: DecisionType) {
        self.decisions.inc(decision.as_str());
    }

    /// `result` is an actuation result label, e.g. `"timed_out"`.
    pub fn record_actuation(&self, result: &'static str) {
        self.actuations.inc(result);
    }

    pub fn record_cutover(&self, promoted: bool) {
        self.cutovers
            .inc(if promoted { "promoted" } else { "no_ready_replica" });
    }

    pub fn record_notices(&self, count: u64) {
        self.notices_ingested.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_approval_submitted(&self) {
        self.approvals_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            telemetry: self.telemetry.snapshot(),
            decisions: self.decisions.snapshot(),
            actuations: self.actuations.snapshot(),
            cutovers: self.cutovers.snapshot(),
            notices_ingested: self.notices_ingested.load(Ordering::Relaxed),
            approvals_submitted: self.approvals_submitted.load(Ordering::Relaxed),
        }
    }
}
