//! Prometheus text exposition format.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::Serialize;

use crate::collector::MetricsSnapshot;

/// Gauges read from the state store at scrape time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateGauges {
    /// Approval requests by status, after lazy expiry.
    pub approvals: BTreeMap<String, u64>,
    pub pools_tracked: u64,
    pub pools_poisoned: u64,
    pub downtime_open: u64,
    pub instances_active: u64,
    pub instances_retired: u64,
}

fn family(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn labeled(out: &mut String, name: &str, label: &str, values: &BTreeMap<String, u64>) {
    for (value, count) in values {
        let _ = writeln!(out, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

/// Render counters and gauges into Prometheus text format.
pub fn render_prometheus(snapshot: &MetricsSnapshot, gauges: &StateGauges) -> String {
    let mut out = String::new();

    family(&mut out, "spotgrid_telemetry_total", "counter", "Telemetry samples by validation result.");
    labeled(&mut out, "spotgrid_telemetry_total", "result", &snapshot.telemetry);

    family(&mut out, "spotgrid_decisions_total", "counter", "Decisions by type.");
    labeled(&mut out, "spotgrid_decisions_total", "type", &snapshot.decisions);

    family(&mut out, "spotgrid_actuations_total", "counter", "Dispatched actions by final result.");
    labeled(&mut out, "spotgrid_actuations_total", "result", &snapshot.actuations);

    family(&mut out, "spotgrid_cutovers_total", "counter", "Replica cutovers by outcome.");
    labeled(&mut out, "spotgrid_cutovers_total", "outcome", &snapshot.cutovers);

    family(&mut out, "spotgrid_notices_ingested_total", "counter", "Interruption notices reported to the registry.");
    let _ = writeln!(out, "spotgrid_notices_ingested_total {}", snapshot.notices_ingested);

    family(&mut out, "spotgrid_approvals_submitted_total", "counter", "Actions parked behind an approval.");
    let _ = writeln!(out, "spotgrid_approvals_submitted_total {}", snapshot.approvals_submitted);

    family(&mut out, "spotgrid_approvals", "gauge", "Approval requests by status.");
    labeled(&mut out, "spotgrid_approvals", "status", &gauges.approvals);

    family(&mut out, "spotgrid_pools_tracked", "gauge", "Pools known to the risk registry.");
    let _ = writeln!(out, "spotgrid_pools_tracked {}", gauges.pools_tracked);

    family(&mut out, "spotgrid_pools_poisoned", "gauge", "Pools currently poisoned.");
    let _ = writeln!(out, "spotgrid_pools_poisoned {}", gauges.pools_poisoned);

    family(&mut out, "spotgrid_downtime_open", "gauge", "Open SLA downtime windows.");
    let _ = writeln!(out, "spotgrid_downtime_open {}", gauges.downtime_open);

    family(&mut out, "spotgrid_instances", "gauge", "Managed instances by state.");
    let _ = writeln!(out, "spotgrid_instances{{state=\"active\"}} {}", gauges.instances_active);
    let _ = writeln!(out, "spotgrid_instances{{state=\"retired\"}} {}", gauges.instances_retired);

    out
}
