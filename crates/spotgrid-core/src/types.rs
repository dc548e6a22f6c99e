//! Shared types used across SpotGrid crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a managed compute instance.
pub type InstanceId = String;

/// Identifier of the tenant that owns an instance.
pub type TenantId = String;

// ── Pool identity ─────────────────────────────────────────────────

/// Identity of a spot pool: instances sharing market pricing and
/// interruption behavior. The sole addressing scheme for shared risk state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub region: String,
    pub availability_zone: String,
    pub instance_family: String,
}

impl PoolKey {
    pub fn new(region: &str, availability_zone: &str, instance_family: &str) -> Self {
        Self {
            region: region.to_string(),
            availability_zone: availability_zone.to_string(),
            instance_family: instance_family.to_string(),
        }
    }

    /// Composite key used for store tables: `{region}/{zone}/{family}`.
    pub fn table_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.region, self.availability_zone, self.instance_family
        )
    }

    fn validate(&self) -> Result<(), TelemetryError> {
        for (field, value) in [
            ("region", &self.region),
            ("availability_zone", &self.availability_zone),
            ("instance_family", &self.instance_family),
        ] {
            if value.trim().is_empty() {
                return Err(TelemetryError::InvalidPool(format!("{field} is empty")));
            }
            if value.contains('/') || value.contains('|') {
                return Err(TelemetryError::InvalidPool(format!(
                    "{field} contains a reserved separator: {value}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_key())
    }
}

impl FromStr for PoolKey {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(region), Some(zone), Some(family), None) => {
                let key = PoolKey::new(region, zone, family);
                key.validate()?;
                Ok(key)
            }
            _ => Err(TelemetryError::InvalidPool(format!(
                "expected region/zone/family, got {s:?}"
            ))),
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Capacity lifecycle an instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Spot,
    OnDemand,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Spot => f.write_str("spot"),
            Lifecycle::OnDemand => f.write_str("on_demand"),
        }
    }
}

// ── Interruption signals ──────────────────────────────────────────

/// Kind of interruption signal reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventType {
    /// Advance warning that capacity may be reclaimed. Counts toward the
    /// pool window but never poisons on its own.
    RebalanceNotice,
    /// Capacity is being reclaimed. Qualifies for poisoning.
    TerminationNotice,
}

impl RiskEventType {
    /// Whether an event of this type can trigger pool poisoning.
    pub fn qualifies_for_poisoning(self) -> bool {
        matches!(self, RiskEventType::TerminationNotice)
    }
}

impl fmt::Display for RiskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskEventType::RebalanceNotice => f.write_str("rebalance_notice"),
            RiskEventType::TerminationNotice => f.write_str("termination_notice"),
        }
    }
}

/// A provider notice attached to a telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    /// Provider-assigned notice id, used to report each notice once.
    pub id: String,
    pub kind: RiskEventType,
    /// Unix timestamp (seconds) the provider issued the notice.
    pub issued_at: u64,
}

// ── Telemetry ─────────────────────────────────────────────────────

/// One telemetry sample for a managed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub instance_id: InstanceId,
    #[serde(default)]
    pub tenant_id: TenantId,
    /// CPU utilization as a fraction (0.0–1.0).
    pub utilization: f64,
    /// Current market price per hour for the instance's pool.
    pub current_price: f64,
    pub current_pool: PoolKey,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub notices: Vec<Notice>,
    /// Whether the instance carries workload that warrants a warm replica.
    #[serde(default)]
    pub protected: bool,
}

impl Telemetry {
    /// Reject malformed samples at ingestion.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.instance_id.trim().is_empty() {
            return Err(TelemetryError::MissingInstanceId);
        }
        if self.instance_id.contains('|') {
            return Err(TelemetryError::InvalidInstanceId(self.instance_id.clone()));
        }
        if !self.utilization.is_finite() || !(0.0..=1.0).contains(&self.utilization) {
            return Err(TelemetryError::UtilizationOutOfRange(self.utilization));
        }
        if !self.current_price.is_finite() || self.current_price < 0.0 {
            return Err(TelemetryError::InvalidPrice(self.current_price));
        }
        self.current_pool.validate()?;
        if let Some(notice) = self.notices.iter().find(|n| n.id.trim().is_empty()) {
            return Err(TelemetryError::InvalidNotice(format!(
                "{} notice without id",
                notice.kind
            )));
        }
        Ok(())
    }

    /// Whether this sample carries any interruption signal.
    pub fn has_interruption_signal(&self) -> bool {
        !self.notices.is_empty()
    }

    /// Whether this sample carries a termination notice.
    pub fn has_termination_notice(&self) -> bool {
        self.notices
            .iter()
            .any(|n| n.kind == RiskEventType::TerminationNotice)
    }
}

/// Reasons a telemetry sample is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("telemetry is missing an instance id")]
    MissingInstanceId,

    #[error("invalid instance id: {0}")]
    InvalidInstanceId(String),

    #[error("utilization out of range: {0}")]
    UtilizationOutOfRange(f64),

    #[error("invalid price: {0}")]
    InvalidPrice(f64),

    #[error("invalid pool: {0}")]
    InvalidPool(String),

    #[error("invalid notice: {0}")]
    InvalidNotice(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Telemetry {
        Telemetry {
            instance_id: "i-0abc".to_string(),
            tenant_id: "acme".to_string(),
            utilization: 0.42,
            current_price: 0.031,
            current_pool: PoolKey::new("us-east-1", "us-east-1a", "m5"),
            lifecycle: Lifecycle::Spot,
            notices: Vec::new(),
            protected: false,
        }
    }

    #[test]
    fn pool_key_display_and_parse() {
        let key = PoolKey::new("us-east-1", "us-east-1a", "m5");
        assert_eq!(key.to_string(), "us-east-1/us-east-1a/m5");
        let parsed: PoolKey = "us-east-1/us-east-1a/m5".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn pool_key_parse_rejects_wrong_arity() {
        assert!("us-east-1/m5".parse::<PoolKey>().is_err());
        assert!("a/b/c/d".parse::<PoolKey>().is_err());
        assert!("a//c".parse::<PoolKey>().is_err());
    }

    #[test]
    fn valid_sample_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_instance_id_rejected() {
        let mut t = sample();
        t.instance_id = "  ".to_string();
        assert_eq!(t.validate(), Err(TelemetryError::MissingInstanceId));
    }

    #[test]
    fn utilization_out_of_range_rejected() {
        let mut t = sample();
        t.utilization = 1.5;
        assert!(matches!(
            t.validate(),
            Err(TelemetryError::UtilizationOutOfRange(_))
        ));
        t.utilization = f64::NAN;
        assert!(t.validate().is_err());
    }

    #[test]
    fn negative_price_rejected() {
        let mut t = sample();
        t.current_price = -0.01;
        assert!(matches!(t.validate(), Err(TelemetryError::InvalidPrice(_))));
    }

    #[test]
    fn pool_with_separator_rejected() {
        let mut t = sample();
        t.current_pool.instance_family = "m5|large".to_string();
        assert!(matches!(t.validate(), Err(TelemetryError::InvalidPool(_))));
    }

    #[test]
    fn notice_without_id_rejected() {
        let mut t = sample();
        t.notices.push(Notice {
            id: String::new(),
            kind: RiskEventType::RebalanceNotice,
            issued_at: 10,
        });
        assert!(matches!(t.validate(), Err(TelemetryError::InvalidNotice(_))));
    }

    #[test]
    fn telemetry_defaults_from_minimal_json() {
        let json = r#"{
            "instance_id": "i-1",
            "utilization": 0.2,
            "current_price": 0.05,
            "current_pool": {"region": "eu-west-1", "availability_zone": "eu-west-1b", "instance_family": "c6g"}
        }"#;
        let t: Telemetry = serde_json::from_str(json).unwrap();
        assert_eq!(t.lifecycle, Lifecycle::Spot);
        assert!(t.notices.is_empty());
        assert!(!t.protected);
        assert!(t.validate().is_ok());
    }

    #[test]
    fn only_termination_notices_qualify() {
        assert!(RiskEventType::TerminationNotice.qualifies_for_poisoning());
        assert!(!RiskEventType::RebalanceNotice.qualifies_for_poisoning());
    }
}
