//! What the control loop parks inside an approval request.

use serde::{Deserialize, Serialize};

use spotgrid_approval::ActionImpact;
use spotgrid_dispatch::ActionKind;
use spotgrid_state::{Decision, DecisionType, InstanceRecord};

/// Replayed when an approved request is claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub action: ActionKind,
    pub impact: ActionImpact,
    /// Meant to keep the instance ahead of an interruption.
    pub preventive: bool,
}

impl ActionPayload {
    /// The action a switch decision asks for, or `None` for holds and
    /// switches the instance has already made.
    pub fn for_decision(decision: &Decision, instance: &InstanceRecord) -> Option<Self> {
        if !decision.decision_type.is_switch() {
            return None;
        }
        let target = decision.decision_type.target_lifecycle();
        let moves_pool = decision
            .target_pool
            .as_ref()
            .is_some_and(|p| *p != instance.pool);
        if target == instance.lifecycle && !moves_pool {
            return None;
        }

        let features = &decision.features_snapshot;
        let impact = match decision.decision_type {
            DecisionType::SwitchToSpot => ActionImpact::ReturnToSpot,
            _ if features.pool_poisoned || features.notice_count > 0 => {
                ActionImpact::EmergencySwitch
            }
            _ => ActionImpact::PlannedSwitch,
        };

        Some(Self {
            action: ActionKind::SwitchLifecycle {
                target,
                pool: decision.target_pool.clone(),
            },
            impact,
            preventive: decision.decision_type == DecisionType::SwitchToOndemand,
        })
    }

    /// Protected instances move to on-demand by promoting their standby.
    pub fn needs_cutover(&self, instance: &InstanceRecord) -> bool {
        instance.protected && self.preventive
    }
}

#[cfg(test)]
mod tests {
    use spotgrid_state::{FeatureSnapshot, Lifecycle, PoolKey};

    use super::*;

    fn pool() -> PoolKey {
        PoolKey::new("us-east-1", "us-east-1a", "m5")
    }

    fn instance(lifecycle: Lifecycle) -> InstanceRecord {
        InstanceRecord {
            instance_id: "i-1".to_string(),
            tenant_id: "acme".to_string(),
            pool: pool(),
            lifecycle,
            last_safe_lifecycle: lifecycle,
            protected: false,
            retired: false,
            updated_at: 0,
        }
    }

    fn decision(decision_type: DecisionType, poisoned: bool, notices: u32) -> Decision {
        Decision {
            id: "d-1".to_string(),
            instance_id: "i-1".to_string(),
            decision_type,
            risk_score: 0.9,
            confidence: 1.0,
            features_snapshot: FeatureSnapshot {
                pool: pool(),
                lifecycle: Lifecycle::Spot,
                utilization: 0.5,
                current_price: 0.1,
                pool_poisoned: poisoned,
                poison_expires_at: None,
                interruption_count: 0,
                notice_count: notices,
                predictor: None,
            },
            reason: String::new(),
            target_pool: None,
            evaluated_at: 0,
        }
    }

    #[test]
    fn holds_produce_no_action() {
        let d = decision(DecisionType::StaySpot, false, 0);
        assert!(ActionPayload::for_decision(&d, &instance(Lifecycle::Spot)).is_none());
    }

    #[test]
    fn switch_to_current_lifecycle_is_noop() {
        let d = decision(DecisionType::SwitchToOndemand, true, 0);
        assert!(ActionPayload::for_decision(&d, &instance(Lifecycle::OnDemand)).is_none());
    }

    #[test]
    fn poisoned_switch_is_emergency() {
        let d = decision(DecisionType::SwitchToOndemand, true, 0);
        let payload = ActionPayload::for_decision(&d, &instance(Lifecycle::Spot)).unwrap();
        assert_eq!(payload.impact, ActionImpact::EmergencySwitch);
        assert!(payload.preventive);
    }

    #[test]
    fn predicted_switch_is_planned() {
        let d = decision(DecisionType::SwitchToOndemand, false, 0);
        let payload = ActionPayload::for_decision(&d, &instance(Lifecycle::Spot)).unwrap();
        assert_eq!(payload.impact, ActionImpact::PlannedSwitch);
    }

    #[test]
    fn pool_move_on_spot_is_an_action() {
        let mut d = decision(DecisionType::SwitchToSpot, false, 0);
        d.target_pool = Some(PoolKey::new("us-east-1", "us-east-1b", "m5"));
        let payload = ActionPayload::for_decision(&d, &instance(Lifecycle::Spot)).unwrap();
        assert_eq!(payload.impact, ActionImpact::ReturnToSpot);
        assert!(!payload.preventive);
    }
}
