//! Risk classification for actions.

use serde::{Deserialize, Serialize};

use spotgrid_core::config::ApprovalConfig;
use spotgrid_state::{ApprovalActionType, RiskLevel};

/// What an action does to the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionImpact {
    /// Move onto spot capacity.
    ReturnToSpot,
    /// Move to on-demand because the predicted risk is high.
    PlannedSwitch,
    /// Move to on-demand forced by a poisoned pool or an interruption notice.
    EmergencySwitch,
    /// Terminate a resource outside its normal lifecycle.
    TerminateRogue,
    /// Delete an idle resource.
    DeleteWaste,
}

impl ActionImpact {
    pub fn action_type(self) -> ApprovalActionType {
        match self {
            ActionImpact::ReturnToSpot
            | ActionImpact::PlannedSwitch
            | ActionImpact::EmergencySwitch => ApprovalActionType::SwitchInstance,
            ActionImpact::TerminateRogue => ApprovalActionType::TerminateRogue,
            ActionImpact::DeleteWaste => ApprovalActionType::DeleteWaste,
        }
    }
}

/// Classify an action at `now`.
///
/// Emergency switches are routine inside a maintenance window and need
/// a human outside of one.
pub fn classify(impact: ActionImpact, config: &ApprovalConfig, now: u64) -> RiskLevel {
    match impact {
        ActionImpact::ReturnToSpot => RiskLevel::Low,
        ActionImpact::PlannedSwitch => RiskLevel::Medium,
        ActionImpact::EmergencySwitch => {
            if config.in_maintenance(now) {
                RiskLevel::Medium
            } else {
                RiskLevel::High
            }
        }
        ActionImpact::TerminateRogue | ActionImpact::DeleteWaste => RiskLevel::Critical,
    }
}
