//! ApprovalGate: request creation, lazy expiry and serialized resolution.

use tracing::{debug, error, info, warn};

use spotgrid_core::config::ApprovalConfig;
use spotgrid_core::{InstanceId, SharedClock};
use spotgrid_state::{
    ActionStatus, ApprovalRequest, ApprovalStatus, RiskLevel, StateStore,
};

use crate::classify::{ActionImpact, classify};
use crate::error::{ApprovalError, ApprovalResult};

/// An action offered to the gate.
#[derive(Debug, Clone)]
pub struct ActionProposal {
    pub impact: ActionImpact,
    pub instance_id: Option<InstanceId>,
    pub decision_id: Option<String>,
    /// Replayed to the dispatcher on approval.
    pub payload: serde_json::Value,
    /// Action record to discard if the request does not get approved.
    pub action_key: Option<String>,
}

/// Result of an approve or reject call.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// This call recorded the terminal status.
    Applied(ApprovalRequest),
    /// The request was already terminal (possibly just expired); nothing changed.
    AlreadyResolved(ApprovalRequest),
}

impl Resolution {
    pub fn request(&self) -> &ApprovalRequest {
        match self {
            Resolution::Applied(r) | Resolution::AlreadyResolved(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Resolution::Applied(_))
    }
}

enum Outcome {
    Applied,
    Expired,
    AlreadyResolved,
}

/// Move a due pending request to `expired`. Returns whether it moved.
fn expire_if_due(request: &mut ApprovalRequest, now: u64) -> bool {
    if request.status == ApprovalStatus::Pending && now >= request.expires_at {
        request.status = ApprovalStatus::Expired;
        request.resolved_at = Some(now);
        request.note = Some("no response before deadline".to_string());
        true
    } else {
        false
    }
}

#[derive(Clone)]
pub struct ApprovalGate {
    store: StateStore,
    clock: SharedClock,
    config: ApprovalConfig,
}

impl ApprovalGate {
    pub fn new(store: StateStore, clock: SharedClock, config: ApprovalConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Risk level of an action proposed now.
    pub fn classify(&self, impact: ActionImpact) -> RiskLevel {
        classify(impact, &self.config, self.clock.now())
    }

    /// Park an action behind a new pending request.
    pub fn submit(&self, proposal: ActionProposal) -> ApprovalResult<ApprovalRequest> {
        let now = self.clock.now();
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: proposal.impact.action_type(),
            risk_level: classify(proposal.impact, &self.config, now),
            instance_id: proposal.instance_id,
            decision_id: proposal.decision_id,
            payload: proposal.payload,
            status: ApprovalStatus::Pending,
            requested_at: now,
            expires_at: now.saturating_add(self.config.ttl().as_secs()),
            resolved_at: None,
            resolved_by: None,
            note: None,
            dispatched_at: None,
            action_key: proposal.action_key,
        };
        self.store.insert_approval(&request)?;
        info!(
            approval = %request.id,
            instance = ?request.instance_id,
            risk_level = ?request.risk_level,
            expires_at = request.expires_at,
            "approval requested"
        );
        Ok(request)
    }

    /// Fetch a request with expiry applied.
    pub fn get(&self, id: &str) -> ApprovalResult<ApprovalRequest> {
        let request = self
            .store
            .get_approval(id)?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        self.refresh(request)
    }

    /// All requests, optionally filtered by status, with expiry applied.
    pub fn list(&self, status: Option<ApprovalStatus>) -> ApprovalResult<Vec<ApprovalRequest>> {
        let mut requests = Vec::new();
        for request in self.store.list_approvals()? {
            let request = self.refresh(request)?;
            if status.is_none_or(|s| request.status == s) {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    fn refresh(&self, request: ApprovalRequest) -> ApprovalResult<ApprovalRequest> {
        let now = self.clock.now();
        if request.status != ApprovalStatus::Pending || now < request.expires_at {
            return Ok(request);
        }
        let (request, expired) = self
            .store
            .update_approval(&request.id, |r| (expire_if_due(r, now), r.clone()))?
            .map(|(expired, r)| (r, expired))
            .ok_or_else(|| ApprovalError::NotFound(request.id.clone()))?;
        if expired {
            self.discard_action(&request);
        }
        Ok(request)
    }

    pub fn approve(&self, id: &str, actor: &str) -> ApprovalResult<Resolution> {
        self.resolve(id, ApprovalStatus::Approved, actor, None)
    }

    pub fn reject(&self, id: &str, actor: &str, reason: Option<String>) -> ApprovalResult<Resolution> {
        self.resolve(id, ApprovalStatus::Rejected, actor, reason)
    }

    fn resolve(
        &self,
        id: &str,
        target: ApprovalStatus,
        actor: &str,
        note: Option<String>,
    ) -> ApprovalResult<Resolution> {
        let now = self.clock.now();
        let (outcome, request) = self
            .store
            .update_approval(id, |r| {
                if expire_if_due(r, now) {
                    return (Outcome::Expired, r.clone());
                }
                if r.status.is_terminal() {
                    return (Outcome::AlreadyResolved, r.clone());
                }
                r.status = target;
                r.resolved_at = Some(now);
                r.resolved_by = Some(actor.to_string());
                r.note = note;
                (Outcome::Applied, r.clone())
            })?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;

        match outcome {
            Outcome::Applied => {
                info!(
                    approval = %request.id,
                    status = request.status.as_str(),
                    actor,
                    "approval resolved"
                );
                if request.status == ApprovalStatus::Rejected {
                    self.discard_action(&request);
                }
                Ok(Resolution::Applied(request))
            }
            Outcome::Expired => {
                self.discard_action(&request);
                Ok(Resolution::AlreadyResolved(request))
            }
            Outcome::AlreadyResolved => {
                debug!(
                    approval = %request.id,
                    status = request.status.as_str(),
                    attempted = target.as_str(),
                    "approval already resolved"
                );
                Ok(Resolution::AlreadyResolved(request))
            }
        }
    }

    /// Claim an approved request for execution. Returns it exactly once;
    /// later calls and non-approved requests yield `None`.
    pub fn claim_for_dispatch(&self, id: &str) -> ApprovalResult<Option<ApprovalRequest>> {
        let now = self.clock.now();
        self.store
            .update_approval(id, |r| {
                if r.status == ApprovalStatus::Approved && r.dispatched_at.is_none() {
                    r.dispatched_at = Some(now);
                    Some(r.clone())
                } else {
                    None
                }
            })?
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))
    }

    /// Claim every approved request not yet dispatched.
    pub fn claim_approved(&self) -> ApprovalResult<Vec<ApprovalRequest>> {
        let mut claimed = Vec::new();
        for request in self.store.list_approvals()? {
            if request.status == ApprovalStatus::Approved
                && request.dispatched_at.is_none()
                && let Some(request) = self.claim_for_dispatch(&request.id)?
            {
                claimed.push(request);
            }
        }
        Ok(claimed)
    }

    /// Housekeeping: expire every due pending request. Returns the
    /// requests this call expired.
    pub fn sweep(&self) -> ApprovalResult<Vec<ApprovalRequest>> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for request in self.store.list_approvals()? {
            if request.status != ApprovalStatus::Pending || now < request.expires_at {
                continue;
            }
            if let Some((true, request)) = self
                .store
                .update_approval(&request.id, |r| (expire_if_due(r, now), r.clone()))?
            {
                self.discard_action(&request);
                expired.push(request);
            }
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "approval sweep");
        }
        Ok(expired)
    }

    /// Mark the held action discarded once its request ends unapproved.
    fn discard_action(&self, request: &ApprovalRequest) {
        warn!(
            approval = %request.id,
            instance = ?request.instance_id,
            status = request.status.as_str(),
            "approval not granted, action discarded"
        );
        let Some(key) = &request.action_key else {
            return;
        };
        let now = self.clock.now();
        let detail = format!("approval {} {}", request.id, request.status.as_str());
        match self.store.update_action(key, |a| {
            a.status = ActionStatus::Discarded;
            a.detail = Some(detail);
            a.updated_at = now;
        }) {
            Ok(Some(())) => {}
            Ok(None) => warn!(action = %key, "held action record missing"),
            Err(e) => error!(action = %key, error = %e, "failed to discard held action"),
        }
    }
}
