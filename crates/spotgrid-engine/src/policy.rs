//! The decision policy as a pure function.

use spotgrid_core::config::EngineConfig;
use spotgrid_core::{Lifecycle, PoolKey};
use spotgrid_predictor::PredictorScore;
use spotgrid_state::DecisionType;

/// Everything the policy looks at.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub lifecycle: Lifecycle,
    pub pool: &'a PoolKey,
    pub pool_poisoned: bool,
    /// Active events in the pool's window.
    pub interruption_count: u32,
    /// The sample carries at least one notice.
    pub interruption_signal: bool,
    /// The sample carries a termination notice.
    pub termination_notice: bool,
    /// Present only when the predictor answered in time.
    pub predictor: Option<&'a PredictorScore>,
    /// Whether the predictor's recommended pool is poisoned.
    pub recommended_pool_poisoned: bool,
}

/// Policy output, before it is stamped into a `Decision`.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub decision_type: DecisionType,
    pub risk_score: f64,
    pub confidence: f64,
    pub reason: String,
    pub target_pool: Option<PoolKey>,
}

impl Verdict {
    fn new(decision_type: DecisionType, risk_score: f64, confidence: f64, reason: String) -> Self {
        Self {
            decision_type,
            risk_score: risk_score.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            reason,
            target_pool: None,
        }
    }
}

/// Apply the decision policy.
pub fn decide(input: &PolicyInput<'_>, config: &EngineConfig) -> Verdict {
    // Rule 1: a poisoned pool overrides everything else.
    if input.pool_poisoned {
        return Verdict::new(
            DecisionType::SwitchToOndemand,
            1.0,
            1.0,
            "pool poisoned".to_string(),
        );
    }

    let registry_risk = config.interruption_weight * input.interruption_count as f64;

    // Rule 2: rule-based fallback.
    let score = match input.predictor {
        Some(score) if score.confidence >= config.confidence_floor => score,
        other => {
            let why = match other {
                Some(score) => format!(
                    "predictor confidence {:.2} below floor {:.2}",
                    score.confidence, config.confidence_floor
                ),
                None => "predictor unavailable".to_string(),
            };
            let confidence = other.map(|s| s.confidence).unwrap_or(0.0);

            if input.interruption_signal {
                let (risk, signal) = if input.termination_notice {
                    (1.0, "termination notice")
                } else {
                    (config.high_risk_threshold.max(registry_risk), "rebalance notice")
                };
                return Verdict::new(
                    DecisionType::SwitchToOndemand,
                    risk,
                    1.0,
                    format!("{why}; {signal} received"),
                );
            }
            return Verdict::new(
                DecisionType::hold(input.lifecycle),
                registry_risk,
                confidence,
                format!("{why}; no interruption signal"),
            );
        }
    };

    // Rule 3: predictor with the registry count as tie-break.
    let risk = (score.risk_score + registry_risk).min(1.0);

    if risk >= config.high_risk_threshold {
        return Verdict::new(
            DecisionType::SwitchToOndemand,
            risk,
            score.confidence,
            format!(
                "risk {risk:.2} at or above {:.2} ({} active events)",
                config.high_risk_threshold, input.interruption_count
            ),
        );
    }

    if risk < config.low_risk_threshold
        && let Some(target) = healthy_pool(input, score)
    {
        let mut verdict = Verdict::new(
            DecisionType::SwitchToSpot,
            risk,
            score.confidence,
            format!(
                "risk {risk:.2} below {:.2}; spot pool {target} is healthy",
                config.low_risk_threshold
            ),
        );
        verdict.target_pool = Some(target);
        return verdict;
    }

    Verdict::new(
        DecisionType::hold(input.lifecycle),
        risk,
        score.confidence,
        format!("risk {risk:.2} within bounds; keeping {}", input.lifecycle),
    )
}

/// A better-priced pool that is safe to move to.
fn healthy_pool(input: &PolicyInput<'_>, score: &PredictorScore) -> Option<PoolKey> {
    if let Some(recommended) = &score.recommended_pool
        && recommended != input.pool
        && !input.recommended_pool_poisoned
    {
        return Some(recommended.clone());
    }
    // On-demand instances may return to their own (unpoisoned) pool when
    // spot prices are not rising.
    if input.lifecycle == Lifecycle::OnDemand && score.price_trend <= 0.0 {
        return Some(input.pool.clone());
    }
    None
}
