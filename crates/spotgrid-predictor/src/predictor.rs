//! Predictor trait, feature vector and the in-process implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use spotgrid_core::config::{PredictorConfig, PredictorKind};
use spotgrid_core::{InstanceId, Lifecycle, PoolKey};

use crate::error::{PredictorError, PredictorResult};
use crate::http::HttpPredictor;

/// Inputs sent to a predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Features {
    pub instance_id: InstanceId,
    pub pool: PoolKey,
    pub lifecycle: Lifecycle,
    pub utilization: f64,
    pub current_price: f64,
    pub interruption_count: u32,
    pub pool_poisoned: bool,
    pub notice_count: u32,
}

/// A predictor's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorScore {
    /// Probability of interruption, 0.0–1.0.
    pub risk_score: f64,
    /// Negative when prices are falling.
    pub price_trend: f64,
    /// 0.0–1.0
    pub confidence: f64,
    /// A cheaper pool the predictor considers healthy, if any.
    #[serde(default)]
    pub recommended_pool: Option<PoolKey>,
}

impl PredictorScore {
    /// Reject scores outside their documented ranges.
    pub fn validate(&self) -> PredictorResult<()> {
        for (name, value) in [("risk_score", self.risk_score), ("confidence", self.confidence)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(PredictorError::InvalidResponse(format!(
                    "{name} out of range: {value}"
                )));
            }
        }
        if !self.price_trend.is_finite() {
            return Err(PredictorError::InvalidResponse(format!(
                "price_trend not finite: {}",
                self.price_trend
            )));
        }
        Ok(())
    }
}

/// Scoring capability.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn score(&self, features: &Features) -> PredictorResult<PredictorScore>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

pub type SharedPredictor = Arc<dyn Predictor>;

/// Always unavailable; the engine stays on its fallback rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailablePredictor;

#[async_trait]
impl Predictor for UnavailablePredictor {
    async fn score(&self, _features: &Features) -> PredictorResult<PredictorScore> {
        Err(PredictorError::Unavailable)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Returns the same score for every instance.
#[derive(Debug, Clone)]
pub struct StaticPredictor {
    score: PredictorScore,
}

impl StaticPredictor {
    pub fn new(score: PredictorScore) -> Self {
        Self { score }
    }
}

#[async_trait]
impl Predictor for StaticPredictor {
    async fn score(&self, _features: &Features) -> PredictorResult<PredictorScore> {
        Ok(self.score.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Select the implementation named by the config.
pub fn build_predictor(config: &PredictorConfig) -> SharedPredictor {
    let predictor: SharedPredictor = match (config.kind, &config.endpoint) {
        (PredictorKind::Static, _) => Arc::new(StaticPredictor::new(PredictorScore {
            risk_score: config.static_risk,
            price_trend: config.static_price_trend,
            confidence: config.static_confidence,
            recommended_pool: None,
        })),
        (PredictorKind::Http, Some(endpoint)) => Arc::new(HttpPredictor::new(endpoint)),
        (PredictorKind::Http, None) | (PredictorKind::None, _) => Arc::new(UnavailablePredictor),
    };
    info!(predictor = predictor.name(), "predictor selected");
    predictor
}
