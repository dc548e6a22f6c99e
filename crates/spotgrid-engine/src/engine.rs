//! DecisionEngine: evaluates telemetry into persisted decisions.
//!
//! Evaluations share nothing but the registry and the store. A
//! semaphore sized by `engine.workers` bounds how many run at once,
//! whether they come from the control loop or from a batch.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use spotgrid_core::config::EngineConfig;
use spotgrid_core::{InstanceId, SharedClock, Telemetry};
use spotgrid_predictor::{Features, PredictorScore, SharedPredictor};
use spotgrid_risk::RiskRegistry;
use spotgrid_state::{Decision, FeatureSnapshot, PredictorSnapshot, StateStore};

use crate::error::{EngineError, EngineResult};
use crate::policy::{PolicyInput, decide};

#[derive(Clone)]
pub struct DecisionEngine {
    store: StateStore,
    registry: Arc<RiskRegistry>,
    predictor: SharedPredictor,
    clock: SharedClock,
    config: EngineConfig,
    permits: Arc<Semaphore>,
}

impl DecisionEngine {
    pub fn new(
        store: StateStore,
        registry: Arc<RiskRegistry>,
        predictor: SharedPredictor,
        clock: SharedClock,
        config: EngineConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            store,
            registry,
            predictor,
            clock,
            config,
            permits,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate one sample and persist the resulting decision.
    ///
    /// Malformed telemetry is rejected before anything is read or
    /// written; the caller skips this cycle for the instance.
    pub async fn evaluate(&self, telemetry: &Telemetry) -> EngineResult<Decision> {
        if let Err(e) = telemetry.validate() {
            warn!(
                instance = %telemetry.instance_id,
                error = %e,
                "skipping malformed telemetry"
            );
            return Err(e.into());
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?;

        let pool = &telemetry.current_pool;
        let view = self.registry.query(pool);
        let notice_count = telemetry.notices.len() as u32;

        let features = Features {
            instance_id: telemetry.instance_id.clone(),
            pool: pool.clone(),
            lifecycle: telemetry.lifecycle,
            utilization: telemetry.utilization,
            current_price: telemetry.current_price,
            interruption_count: view.count,
            pool_poisoned: view.is_poisoned,
            notice_count,
        };

        // A poisoned pool decides on its own; skip the remote call.
        let score = if view.is_poisoned {
            None
        } else {
            self.score(&features).await
        };

        let recommended_pool_poisoned = score
            .as_ref()
            .and_then(|s| s.recommended_pool.as_ref())
            .is_some_and(|p| self.registry.is_poisoned(p));

        let verdict = decide(
            &PolicyInput {
                lifecycle: telemetry.lifecycle,
                pool,
                pool_poisoned: view.is_poisoned,
                interruption_count: view.count,
                interruption_signal: telemetry.has_interruption_signal(),
                termination_notice: telemetry.has_termination_notice(),
                predictor: score.as_ref(),
                recommended_pool_poisoned,
            },
            &self.config,
        );

        let decision = Decision {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: telemetry.instance_id.clone(),
            decision_type: verdict.decision_type,
            risk_score: verdict.risk_score,
            confidence: verdict.confidence,
            features_snapshot: FeatureSnapshot {
                pool: pool.clone(),
                lifecycle: telemetry.lifecycle,
                utilization: telemetry.utilization,
                current_price: telemetry.current_price,
                pool_poisoned: view.is_poisoned,
                poison_expires_at: view.expires_at,
                interruption_count: view.count,
                notice_count,
                predictor: score.map(|s| PredictorSnapshot {
                    risk_score: s.risk_score,
                    price_trend: s.price_trend,
                    confidence: s.confidence,
                    recommended_pool: s.recommended_pool,
                }),
            },
            reason: verdict.reason,
            target_pool: verdict.target_pool,
            evaluated_at: self.clock.now(),
        };
        self.store.put_decision(&decision)?;

        if decision.decision_type.is_switch() {
            info!(
                instance = %decision.instance_id,
                decision = decision.decision_type.as_str(),
                risk = decision.risk_score,
                reason = %decision.reason,
                "switch decided"
            );
        } else {
            debug!(
                instance = %decision.instance_id,
                decision = decision.decision_type.as_str(),
                risk = decision.risk_score,
                "hold decided"
            );
        }

        Ok(decision)
    }

    async fn score(&self, features: &Features) -> Option<PredictorScore> {
        let timeout = self.config.predictor_timeout();
        match tokio::time::timeout(timeout, self.predictor.score(features)).await {
            Ok(Ok(score)) => Some(score),
            Ok(Err(e)) => {
                debug!(
                    instance = %features.instance_id,
                    predictor = self.predictor.name(),
                    error = %e,
                    "predictor unavailable, using fallback rules"
                );
                None
            }
            Err(_) => {
                warn!(
                    instance = %features.instance_id,
                    predictor = self.predictor.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "predictor timed out, using fallback rules"
                );
                None
            }
        }
    }

    /// Evaluate many samples concurrently, bounded by the worker pool.
    /// Results come back in input order.
    pub async fn evaluate_batch(
        &self,
        samples: Vec<Telemetry>,
    ) -> Vec<(InstanceId, EngineResult<Decision>)> {
        let mut set = JoinSet::new();
        for (idx, sample) in samples.into_iter().enumerate() {
            let engine = self.clone();
            set.spawn(async move {
                let result = engine.evaluate(&sample).await;
                (idx, sample.instance_id, result)
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => error!(error = %e, "evaluation task panicked"),
            }
        }
        results.sort_by_key(|(idx, _, _)| *idx);
        results
            .into_iter()
            .map(|(_, instance, result)| (instance, result))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use spotgrid_core::config::RegistryConfig;
    use spotgrid_core::{Lifecycle, ManualClock, Notice, PoolKey};
    use spotgrid_predictor::{
        Predictor, PredictorError, PredictorResult, StaticPredictor, UnavailablePredictor,
    };
    use spotgrid_state::{DecisionType, RiskEventType};

    use super::*;

    const DAY: u64 = 86_400;
    const T0: u64 = 1_700_000_000;

    struct SlowPredictor;

    #[async_trait]
    impl Predictor for SlowPredictor {
        async fn score(&self, _features: &Features) -> PredictorResult<PredictorScore> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Err(PredictorError::Unavailable)
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    struct Harness {
        engine: DecisionEngine,
        registry: Arc<RiskRegistry>,
        store: StateStore,
        clock: Arc<ManualClock>,
    }

    fn harness(predictor: SharedPredictor) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let store = StateStore::open_in_memory().unwrap();
        let registry = Arc::new(RiskRegistry::new(
            store.clone(),
            clock.clone(),
            &RegistryConfig::default(),
        ));
        let config = EngineConfig {
            predictor_timeout: "50ms".to_string(),
            workers: 4,
            ..Default::default()
        };
        let engine = DecisionEngine::new(
            store.clone(),
            registry.clone(),
            predictor,
            clock.clone(),
            config,
        );
        Harness {
            engine,
            registry,
            store,
            clock,
        }
    }

    fn confident(risk: f64) -> SharedPredictor {
        Arc::new(StaticPredictor::new(PredictorScore {
            risk_score: risk,
            price_trend: 0.0,
            confidence: 0.9,
            recommended_pool: None,
        }))
    }

    fn pool() -> PoolKey {
        PoolKey::new("us-east-1", "us-east-1a", "m5")
    }

    fn telemetry(instance: &str) -> Telemetry {
        Telemetry {
            instance_id: instance.to_string(),
            tenant_id: "acme".to_string(),
            utilization: 0.35,
            current_price: 0.031,
            current_pool: pool(),
            lifecycle: Lifecycle::Spot,
            notices: Vec::new(),
            protected: false,
        }
    }

    #[tokio::test]
    async fn healthy_instance_stays_spot() {
        let h = harness(confident(0.1));
        let decision = h.engine.evaluate(&telemetry("i-1")).await.unwrap();
        assert_eq!(decision.decision_type, DecisionType::StaySpot);
        assert!(decision.confidence > 0.8);
        assert_eq!(decision.evaluated_at, T0);

        let stored = h.store.latest_decision("i-1").unwrap().unwrap();
        assert_eq!(stored, decision);
    }

    #[tokio::test]
    async fn poisoned_pool_switches_then_recovers() {
        let h = harness(confident(0.1));
        h.registry
            .report(&pool(), RiskEventType::TerminationNotice, "other-tenant", None, None)
            .unwrap();

        h.clock.advance(1);
        let decision = h.engine.evaluate(&telemetry("i-1")).await.unwrap();
        assert_eq!(decision.decision_type, DecisionType::SwitchToOndemand);
        assert_eq!(decision.risk_score, 1.0);
        assert!(decision.features_snapshot.pool_poisoned);
        assert!(decision.features_snapshot.predictor.is_none());

        h.clock.set(T0 + 15 * DAY + 1);
        let decision = h.engine.evaluate(&telemetry("i-1")).await.unwrap();
        assert_eq!(decision.decision_type, DecisionType::StaySpot);
        assert!(!decision.features_snapshot.pool_poisoned);
        assert_eq!(decision.features_snapshot.interruption_count, 0);
    }

    #[tokio::test]
    async fn missing_predictor_uses_notice_signal() {
        let h = harness(Arc::new(UnavailablePredictor));
        let mut t = telemetry("i-1");
        t.notices.push(Notice {
            id: "n-1".to_string(),
            kind: RiskEventType::RebalanceNotice,
            issued_at: T0,
        });
        let decision = h.engine.evaluate(&t).await.unwrap();
        assert_eq!(decision.decision_type, DecisionType::SwitchToOndemand);

        let decision = h.engine.evaluate(&telemetry("i-2")).await.unwrap();
        assert_eq!(decision.decision_type, DecisionType::StaySpot);
    }

    #[tokio::test]
    async fn predictor_timeout_falls_back() {
        let h = harness(Arc::new(SlowPredictor));
        let decision = h.engine.evaluate(&telemetry("i-1")).await.unwrap();
        assert_eq!(decision.decision_type, DecisionType::StaySpot);
        assert!(decision.reason.contains("predictor unavailable"));
    }

    #[tokio::test]
    async fn malformed_telemetry_writes_nothing() {
        let h = harness(confident(0.1));
        let mut t = telemetry("i-1");
        t.utilization = 2.0;
        let err = h.engine.evaluate(&t).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTelemetry(_)));
        assert!(h.store.latest_decision("i-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn each_evaluation_writes_one_decision() {
        let h = harness(confident(0.1));
        for _ in 0..3 {
            h.engine.evaluate(&telemetry("i-1")).await.unwrap();
        }
        assert_eq!(h.store.list_decisions("i-1", 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_reports_failures() {
        let h = harness(confident(0.8));
        let mut bad = telemetry("i-bad");
        bad.current_price = -1.0;
        let samples = vec![telemetry("i-1"), bad, telemetry("i-3")];

        let results = h.engine.evaluate_batch(samples).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "i-1");
        assert_eq!(
            results[0].1.as_ref().unwrap().decision_type,
            DecisionType::SwitchToOndemand
        );
        assert!(results[1].1.is_err());
        assert_eq!(results[2].0, "i-3");
    }
}
