//! Router tests: the REST surface in front of a real control loop.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tower::ServiceExt;

use spotgrid_api::{ApiState, build_router};
use spotgrid_control::{Collaborators, ControlLoop};
use spotgrid_core::config::ReplicaConfig;
use spotgrid_core::{ManualClock, Notice, SpotgridConfig, Telemetry};
use spotgrid_dispatch::{AgentReplicaBackend, CommandSigner, TcpAgentTransport};
use spotgrid_predictor::{PredictorScore, StaticPredictor};
use spotgrid_replica::HttpReplicaProbe;
use spotgrid_state::*;

const T0: u64 = 1_700_000_000;

fn control() -> ControlLoop {
    let clock = Arc::new(ManualClock::new(T0));
    let signer = Arc::new(CommandSigner::generate());
    // Never reached: nothing in these tests needs actuation.
    let transport = Arc::new(TcpAgentTransport::new("127.0.0.1:1"));
    let predictor = Arc::new(StaticPredictor::new(PredictorScore {
        risk_score: 0.1,
        price_trend: 0.0,
        confidence: 0.9,
        recommended_pool: None,
    }));
    ControlLoop::assemble(
        &SpotgridConfig::default(),
        StateStore::open_in_memory().unwrap(),
        clock.clone(),
        Collaborators {
            predictor,
            transport: transport.clone(),
            signer: signer.clone(),
            replica_backend: Arc::new(AgentReplicaBackend::new(
                transport,
                signer,
                clock,
                Duration::from_secs(1),
            )),
            replica_probe: Arc::new(HttpReplicaProbe::new(&ReplicaConfig::default())),
        },
    )
    .unwrap()
}

fn telemetry_body(instance: &str, utilization: f64) -> Body {
    Body::from(
        serde_json::json!({
            "instance_id": instance,
            "utilization": utilization,
            "current_price": 0.04,
            "current_pool": {
                "region": "us-east-1",
                "availability_zone": "us-east-1a",
                "instance_family": "m5"
            }
        })
        .to_string(),
    )
}

fn post(uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json(resp: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn telemetry_is_queued_and_decided() {
    let control = control();
    let (tx, mut rx) = mpsc::channel(4);
    let router = build_router(ApiState::for_loop(&control, tx));

    let resp = router
        .clone()
        .oneshot(post("/api/v1/telemetry", telemetry_body("i-web", 0.3)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // Drive the cycle by hand instead of running the loop.
    let sample: Telemetry = rx.recv().await.unwrap();
    control.handle_telemetry(sample).await.unwrap();

    let resp = router
        .clone()
        .oneshot(get("/api/v1/instances/i-web/decision"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["decision_type"], "stay_spot");

    let resp = router
        .oneshot(get("/api/v1/instances/i-web/decisions?limit=5"))
        .await
        .unwrap();
    let body = json(resp).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_telemetry_is_bad_request() {
    let control = control();
    let (tx, _rx) = mpsc::channel(4);
    let router = build_router(ApiState::for_loop(&control, tx));

    let resp = router
        .clone()
        .oneshot(post("/api/v1/telemetry", telemetry_body("i-web", 7.0)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json(resp).await;
    assert_eq!(body["success"], false);

    let resp = router
        .oneshot(post("/api/v1/telemetry", Body::from("{not json")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(control.metrics().snapshot().telemetry["rejected"], 2);
}

#[tokio::test]
async fn termination_notice_shows_up_in_registry_routes() {
    let control = control();
    let (tx, _rx) = mpsc::channel(4);
    let router = build_router(ApiState::for_loop(&control, tx));

    let sample = Telemetry {
        notices: vec![Notice {
            id: "n-1".to_string(),
            kind: RiskEventType::TerminationNotice,
            issued_at: T0,
        }],
        ..serde_json::from_value::<Telemetry>(serde_json::json!({
            "instance_id": "i-web",
            "utilization": 0.3,
            "current_price": 0.04,
            "current_pool": {
                "region": "us-east-1",
                "availability_zone": "us-east-1a",
                "instance_family": "m5"
            }
        }))
        .unwrap()
    };
    control.handle_telemetry(sample).await.unwrap();

    let resp = router
        .clone()
        .oneshot(get("/api/v1/pools/us-east-1/us-east-1a/m5"))
        .await
        .unwrap();
    let body = json(resp).await;
    assert_eq!(body["data"]["is_poisoned"], true);

    let resp = router
        .clone()
        .oneshot(get("/api/v1/risk-events?pool=us-east-1/us-east-1a/m5"))
        .await
        .unwrap();
    let body = json(resp).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // The emergency switch waits for a human.
    let resp = router
        .clone()
        .oneshot(get("/api/v1/approvals?status=pending"))
        .await
        .unwrap();
    let body = json(resp).await;
    let pending = body["data"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    let id = pending[0]["id"].as_str().unwrap().to_string();

    let resp = router
        .clone()
        .oneshot(post(
            &format!("/api/v1/approvals/{id}/reject"),
            Body::from(r#"{"actor":"ops","reason":"false alarm"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .clone()
        .oneshot(post(
            &format!("/api/v1/approvals/{id}/approve"),
            Body::from(r#"{"actor":"ops"}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("spotgrid_pools_poisoned 1"));
    assert!(text.contains("spotgrid_approvals{status=\"rejected\"} 1"));
}
