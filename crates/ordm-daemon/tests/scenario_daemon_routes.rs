//! In-process scenario tests for the ordm-daemon HTTP surface.
//!
//! The router is driven via `tower::ServiceExt::oneshot` over an engine
//! backed by the in-memory ledger and paper oracle; no TCP socket. Every
//! engine error reaches the client as `{ error, message, remaining? }` with
//! the status its kind maps to.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use chrono::Duration;
use http_body_util::BodyExt;
use ordm_daemon::{routes, state};
use ordm_testkit::{commit_tx, Harness};
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn setup(supply: usize) -> (Harness, Arc<state::AppState>) {
    let h = Harness::new(supply).await;
    let st = Arc::new(state::AppState::new(h.engine.clone()));
    (h, st)
}

async fn call(st: &Arc<state::AppState>, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let router = routes::build_router(Arc::clone(st));
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body: bytes::Bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("body is not valid JSON")
    };
    (status, json)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn claim_body(h: &Harness, phase_id: Option<uuid::Uuid>, wallet: &str, quantity: i64) -> Value {
    json!({
        "collection_id": h.collection_id,
        "phase_id": phase_id,
        "wallet": wallet,
        "quantity": quantity,
    })
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_backends() {
    let (_h, st) = setup(1).await;
    let (status, json) = call(&st, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "ordm-daemon");
    assert_eq!(json["store"], "memory");
    assert_eq!(json["oracle"], "paper");
}

// ---------------------------------------------------------------------------
// POST /v1/claims
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_then_quota_conflict_carries_remaining() {
    let (h, st) = setup(5).await;
    let phase = h.public_phase(Some(1)).await;

    let (status, json) = call(
        &st,
        post("/v1/claims", claim_body(&h, Some(phase.phase_id), "bc1q-w", 1)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["reservations"].as_array().unwrap().len(), 1);
    assert_eq!(json["reservations"][0]["status"], "reserved");

    let (status, json) = call(
        &st,
        post("/v1/claims", claim_body(&h, Some(phase.phase_id), "bc1q-w", 1)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "quota_exceeded");
    assert_eq!(json["remaining"], 0);
    assert_eq!(json["message"], "0 remaining, requested 1");
}

#[tokio::test]
async fn short_supply_is_a_conflict_with_available_count() {
    let (h, st) = setup(2).await;
    let (status, json) = call(&st, post("/v1/claims", claim_body(&h, None, "bc1q-w", 3))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "insufficient_supply");
    assert_eq!(json["remaining"], 2);
    assert_eq!(h.ledger.reservation_count().await, 0);
}

#[tokio::test]
async fn unlisted_wallet_is_forbidden() {
    let (h, st) = setup(2).await;
    let phase = h.allow_list_phase(Some(1), &["bc1q-listed"], 1).await;
    let (status, json) = call(
        &st,
        post("/v1/claims", claim_body(&h, Some(phase.phase_id), "bc1q-stranger", 1)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "not_eligible");
    assert!(json.get("remaining").is_none());
}

#[tokio::test]
async fn bad_quantity_is_a_bad_request() {
    let (h, st) = setup(2).await;
    let (status, json) = call(&st, post("/v1/claims", claim_body(&h, None, "bc1q-w", 0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_quantity");
}

// ---------------------------------------------------------------------------
// POST /v1/claims/cancel  /v1/claims/complete  GET /v1/reservations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_requires_ownership() {
    let (h, st) = setup(1).await;
    let (_, json) = call(&st, post("/v1/claims", claim_body(&h, None, "bc1q-w", 1))).await;
    let reservation_id = json["reservations"][0]["reservation_id"].clone();

    let (status, json) = call(
        &st,
        post(
            "/v1/claims/cancel",
            json!({
                "wallet": "bc1q-thief",
                "selector": { "by": "reservation", "reservation_id": reservation_id },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "not_owned");

    let (status, json) = call(
        &st,
        post(
            "/v1/claims/cancel",
            json!({
                "wallet": "bc1q-w",
                "selector": { "by": "all_for_wallet", "collection_id": h.collection_id },
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cancelled"], json!([reservation_id]));
}

#[tokio::test]
async fn complete_then_list_reservations() {
    let (h, st) = setup(1).await;
    let (_, json) = call(&st, post("/v1/claims", claim_body(&h, None, "bc1q-w", 1))).await;
    let reservation_id = json["reservations"][0]["reservation_id"].clone();

    let body = json!({
        "reservation_id": reservation_id,
        "wallet": "bc1q-w",
        "settlement_ref": "psbt-7",
    });
    let (status, json) = call(&st, post("/v1/claims/complete", body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["completed"], true);
    let (_, json) = call(&st, post("/v1/claims/complete", body)).await;
    assert_eq!(json["completed"], false);

    let uri = format!(
        "/v1/reservations?wallet=bc1q-w&collection_id={}",
        h.collection_id
    );
    let (status, json) = call(&st, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reservations"][0]["status"], "completed");
    assert_eq!(json["reservations"][0]["settlement_ref"], "psbt-7");
}

// ---------------------------------------------------------------------------
// GET /v1/eligibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn eligibility_reports_remaining() {
    let (h, st) = setup(3).await;
    let phase = h.public_phase(Some(2)).await;
    call(
        &st,
        post("/v1/claims", claim_body(&h, Some(phase.phase_id), "bc1q-w", 1)),
    )
    .await;

    let uri = format!(
        "/v1/eligibility?wallet=bc1q-w&collection_id={}&phase_id={}",
        h.collection_id, phase.phase_id
    );
    let (status, json) = call(&st, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["remaining"], 1);
    assert_eq!(json["minted_count"], 1);
    assert_eq!(json["max_allowed"], 2);

    let uri = format!(
        "/v1/eligibility?wallet=bc1q-w&collection_id={}&phase_id={}",
        h.collection_id,
        uuid::Uuid::new_v4()
    );
    let (status, json) = call(&st, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

// ---------------------------------------------------------------------------
// /v1/mints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn settlement_runs_end_to_end_over_http() {
    let (h, st) = setup(1).await;
    let phase = h.public_phase(Some(1)).await;
    let (_, json) = call(
        &st,
        post("/v1/claims", claim_body(&h, Some(phase.phase_id), "bc1q-w", 1)),
    )
    .await;
    let reservation_id = json["reservations"][0]["reservation_id"].clone();

    let new_mint = json!({
        "reservation_id": reservation_id,
        "wallet": "bc1q-w",
        "receiving_wallet": "bc1q-receive",
        "fee_rate": 3.5,
    });
    let (status, json) = call(&st, post("/v1/mints", new_mint.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["created"], true);
    assert_eq!(json["mint"]["status"], "pending");
    let mint_id = json["mint"]["mint_id"].as_str().unwrap().to_string();

    let (status, json) = call(&st, post("/v1/mints", new_mint)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["created"], false);

    let events_uri = format!("/v1/mints/{mint_id}/events");
    let steps = [
        (
            json!({"type": "commit_broadcast", "tx_id": "c1", "output_index": 0, "output_value": 546}),
            "commit_broadcast",
        ),
        (
            json!({"type": "confirmations", "tx_kind": "commit", "confirmations": 1}),
            "commit_confirming",
        ),
        (json!({"type": "commit_confirmed"}), "commit_confirmed"),
        (json!({"type": "reveal_broadcast", "tx_id": "r1"}), "reveal_broadcast"),
        (
            json!({"type": "reveal_confirmed", "inscription_id": "r1i0"}),
            "completed",
        ),
    ];
    for (event, to) in steps {
        let (status, json) = call(&st, post(&events_uri, event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "applied");
        assert_eq!(json["to"], to);
    }

    let (status, json) = call(
        &st,
        post(
            &events_uri,
            json!({"type": "reveal_confirmed", "inscription_id": "r1i0"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "duplicate");

    let (status, json) = call(&st, get(&format!("/v1/mints/{mint_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "completed");
    assert_eq!(json["inscription_id"], "r1i0");
    assert_eq!(json["phase_counted"], true);
}

#[tokio::test]
async fn out_of_order_event_is_reported_as_ignored() {
    let (h, st) = setup(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;

    let (status, json) = call(
        &st,
        post(
            &format!("/v1/mints/{}/events", m.mint_id),
            json!({"type": "reveal_confirmed", "inscription_id": "x"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "ignored");
    assert_eq!(json["status"], "pending");
}

#[tokio::test]
async fn operator_events_and_unknown_mints_are_rejected() {
    let (h, st) = setup(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;

    let (status, json) = call(
        &st,
        post(
            &format!("/v1/mints/{}/events", m.mint_id),
            json!({"type": "mark_resolved"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");

    let (status, json) = call(&st, get(&format!("/v1/mints/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

// ---------------------------------------------------------------------------
// /v1/stuck
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_flags_then_operator_abandons() {
    let (h, st) = setup(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;
    h.engine
        .record_commit_broadcast(m.mint_id, &commit_tx(m.mint_id), 0, 546)
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(31));

    let mut rx = st.bus.subscribe();
    let (status, json) = call(&st, post("/v1/stuck/sweep", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["flagged"], 1);
    match rx.try_recv() {
        Ok(state::BusMsg::Sweep(report)) => assert_eq!(report.flagged, 1),
        other => panic!("expected a sweep report on the bus, got {other:?}"),
    }

    let (status, json) = call(&st, get("/v1/stuck")).await;
    assert_eq!(status, StatusCode::OK);
    let stuck = json["stuck"].as_array().unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0]["tx_kind"], "commit");
    let stuck_id = stuck[0]["stuck_id"].as_str().unwrap().to_string();

    let resolve_uri = format!("/v1/stuck/{stuck_id}/resolve");
    let (status, json) = call(&st, post(&resolve_uri, json!({"action": "abandon"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stuck"]["status"], "abandoned");
    assert_eq!(json["mint"]["status"], "failed");

    let (status, json) = call(&st, post(&resolve_uri, json!({"action": "mark_resolved"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "invalid_state_transition");
}

#[tokio::test]
async fn fee_bump_below_current_rate_is_a_bad_request() {
    let (h, st) = setup(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;
    h.engine
        .record_commit_broadcast(m.mint_id, &commit_tx(m.mint_id), 0, 546)
        .await
        .unwrap();
    h.oracle
        .set_unconfirmed(&commit_tx(m.mint_id), Some(4.0))
        .await;
    h.clock.advance(Duration::minutes(40));
    h.engine.run_stuck_sweep().await.unwrap();
    let stuck_id = h.ledger.stuck_for_mint(m.mint_id).await[0].stuck_id;

    let uri = format!("/v1/stuck/{stuck_id}/resolve");
    let (status, _) = call(
        &st,
        post(&uri, json!({"action": "request_cpfp", "target_fee_rate": 3.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = call(
        &st,
        post(&uri, json!({"action": "request_cpfp", "target_fee_rate": 18.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stuck"]["status"], "cpfp_sent");
    assert_eq!(json["stuck"]["target_fee_rate"], 18.0);
}

// ---------------------------------------------------------------------------
// POST /v1/phases/:phase_id/recount
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recount_rebuilds_phase_counter() {
    let (h, st) = setup(2).await;
    let phase = h.public_phase(None).await;
    h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;
    h.ledger.put_phase_counter(phase.phase_id, 9).await;

    let (status, json) = call(
        &st,
        post(&format!("/v1/phases/{}/recount", phase.phase_id), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["minted_count"], 1);
    assert_eq!(json["entries_updated"], 0);
}
