//! Scenario: concurrent claims never lease the same asset twice.
//!
//! At any instant an asset has at most one live reservation, no matter how
//! many wallets race for the last units of supply. A wallet racing itself
//! still cannot exceed its per-wallet quota.

use std::collections::BTreeSet;

use ordm_runtime::EngineError;
use ordm_testkit::Harness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_wallets_split_supply_without_overlap() {
    let h = Harness::new(8).await;

    let mut tasks = Vec::new();
    for i in 0..24 {
        let engine = h.engine.clone();
        let req = h.claim_request(None, &format!("wallet-{i}"), 1);
        tasks.push(tokio::spawn(async move { engine.claim(&req).await }));
    }

    let mut won = 0;
    let mut sold_out = 0;
    for t in tasks {
        match t.await.expect("task panicked") {
            Ok(rs) => {
                assert_eq!(rs.len(), 1);
                won += 1;
            }
            Err(EngineError::InsufficientSupply { .. }) => sold_out += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 8);
    assert_eq!(sold_out, 16);

    let live = h.ledger.live_reservations(h.now()).await;
    let assets: BTreeSet<_> = live.iter().map(|r| r.asset_id).collect();
    assert_eq!(live.len(), 8);
    assert_eq!(assets.len(), 8, "an asset was leased twice");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_wallet_racing_itself_stops_at_its_quota() {
    let h = Harness::new(20).await;
    let phase = h.public_phase(Some(2)).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = h.engine.clone();
        let req = h.claim_request(Some(&phase), "bc1q-greedy", 1);
        tasks.push(tokio::spawn(async move { engine.claim(&req).await }));
    }

    let mut won = 0;
    for t in tasks {
        match t.await.expect("task panicked") {
            Ok(_) => won += 1,
            Err(EngineError::QuotaExceeded { remaining, .. }) => assert_eq!(remaining, 0),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 2);
    assert_eq!(h.ledger.live_reservations(h.now()).await.len(), 2);
}

#[tokio::test]
async fn a_live_lease_hides_its_asset_from_exact_pick() {
    let h = Harness::new(2).await;
    let first = h
        .engine
        .claim(&h.claim_request(None, "alice", 1))
        .await
        .unwrap()
        .remove(0);

    let mut req = h.claim_request(None, "bob", 1);
    req.specific_asset_ids = Some(vec![first.asset_id]);
    let err = h.engine.claim(&req).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientSupply {
            requested: 1,
            available: 0
        }
    ));
}
