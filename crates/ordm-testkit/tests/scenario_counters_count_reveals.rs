//! Scenario: phase and allow-list counters count reveal broadcasts.
//!
//! A mint is added to the counters exactly once, when its reveal is first
//! broadcast. Claims, commits, confirmations and fee-bump replacements do not
//! move the counters; test and admin mints never do. Recounting rebuilds the
//! counters from the mint records.

use chrono::Duration;
use ordm_db::LedgerStore;
use ordm_schemas::NewMint;
use ordm_testkit::{commit_tx, reveal_tx, Harness};

async fn phase_count(h: &Harness, phase_id: uuid::Uuid) -> i64 {
    h.ledger
        .fetch_phase(phase_id)
        .await
        .unwrap()
        .unwrap()
        .minted_count
}

#[tokio::test]
async fn counter_moves_at_reveal_broadcast_only() {
    let h = Harness::new(2).await;
    let phase = h.public_phase(Some(5)).await;

    let r = h
        .engine
        .claim(&h.claim_request(Some(&phase), "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;
    let id = m.mint_id;
    assert_eq!(phase_count(&h, phase.phase_id).await, 0);

    h.engine
        .record_commit_broadcast(id, &commit_tx(id), 0, 546)
        .await
        .unwrap();
    h.engine.record_commit_confirmed(id).await.unwrap();
    assert_eq!(phase_count(&h, phase.phase_id).await, 0);

    h.engine
        .record_reveal_broadcast(id, &reveal_tx(id))
        .await
        .unwrap();
    assert_eq!(phase_count(&h, phase.phase_id).await, 1);

    h.engine
        .record_reveal_confirmed(id, "insc-1")
        .await
        .unwrap();
    assert_eq!(phase_count(&h, phase.phase_id).await, 1);
}

#[tokio::test]
async fn replacement_reveal_does_not_count_twice() {
    let h = Harness::new(1).await;
    let phase = h.allow_list_phase(Some(2), &["bc1q-w"], 2).await;
    let m = h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;

    h.clock.advance(Duration::minutes(31));
    assert_eq!(h.engine.run_stuck_sweep().await.unwrap().flagged, 1);
    h.engine
        .record_reveal_broadcast(m.mint_id, "reveal-bumped")
        .await
        .unwrap();

    assert_eq!(phase_count(&h, phase.phase_id).await, 1);
    let entry = h
        .ledger
        .allow_list_entry(phase.allow_list_id.unwrap(), "bc1q-w")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.minted_count, 1);
}

#[tokio::test]
async fn admin_mints_never_count() {
    let h = Harness::new(1).await;
    let phase = h.public_phase(None).await;
    let r = h
        .engine
        .claim(&h.claim_request(Some(&phase), "bc1q-admin", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h
        .engine
        .begin_settlement(&NewMint {
            reservation_id: r.reservation_id,
            wallet: "bc1q-admin".to_string(),
            receiving_wallet: "bc1q-vault".to_string(),
            fee_rate: 4.0,
            is_test: false,
            is_admin: true,
        })
        .await
        .unwrap()
        .record;
    let id = m.mint_id;
    h.engine
        .record_commit_broadcast(id, &commit_tx(id), 0, 546)
        .await
        .unwrap();
    h.engine.record_commit_confirmed(id).await.unwrap();
    h.engine
        .record_reveal_broadcast(id, &reveal_tx(id))
        .await
        .unwrap();

    assert_eq!(phase_count(&h, phase.phase_id).await, 0);
    assert_eq!(
        h.engine.recount_phase(phase.phase_id).await.unwrap().minted_count,
        0
    );
}

#[tokio::test]
async fn recount_repairs_drifted_counters() {
    let h = Harness::new(3).await;
    let phase = h.allow_list_phase(Some(3), &["bc1q-a", "bc1q-b"], 3).await;
    h.mint_to_reveal_broadcast(&phase, "bc1q-a").await;
    h.mint_to_reveal_broadcast(&phase, "bc1q-a").await;

    h.ledger.put_phase_counter(phase.phase_id, 7).await;
    assert_eq!(phase_count(&h, phase.phase_id).await, 7);

    let counts = h.engine.recount_phase(phase.phase_id).await.unwrap();
    assert_eq!(counts.minted_count, 2);
    assert_eq!(counts.entries_updated, 2);
    assert_eq!(phase_count(&h, phase.phase_id).await, 2);

    let list = phase.allow_list_id.unwrap();
    let a = h.ledger.allow_list_entry(list, "bc1q-a").await.unwrap().unwrap();
    let b = h.ledger.allow_list_entry(list, "bc1q-b").await.unwrap().unwrap();
    assert_eq!((a.minted_count, b.minted_count), (2, 0));
}
