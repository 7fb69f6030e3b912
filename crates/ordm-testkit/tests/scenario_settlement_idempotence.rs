//! Scenario: terminal settlement facts are recorded exactly once.
//!
//! Replaying a reveal confirmation leaves one completed record, one claimed
//! asset and counters incremented once. Events the record cannot accept are
//! ignored without touching it.

use ordm_db::LedgerStore;
use ordm_runtime::{EngineError, EventOutcome};
use ordm_schemas::{MintStatus, ReservationStatus, TxKind};
use ordm_settlement::MintEvent;
use ordm_testkit::{commit_tx, reveal_tx, Harness};

#[tokio::test]
async fn replayed_reveal_confirmation_completes_once() {
    let h = Harness::new(2).await;
    let phase = h.allow_list_phase(Some(3), &["bc1q-w"], 3).await;
    let m = h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;
    let inscription = format!("{}i0", reveal_tx(m.mint_id));

    let first = h
        .engine
        .record_reveal_confirmed(m.mint_id, &inscription)
        .await
        .unwrap();
    assert_eq!(
        first,
        EventOutcome::Applied {
            from: MintStatus::RevealBroadcast,
            to: MintStatus::Completed
        }
    );
    let second = h
        .engine
        .record_reveal_confirmed(m.mint_id, &inscription)
        .await
        .unwrap();
    assert_eq!(
        second,
        EventOutcome::Duplicate {
            status: MintStatus::Completed
        }
    );

    let done = h.engine.get_mint(m.mint_id).await.unwrap();
    assert_eq!(done.status, MintStatus::Completed);
    assert_eq!(done.inscription_id.as_deref(), Some(inscription.as_str()));

    let asset = h.ledger.fetch_asset(m.asset_id).await.unwrap().unwrap();
    assert!(asset.is_claimed);

    let r = h
        .ledger
        .fetch_reservation(m.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Completed);
    assert_eq!(r.settlement_ref.as_deref(), Some(inscription.as_str()));

    let p = h.ledger.fetch_phase(phase.phase_id).await.unwrap().unwrap();
    assert_eq!(p.minted_count, 1);
    let entry = h
        .ledger
        .allow_list_entry(phase.allow_list_id.unwrap(), "bc1q-w")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.minted_count, 1);
}

#[tokio::test]
async fn claimed_asset_never_returns_to_the_pool() {
    let h = Harness::new(1).await;
    let phase = h.public_phase(None).await;
    let m = h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;
    h.engine
        .record_reveal_confirmed(m.mint_id, "insc-1")
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::hours(1));
    let err = h
        .engine
        .claim(&h.claim_request(None, "bc1q-late", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientSupply { available: 0, .. }));
}

#[tokio::test]
async fn repeated_broadcasts_and_confirmations_are_duplicates() {
    let h = Harness::new(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;
    let id = m.mint_id;

    h.engine
        .record_commit_broadcast(id, &commit_tx(id), 0, 546)
        .await
        .unwrap();
    let again = h
        .engine
        .record_commit_broadcast(id, &commit_tx(id), 0, 546)
        .await
        .unwrap();
    assert!(matches!(again, EventOutcome::Duplicate { .. }));

    let out = h
        .engine
        .record_confirmations(id, TxKind::Commit, 1)
        .await
        .unwrap();
    assert_eq!(
        out,
        EventOutcome::Applied {
            from: MintStatus::CommitBroadcast,
            to: MintStatus::CommitConfirming
        }
    );
    h.engine.record_commit_confirmed(id).await.unwrap();
    let late = h
        .engine
        .record_confirmations(id, TxKind::Commit, 3)
        .await
        .unwrap();
    assert_eq!(
        late,
        EventOutcome::Duplicate {
            status: MintStatus::CommitConfirmed
        }
    );
}

#[tokio::test]
async fn out_of_order_event_is_ignored_without_change() {
    let h = Harness::new(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;

    // Reveal before any commit.
    let out = h
        .engine
        .record_reveal_broadcast(m.mint_id, "reveal-early")
        .await
        .unwrap();
    assert!(matches!(
        out,
        EventOutcome::Ignored {
            status: MintStatus::Pending,
            ..
        }
    ));
    assert_eq!(h.engine.get_mint(m.mint_id).await.unwrap(), m);
}

#[tokio::test]
async fn operator_events_cannot_be_recorded_directly() {
    let h = Harness::new(1).await;
    let phase = h.public_phase(None).await;
    let m = h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;

    let err = h
        .engine
        .record_event(m.mint_id, MintEvent::MarkResolved)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let err = h
        .engine
        .record_event(uuid::Uuid::new_v4(), MintEvent::CommitConfirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "mint", .. }));
}

#[tokio::test]
async fn begin_settlement_is_idempotent_per_reservation() {
    let h = Harness::new(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);
    let first = h.open_mint(&r).await;
    let second = h.open_mint(&r).await;
    assert_eq!(first.mint_id, second.mint_id);

    let mut stranger = ordm_schemas::NewMint {
        reservation_id: r.reservation_id,
        wallet: "bc1q-thief".to_string(),
        receiving_wallet: "bc1q-thief".to_string(),
        fee_rate: 2.0,
        is_test: false,
        is_admin: false,
    };
    let err = h.engine.begin_settlement(&stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::NotOwned { .. }));

    stranger.wallet = "bc1q-w".to_string();
    stranger.fee_rate = 0.0;
    let err = h.engine.begin_settlement(&stranger).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));
}

#[tokio::test]
async fn complete_claim_is_a_safe_retry() {
    let h = Harness::new(1).await;
    let r = h
        .engine
        .claim(&h.claim_request(None, "bc1q-w", 1))
        .await
        .unwrap()
        .remove(0);

    assert!(!h
        .engine
        .complete_claim(r.reservation_id, "bc1q-other", Some("x"))
        .await
        .unwrap());
    assert!(h
        .engine
        .complete_claim(r.reservation_id, "bc1q-w", Some("psbt-1"))
        .await
        .unwrap());
    assert!(!h
        .engine
        .complete_claim(r.reservation_id, "bc1q-w", Some("psbt-1"))
        .await
        .unwrap());

    let listed = h
        .engine
        .list_reservations("bc1q-w", h.collection_id)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, ReservationStatus::Completed);
    assert_eq!(listed[0].settlement_ref.as_deref(), Some("psbt-1"));
}
