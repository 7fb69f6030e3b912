//! Scenario: the sweep flags only what is really stuck and heals what has
//! quietly settled.
//!
//! A leg unconfirmed past the threshold is flagged once; a confirmation seen
//! at any point heals the record and resolves its stuck record; an oracle
//! outage never produces a flag, and one failing candidate does not stop the
//! rest of the sweep.

use std::sync::Arc;

use chrono::Duration;
use ordm_db::LedgerStore;
use ordm_oracle::{ConfirmationOracle, OracleError, PaperOracle, TxStatus};
use ordm_runtime::{EngineError, Limits, MintEngine};
use ordm_schemas::{MintRecord, MintStatus, StuckStatus, TxKind};
use ordm_settlement::ABANDONED_CODE;
use ordm_stuck::ResolutionAction;
use ordm_testkit::{commit_tx, reveal_tx, Harness};

async fn commit_in_flight(h: &Harness, wallet: &str) -> MintRecord {
    let r = h
        .engine
        .claim(&h.claim_request(None, wallet, 1))
        .await
        .unwrap()
        .remove(0);
    let m = h.open_mint(&r).await;
    h.engine
        .record_commit_broadcast(m.mint_id, &commit_tx(m.mint_id), 0, 546)
        .await
        .unwrap();
    m
}

/// Commit broadcast 31 minutes ago, paying 1 sat/vB, flagged by one sweep.
async fn flagged_commit(h: &Harness) -> MintRecord {
    let m = commit_in_flight(h, "bc1q-w").await;
    h.oracle
        .set_unconfirmed(&commit_tx(m.mint_id), Some(1.0))
        .await;
    h.clock.advance(Duration::minutes(31));
    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.flagged, 1);
    m
}

#[tokio::test]
async fn stale_commit_is_flagged_once() {
    let h = Harness::new(1).await;
    let m = flagged_commit(&h).await;

    let rec = h.engine.get_mint(m.mint_id).await.unwrap();
    assert_eq!(rec.status, MintStatus::Stuck);
    assert_eq!(rec.stuck_tx_kind, Some(TxKind::Commit));

    let stuck = h.ledger.stuck_for_mint(m.mint_id).await;
    assert_eq!(stuck.len(), 1);
    let s = &stuck[0];
    assert_eq!(s.status, StuckStatus::Detected);
    assert_eq!(s.tx_kind, TxKind::Commit);
    assert_eq!(s.tx_id, commit_tx(m.mint_id));
    assert_eq!(s.elapsed_minutes, 31);
    assert_eq!(s.fee_rate, Some(1.0));
    assert_eq!(s.recommended_fee_rate, Some(12.0));

    h.clock.advance(Duration::minutes(10));
    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.flagged, 0);
    assert_eq!(report.already_flagged, 1);
    assert_eq!(h.ledger.stuck_for_mint(m.mint_id).await.len(), 1);
    assert_eq!(h.engine.list_open_stuck().await.unwrap().len(), 1);
}

#[tokio::test]
async fn fresh_broadcast_is_left_alone() {
    let h = Harness::new(1).await;
    commit_in_flight(&h, "bc1q-w").await;
    h.clock.advance(Duration::minutes(29));

    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(report.flagged, 0);
}

#[tokio::test]
async fn late_confirmation_heals_a_flagged_mint() {
    let h = Harness::new(1).await;
    let m = flagged_commit(&h).await;

    h.oracle.set_confirmed(&commit_tx(m.mint_id), 850_000).await;
    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.healed, 1);
    assert_eq!(report.flagged, 0);

    let rec = h.engine.get_mint(m.mint_id).await.unwrap();
    assert_eq!(rec.status, MintStatus::CommitConfirmed);
    assert_eq!(rec.stuck_since, None);

    let stuck = h.ledger.stuck_for_mint(m.mint_id).await;
    assert_eq!(stuck[0].status, StuckStatus::Resolved);
    assert!(stuck[0].resolved_at.is_some());
    assert!(h.engine.list_open_stuck().await.unwrap().is_empty());
}

#[tokio::test]
async fn missed_confirmation_heals_before_any_flag() {
    let h = Harness::new(1).await;
    let phase = h.public_phase(None).await;
    let m = h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;
    h.oracle.set_confirmed(&reveal_tx(m.mint_id), 850_001).await;
    h.clock.advance(Duration::minutes(45));

    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.healed, 1);

    let rec = h.engine.get_mint(m.mint_id).await.unwrap();
    assert_eq!(rec.status, MintStatus::Completed);
    assert_eq!(
        rec.inscription_id,
        Some(format!("{}i0", reveal_tx(m.mint_id)))
    );
    assert!(h.ledger.stuck_for_mint(m.mint_id).await.is_empty());
    assert!(h.ledger.fetch_asset(m.asset_id).await.unwrap().unwrap().is_claimed);
}

#[tokio::test]
async fn oracle_outage_never_flags() {
    let h = Harness::new(1).await;
    let m = commit_in_flight(&h, "bc1q-w").await;
    h.clock.advance(Duration::minutes(90));
    h.oracle.set_unavailable(true).await;

    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.oracle_errors, 1);
    assert_eq!(report.flagged, 0);
    assert_eq!(
        h.engine.get_mint(m.mint_id).await.unwrap().status,
        MintStatus::CommitBroadcast
    );
    assert!(h.ledger.stuck_for_mint(m.mint_id).await.is_empty());

    // Back online: an unknown tx is as good as unconfirmed.
    h.oracle.set_unavailable(false).await;
    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.flagged, 1);
    let stuck = h.ledger.stuck_for_mint(m.mint_id).await;
    assert_eq!(stuck[0].fee_rate, None);
}

/// Fails every lookup of one transaction, answers the rest from paper.
struct OneBrokenTx {
    paper: PaperOracle,
    broken: String,
}

#[async_trait::async_trait]
impl ConfirmationOracle for OneBrokenTx {
    fn source_name(&self) -> &'static str {
        "one-broken-tx"
    }

    async fn transaction_status(&self, tx_id: &str) -> Result<TxStatus, OracleError> {
        if tx_id == self.broken {
            return Err(OracleError::Transport("connection reset".to_string()));
        }
        self.paper.transaction_status(tx_id).await
    }

    async fn recommended_fee_rate(&self) -> Result<f64, OracleError> {
        self.paper.recommended_fee_rate().await
    }
}

#[tokio::test]
async fn one_failing_lookup_does_not_stop_the_sweep() {
    let h = Harness::new(2).await;
    let a = commit_in_flight(&h, "bc1q-a").await;
    let b = commit_in_flight(&h, "bc1q-b").await;
    h.clock.advance(Duration::minutes(31));

    let oracle = OneBrokenTx {
        paper: PaperOracle::new(9.0),
        broken: commit_tx(a.mint_id),
    };
    let engine = MintEngine::new(h.ledger.clone(), Arc::new(oracle), Limits::default())
        .with_clock(h.clock.clone());

    let report = engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.oracle_errors, 1);
    assert_eq!(report.flagged, 1);

    assert_eq!(
        engine.get_mint(a.mint_id).await.unwrap().status,
        MintStatus::CommitBroadcast
    );
    let stuck_b = h.ledger.stuck_for_mint(b.mint_id).await;
    assert_eq!(stuck_b.len(), 1);
    assert_eq!(stuck_b[0].recommended_fee_rate, Some(9.0));
}

#[tokio::test]
async fn batch_limit_caps_one_sweep() {
    let mut limits = Limits::default();
    limits.batch_limit = 2;
    let h = Harness::with_limits(3, limits).await;
    for w in ["a", "b", "c"] {
        commit_in_flight(&h, w).await;
    }
    h.clock.advance(Duration::minutes(31));

    let first = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(first.examined, 2);
    assert_eq!(first.flagged, 2);

    let second = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(second.flagged, 1);
}

#[tokio::test]
async fn open_stuck_records_never_crowd_out_new_stale_broadcasts() {
    let mut limits = Limits::default();
    limits.batch_limit = 2;
    let h = Harness::with_limits(3, limits).await;
    for w in ["a", "b"] {
        commit_in_flight(&h, w).await;
    }
    h.clock.advance(Duration::minutes(31));
    assert_eq!(h.engine.run_stuck_sweep().await.unwrap().flagged, 2);

    // Both stuck records stay unconfirmed and are never rewritten, so they
    // hold the oldest `updated_at` of every candidate from here on.
    let late = commit_in_flight(&h, "c").await;
    h.clock.advance(Duration::minutes(31));

    let report = h.engine.run_stuck_sweep().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.flagged, 1);
    assert_eq!(report.already_flagged, 1);
    assert_eq!(
        h.engine.get_mint(late.mint_id).await.unwrap().status,
        MintStatus::Stuck
    );
    assert_eq!(h.ledger.stuck_for_mint(late.mint_id).await.len(), 1);
}

// ---------------------------------------------------------------------------
// Operator resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_resolved_completes_a_stuck_reveal() {
    let h = Harness::new(1).await;
    let phase = h.public_phase(None).await;
    let m = h.mint_to_reveal_broadcast(&phase, "bc1q-w").await;
    h.clock.advance(Duration::minutes(31));
    assert_eq!(h.engine.run_stuck_sweep().await.unwrap().flagged, 1);

    let stuck_id = h.ledger.stuck_for_mint(m.mint_id).await[0].stuck_id;
    let out = h
        .engine
        .resolve_stuck(stuck_id, &ResolutionAction::MarkResolved)
        .await
        .unwrap();
    assert_eq!(out.mint.status, MintStatus::Completed);
    assert_eq!(
        out.mint.inscription_id,
        Some(format!("{}i0", reveal_tx(m.mint_id)))
    );
    assert_eq!(out.stuck.status, StuckStatus::Resolved);
    assert!(h.ledger.fetch_asset(m.asset_id).await.unwrap().unwrap().is_claimed);

    let err = h
        .engine
        .resolve_stuck(stuck_id, &ResolutionAction::Abandon)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition(_)));
}

#[tokio::test]
async fn abandon_fails_the_mint_and_frees_the_asset() {
    let h = Harness::new(1).await;
    let m = flagged_commit(&h).await;
    let stuck_id = h.ledger.stuck_for_mint(m.mint_id).await[0].stuck_id;

    let out = h
        .engine
        .resolve_stuck(stuck_id, &ResolutionAction::Abandon)
        .await
        .unwrap();
    assert_eq!(out.mint.status, MintStatus::Failed);
    assert_eq!(out.mint.error_code.as_deref(), Some(ABANDONED_CODE));
    assert_eq!(out.stuck.status, StuckStatus::Abandoned);

    let again = h
        .engine
        .claim(&h.claim_request(None, "bc1q-next", 1))
        .await
        .unwrap();
    assert_eq!(again[0].asset_id, m.asset_id);
}

#[tokio::test]
async fn fee_bump_then_replacement_confirmation_resolves() {
    let h = Harness::new(1).await;
    let m = flagged_commit(&h).await;
    let stuck_id = h.ledger.stuck_for_mint(m.mint_id).await[0].stuck_id;

    let err = h
        .engine
        .resolve_stuck(stuck_id, &ResolutionAction::RequestRbf { target_fee_rate: 0.5 })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    let out = h
        .engine
        .resolve_stuck(stuck_id, &ResolutionAction::RequestRbf { target_fee_rate: 20.0 })
        .await
        .unwrap();
    assert_eq!(out.stuck.status, StuckStatus::RbfSent);
    assert_eq!(out.stuck.target_fee_rate, Some(20.0));
    assert_eq!(out.mint.status, MintStatus::Stuck);

    // A second bump must beat the first.
    let err = h
        .engine
        .resolve_stuck(stuck_id, &ResolutionAction::RequestCpfp { target_fee_rate: 15.0 })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRequest(_)));

    h.engine
        .record_commit_broadcast(m.mint_id, "commit-bumped", 0, 546)
        .await
        .unwrap();
    assert_eq!(
        h.engine.get_mint(m.mint_id).await.unwrap().status,
        MintStatus::CommitBroadcast
    );
    assert_eq!(h.engine.list_open_stuck().await.unwrap().len(), 1);

    h.engine.record_commit_confirmed(m.mint_id).await.unwrap();
    let s = h.engine.list_open_stuck().await.unwrap();
    assert!(s.is_empty());
    assert_eq!(
        h.ledger.fetch_stuck(stuck_id).await.unwrap().unwrap().status,
        StuckStatus::Resolved
    );
}

#[tokio::test]
async fn unknown_stuck_record_is_not_found() {
    let h = Harness::new(1).await;
    let err = h
        .engine
        .resolve_stuck(uuid::Uuid::new_v4(), &ResolutionAction::MarkResolved)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}
