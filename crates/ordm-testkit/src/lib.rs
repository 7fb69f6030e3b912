//! ordm-testkit
//!
//! Fixtures for engine scenarios: a manual clock, a seeded in-memory ledger,
//! a paper oracle, and helpers that walk a mint through settlement.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use ordm_db::{LedgerStore, MemoryLedger};
use ordm_oracle::PaperOracle;
use ordm_runtime::{ClaimRequest, Clock, Limits, MintEngine};
use ordm_schemas::{AllowListEntry, MintRecord, NewMint, Phase, Reservation};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut g = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *g += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Engine over a [`MemoryLedger`] and a [`PaperOracle`], with handles kept so
/// scenarios can seed and inspect both.
pub struct Harness {
    pub engine: MintEngine,
    pub ledger: Arc<MemoryLedger>,
    pub oracle: Arc<PaperOracle>,
    pub clock: Arc<ManualClock>,
    pub collection_id: Uuid,
}

impl Harness {
    /// One collection of `supply` unclaimed assets, default limits.
    pub async fn new(supply: usize) -> Self {
        Self::with_limits(supply, Limits::default()).await
    }

    pub async fn with_limits(supply: usize, limits: Limits) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let oracle = Arc::new(PaperOracle::new(12.0));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let collection_id = Uuid::new_v4();
        ledger.seed_assets(collection_id, supply).await;

        let store: Arc<dyn LedgerStore> = ledger.clone();
        let engine = MintEngine::new(store, oracle.clone(), limits).with_clock(clock.clone());

        Self {
            engine,
            ledger,
            oracle,
            clock,
            collection_id,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open public phase (no allow-list), started an hour ago.
    pub async fn public_phase(&self, max_per_wallet: Option<i64>) -> Phase {
        let phase = self.phase(max_per_wallet, None);
        self.ledger.insert_phase(phase.clone()).await;
        phase
    }

    /// Open allow-list phase with the listed wallets, each given `allocation`.
    pub async fn allow_list_phase(
        &self,
        max_per_wallet: Option<i64>,
        wallets: &[&str],
        allocation: i64,
    ) -> Phase {
        let list = Uuid::new_v4();
        let phase = self.phase(max_per_wallet, Some(list));
        self.ledger.insert_phase(phase.clone()).await;
        for w in wallets {
            self.ledger
                .insert_allow_list_entry(AllowListEntry {
                    allow_list_id: list,
                    wallet: (*w).to_string(),
                    allocation,
                    minted_count: 0,
                })
                .await;
        }
        phase
    }

    fn phase(&self, max_per_wallet: Option<i64>, allow_list_id: Option<Uuid>) -> Phase {
        Phase {
            phase_id: Uuid::new_v4(),
            collection_id: self.collection_id,
            name: if allow_list_id.is_some() {
                "allow-list".to_string()
            } else {
                "public".to_string()
            },
            starts_at: self.now() - Duration::hours(1),
            ends_at: None,
            price_sats: 10_000,
            max_per_wallet,
            total_allocation: None,
            allow_list_id,
            is_completed: false,
            minted_count: 0,
        }
    }

    pub fn claim_request(&self, phase: Option<&Phase>, wallet: &str, quantity: i64) -> ClaimRequest {
        ClaimRequest {
            collection_id: self.collection_id,
            phase_id: phase.map(|p| p.phase_id),
            wallet: wallet.to_string(),
            quantity,
            specific_asset_ids: None,
            lease_seconds: None,
        }
    }

    /// Open the mint record for a reservation the wallet holds.
    pub async fn open_mint(&self, reservation: &Reservation) -> MintRecord {
        self.engine
            .begin_settlement(&NewMint {
                reservation_id: reservation.reservation_id,
                wallet: reservation.wallet.clone(),
                receiving_wallet: format!("{}-receive", reservation.wallet),
                fee_rate: 2.0,
                is_test: false,
                is_admin: false,
            })
            .await
            .unwrap_or_else(|e| panic!("begin_settlement: {e}"))
            .record
    }

    /// Claim one asset in `phase` and walk it to `reveal_broadcast`.
    pub async fn mint_to_reveal_broadcast(&self, phase: &Phase, wallet: &str) -> MintRecord {
        let r = self
            .engine
            .claim(&self.claim_request(Some(phase), wallet, 1))
            .await
            .unwrap_or_else(|e| panic!("claim: {e}"))
            .remove(0);
        let m = self.open_mint(&r).await;
        let id = m.mint_id;
        let steps = [
            self.engine
                .record_commit_broadcast(id, &commit_tx(id), 0, 546)
                .await,
            self.engine.record_commit_confirmed(id).await,
            self.engine.record_reveal_broadcast(id, &reveal_tx(id)).await,
        ];
        for s in steps {
            if let Err(e) = s {
                panic!("settlement step: {e}");
            }
        }
        self.engine
            .get_mint(id)
            .await
            .unwrap_or_else(|e| panic!("get_mint: {e}"))
    }
}

/// Deterministic commit txid for a mint in fixtures.
pub fn commit_tx(mint_id: Uuid) -> String {
    format!("commit-{}", mint_id.simple())
}

/// Deterministic reveal txid for a mint in fixtures.
pub fn reveal_tx(mint_id: Uuid) -> String {
    format!("reveal-{}", mint_id.simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = Utc::now();
        let c = ManualClock::new(start);
        assert_eq!(c.now(), start);
        c.advance(Duration::minutes(3));
        assert_eq!(c.now(), start + Duration::minutes(3));
        c.set(start);
        assert_eq!(c.now(), start);
    }
}
