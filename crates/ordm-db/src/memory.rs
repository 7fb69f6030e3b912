use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ordm_schemas::{
    AllowListEntry, Asset, MintRecord, NewMint, Phase, Reservation,
    ReservationSelector, ReservationStatus, StuckFlag, StuckStatus, StuckTransactionRecord,
};
use ordm_settlement::{apply, MintEvent, SettlementEffects, TransitionError};
use ordm_stuck::{is_sweep_candidate, sweep_order_key};
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    CancelOutcome, FlagOutcome, LeaseRequest, LedgerError, LedgerStore, MintUpdate, OpenedMint,
    PhaseCounts,
};

/// In-process ledger. A single mutex owns every table, so each trait method
/// is one indivisible unit.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    tables: Mutex<Tables>,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    assets: BTreeMap<Uuid, Asset>,
    reservations: BTreeMap<Uuid, Reservation>,
    phases: BTreeMap<Uuid, Phase>,
    allow_list: BTreeMap<(Uuid, String), AllowListEntry>,
    mints: BTreeMap<Uuid, MintRecord>,
    stuck: BTreeMap<Uuid, StuckTransactionRecord>,
}

impl Tables {
    /// Unclaimed, no live reservation, no mint record holding it.
    fn is_selectable(&self, asset: &Asset, now: DateTime<Utc>) -> bool {
        !asset.is_claimed
            && !self
                .reservations
                .values()
                .any(|r| r.asset_id == asset.asset_id && r.is_live(now))
            && !self
                .mints
                .values()
                .any(|m| m.asset_id == asset.asset_id && m.holds_asset())
    }

    fn wallet_attempts(&self, wallet: &str, phase_id: Uuid, now: DateTime<Utc>) -> i64 {
        let minted = self
            .mints
            .values()
            .filter(|m| {
                m.phase_id == Some(phase_id) && m.minter_wallet == wallet && m.counts_toward_quota()
            })
            .count();

        let has_mint: BTreeSet<Uuid> = self.mints.values().map(|m| m.reservation_id).collect();
        let reserved = self
            .reservations
            .values()
            .filter(|r| {
                r.phase_id == Some(phase_id)
                    && r.wallet == wallet
                    && (r.is_live(now) || r.status == ReservationStatus::Completed)
                    && !has_mint.contains(&r.reservation_id)
            })
            .count();

        (minted + reserved) as i64
    }

    fn expire_stale(&mut self, now: DateTime<Utc>) -> u64 {
        let mut n = 0;
        for r in self.reservations.values_mut() {
            if r.status == ReservationStatus::Reserved && r.expires_at <= now {
                r.status = ReservationStatus::Expired;
                n += 1;
            }
        }
        n
    }

    fn commit_effects(&mut self, rec: &MintRecord, effects: SettlementEffects, now: DateTime<Utc>) {
        if effects.claim_asset {
            if let Some(a) = self.assets.get_mut(&rec.asset_id) {
                a.is_claimed = true;
            }
        }
        if effects.complete_reservation {
            if let Some(r) = self.reservations.get_mut(&rec.reservation_id) {
                if r.status != ReservationStatus::Completed {
                    r.status = ReservationStatus::Completed;
                    r.settlement_ref = rec.inscription_id.clone();
                }
            }
        }
        if effects.count_toward_phase {
            if let Some(phase_id) = rec.phase_id {
                if let Some(p) = self.phases.get_mut(&phase_id) {
                    p.minted_count += 1;
                    if let Some(list) = p.allow_list_id {
                        if let Some(e) = self.allow_list.get_mut(&(list, rec.minter_wallet.clone())) {
                            e.minted_count += 1;
                        }
                    }
                }
            }
        }
        if effects.release_asset {
            if let Some(r) = self.reservations.get_mut(&rec.reservation_id) {
                if r.status == ReservationStatus::Reserved {
                    r.status = ReservationStatus::Expired;
                }
            }
        }
        for s in self.stuck.values_mut() {
            if s.mint_id != rec.mint_id || s.status.is_terminal() {
                continue;
            }
            if effects.settled_leg == Some(s.tx_kind) {
                s.status = StuckStatus::Resolved;
                s.resolved_at = Some(now);
            } else if effects.closes_stuck {
                s.status = StuckStatus::Abandoned;
                s.resolved_at = Some(now);
            }
        }
    }
}

/// `ThreadRng` is not `Send`; keep it out of async frames.
fn pick_random(candidates: &[Uuid], n: usize) -> Vec<Uuid> {
    let mut rng = rand::thread_rng();
    candidates.choose_multiple(&mut rng, n).copied().collect()
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Seeding and inspection (tests, paper deployments)
    // -----------------------------------------------------------------------

    pub async fn seed_assets(&self, collection_id: Uuid, n: usize) -> Vec<Uuid> {
        let mut t = self.tables.lock().await;
        (0..n)
            .map(|_| {
                let asset_id = Uuid::new_v4();
                t.assets.insert(
                    asset_id,
                    Asset {
                        asset_id,
                        collection_id,
                        is_claimed: false,
                    },
                );
                asset_id
            })
            .collect()
    }

    pub async fn insert_phase(&self, phase: Phase) {
        self.tables.lock().await.phases.insert(phase.phase_id, phase);
    }

    pub async fn insert_allow_list_entry(&self, entry: AllowListEntry) {
        self.tables
            .lock()
            .await
            .allow_list
            .insert((entry.allow_list_id, entry.wallet.clone()), entry);
    }

    /// Reservations that are `reserved` and unexpired at `now`.
    pub async fn live_reservations(&self, now: DateTime<Utc>) -> Vec<Reservation> {
        self.tables
            .lock()
            .await
            .reservations
            .values()
            .filter(|r| r.is_live(now))
            .cloned()
            .collect()
    }

    pub async fn reservation_count(&self) -> usize {
        self.tables.lock().await.reservations.len()
    }

    pub async fn stuck_for_mint(&self, mint_id: Uuid) -> Vec<StuckTransactionRecord> {
        self.tables
            .lock()
            .await
            .stuck
            .values()
            .filter(|s| s.mint_id == mint_id)
            .cloned()
            .collect()
    }

    /// Overwrite a mint record. Test hook for drifting counters or ageing a
    /// broadcast; bypasses the state machine.
    pub async fn put_mint(&self, rec: MintRecord) {
        self.tables.lock().await.mints.insert(rec.mint_id, rec);
    }

    pub async fn put_phase_counter(&self, phase_id: Uuid, minted_count: i64) {
        if let Some(p) = self.tables.lock().await.phases.get_mut(&phase_id) {
            p.minted_count = minted_count;
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedger {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        Ok(self.tables.lock().await.expire_stale(now))
    }

    async fn lease_assets(&self, req: &LeaseRequest) -> Result<Vec<Reservation>, LedgerError> {
        let mut t = self.tables.lock().await;
        let now = req.now;

        if let (Some(max_allowed), Some(phase_id)) = (req.quota, req.phase_id) {
            let minted = t.wallet_attempts(&req.wallet, phase_id, now);
            let remaining = (max_allowed - minted).max(0);
            if req.quantity > remaining {
                return Err(LedgerError::QuotaExceeded {
                    remaining,
                    requested: req.quantity,
                    minted,
                    max_allowed,
                });
            }
        }

        let wanted = usize::try_from(req.quantity).unwrap_or(0);
        let chosen: Vec<Uuid> = match &req.specific_asset_ids {
            Some(ids) => ids
                .iter()
                .copied()
                .collect::<BTreeSet<Uuid>>()
                .into_iter()
                .filter(|id| {
                    t.assets
                        .get(id)
                        .map(|a| a.collection_id == req.collection_id && t.is_selectable(a, now))
                        .unwrap_or(false)
                })
                .collect(),
            None => {
                let pool: Vec<Uuid> = t
                    .assets
                    .values()
                    .filter(|a| a.collection_id == req.collection_id && t.is_selectable(a, now))
                    .map(|a| a.asset_id)
                    .collect();
                pick_random(&pool, wanted)
            }
        };

        // Nothing has been written yet, so failing here leaves no partial lease.
        if chosen.len() < wanted || wanted == 0 {
            return Err(LedgerError::InsufficientSupply {
                requested: req.quantity,
                available: chosen.len() as i64,
            });
        }

        let mut out = Vec::with_capacity(chosen.len());
        for asset_id in chosen {
            for r in t.reservations.values_mut() {
                if r.asset_id == asset_id && r.status == ReservationStatus::Reserved {
                    r.status = ReservationStatus::Expired;
                }
            }
            let res = Reservation {
                reservation_id: Uuid::new_v4(),
                asset_id,
                collection_id: req.collection_id,
                phase_id: req.phase_id,
                wallet: req.wallet.clone(),
                status: ReservationStatus::Reserved,
                expires_at: now + req.lease,
                settlement_ref: None,
                created_at: now,
            };
            t.reservations.insert(res.reservation_id, res.clone());
            out.push(res);
        }
        Ok(out)
    }

    async fn cancel_reservations(
        &self,
        selector: &ReservationSelector,
        wallet: &str,
    ) -> Result<CancelOutcome, LedgerError> {
        let mut t = self.tables.lock().await;

        if let ReservationSelector::Reservation { reservation_id } = selector {
            let r = t
                .reservations
                .get(reservation_id)
                .ok_or_else(|| LedgerError::not_found("reservation", reservation_id))?;
            if r.wallet != wallet {
                return Err(LedgerError::NotOwned {
                    reservation_id: *reservation_id,
                });
            }
        }

        let mut cancelled = Vec::new();
        for r in t.reservations.values_mut() {
            let matches = match selector {
                ReservationSelector::Reservation { reservation_id } => {
                    r.reservation_id == *reservation_id
                }
                ReservationSelector::Asset { asset_id } => r.asset_id == *asset_id,
                ReservationSelector::AllForWallet { collection_id } => {
                    r.collection_id == *collection_id
                }
            };
            if matches && r.wallet == wallet && r.status == ReservationStatus::Reserved {
                r.status = ReservationStatus::Cancelled;
                cancelled.push(r.reservation_id);
            }
        }
        Ok(CancelOutcome { cancelled })
    }

    async fn complete_reservation(
        &self,
        reservation_id: Uuid,
        wallet: &str,
        settlement_ref: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let mut t = self.tables.lock().await;
        match t.reservations.get_mut(&reservation_id) {
            Some(r) if r.wallet == wallet && r.status == ReservationStatus::Reserved => {
                r.status = ReservationStatus::Completed;
                r.settlement_ref = settlement_ref.map(str::to_string);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, LedgerError> {
        Ok(self.tables.lock().await.reservations.get(&reservation_id).cloned())
    }

    async fn list_reservations(
        &self,
        wallet: &str,
        collection_id: Uuid,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let t = self.tables.lock().await;
        let mut out: Vec<Reservation> = t
            .reservations
            .values()
            .filter(|r| r.wallet == wallet && r.collection_id == collection_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn fetch_asset(&self, asset_id: Uuid) -> Result<Option<Asset>, LedgerError> {
        Ok(self.tables.lock().await.assets.get(&asset_id).cloned())
    }

    async fn fetch_phase(&self, phase_id: Uuid) -> Result<Option<Phase>, LedgerError> {
        Ok(self.tables.lock().await.phases.get(&phase_id).cloned())
    }

    async fn allow_list_entry(
        &self,
        allow_list_id: Uuid,
        wallet: &str,
    ) -> Result<Option<AllowListEntry>, LedgerError> {
        Ok(self
            .tables
            .lock()
            .await
            .allow_list
            .get(&(allow_list_id, wallet.to_string()))
            .cloned())
    }

    async fn count_wallet_attempts(
        &self,
        wallet: &str,
        phase_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        Ok(self.tables.lock().await.wallet_attempts(wallet, phase_id, now))
    }

    async fn open_mint(&self, new: &NewMint, now: DateTime<Utc>) -> Result<OpenedMint, LedgerError> {
        let mut t = self.tables.lock().await;
        let reservation = t
            .reservations
            .get(&new.reservation_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("reservation", new.reservation_id))?;
        if reservation.wallet != new.wallet {
            return Err(LedgerError::NotOwned {
                reservation_id: reservation.reservation_id,
            });
        }

        if let Some(existing) = t
            .mints
            .values()
            .find(|m| m.reservation_id == reservation.reservation_id && !m.status.is_released())
        {
            return Ok(OpenedMint {
                record: existing.clone(),
                created: false,
            });
        }

        if !reservation.is_live(now) {
            return Err(LedgerError::ReservationNotLive {
                reservation_id: reservation.reservation_id,
            });
        }

        let record = MintRecord::pending(new, &reservation, now);
        t.mints.insert(record.mint_id, record.clone());
        Ok(OpenedMint {
            record,
            created: true,
        })
    }

    async fn fetch_mint(&self, mint_id: Uuid) -> Result<Option<MintRecord>, LedgerError> {
        Ok(self.tables.lock().await.mints.get(&mint_id).cloned())
    }

    async fn apply_mint_event(
        &self,
        mint_id: Uuid,
        event: &MintEvent,
        now: DateTime<Utc>,
    ) -> Result<MintUpdate, LedgerError> {
        let mut t = self.tables.lock().await;
        let mut rec = t
            .mints
            .get(&mint_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("mint", mint_id))?;

        let transition = apply(&mut rec, event, now)?;
        if transition.is_applied() {
            t.mints.insert(mint_id, rec.clone());
            t.commit_effects(&rec, transition.effects(), now);
        }
        Ok(MintUpdate {
            record: rec,
            transition,
        })
    }

    async fn list_sweep_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MintRecord>, LedgerError> {
        let t = self.tables.lock().await;
        let mut out: Vec<MintRecord> = t
            .mints
            .values()
            .filter(|m| is_sweep_candidate(m, cutoff))
            .cloned()
            .collect();
        out.sort_by_key(sweep_order_key);
        out.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(out)
    }

    async fn flag_stuck(
        &self,
        mint_id: Uuid,
        flag: &StuckFlag,
        now: DateTime<Utc>,
    ) -> Result<FlagOutcome, LedgerError> {
        let mut t = self.tables.lock().await;
        let mut rec = t
            .mints
            .get(&mint_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("mint", mint_id))?;

        // The leg moved on (replacement broadcast) since the sweep read it.
        if rec.tx_id(flag.tx_kind) != Some(flag.tx_id.as_str()) {
            return Err(TransitionError {
                from: rec.status,
                event: "flag_stuck".to_string(),
            }
            .into());
        }

        let transition = apply(
            &mut rec,
            &MintEvent::FlagStuck {
                tx_kind: flag.tx_kind,
            },
            now,
        )?;
        if transition.is_applied() {
            t.mints.insert(mint_id, rec.clone());
        }

        if let Some(open) = t
            .stuck
            .values()
            .find(|s| s.mint_id == mint_id && s.tx_id == flag.tx_id && !s.status.is_terminal())
        {
            return Ok(FlagOutcome {
                record: rec,
                stuck: open.clone(),
                created: false,
            });
        }

        let stuck = StuckTransactionRecord::detected(mint_id, flag, now);
        t.stuck.insert(stuck.stuck_id, stuck.clone());
        Ok(FlagOutcome {
            record: rec,
            stuck,
            created: true,
        })
    }

    async fn fetch_stuck(
        &self,
        stuck_id: Uuid,
    ) -> Result<Option<StuckTransactionRecord>, LedgerError> {
        Ok(self.tables.lock().await.stuck.get(&stuck_id).cloned())
    }

    async fn list_open_stuck(
        &self,
        limit: i64,
    ) -> Result<Vec<StuckTransactionRecord>, LedgerError> {
        let t = self.tables.lock().await;
        let mut out: Vec<StuckTransactionRecord> = t
            .stuck
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.detected_at);
        out.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(out)
    }

    async fn record_fee_bump(
        &self,
        stuck_id: Uuid,
        status: StuckStatus,
        target_fee_rate: f64,
    ) -> Result<StuckTransactionRecord, LedgerError> {
        let mut t = self.tables.lock().await;
        let s = t
            .stuck
            .get_mut(&stuck_id)
            .ok_or_else(|| LedgerError::not_found("stuck transaction", stuck_id))?;
        if s.status.is_terminal() {
            return Err(LedgerError::StuckClosed {
                stuck_id,
                status: s.status,
            });
        }
        s.status = status;
        s.target_fee_rate = Some(target_fee_rate);
        Ok(s.clone())
    }

    async fn recount_phase(&self, phase_id: Uuid) -> Result<PhaseCounts, LedgerError> {
        let mut t = self.tables.lock().await;
        let phase = t
            .phases
            .get(&phase_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("phase", phase_id))?;

        let minted_count = t
            .mints
            .values()
            .filter(|m| m.phase_id == Some(phase_id) && m.phase_counted)
            .count() as i64;
        if let Some(p) = t.phases.get_mut(&phase_id) {
            p.minted_count = minted_count;
        }

        let mut entries_updated = 0;
        if let Some(list) = phase.allow_list_id {
            // An allow-list may back several phases; its counter spans all of them.
            let list_phases: BTreeSet<Uuid> = t
                .phases
                .values()
                .filter(|p| p.allow_list_id == Some(list))
                .map(|p| p.phase_id)
                .collect();
            let mut per_wallet: BTreeMap<String, i64> = BTreeMap::new();
            for m in t.mints.values() {
                if m.phase_counted && m.phase_id.map(|p| list_phases.contains(&p)).unwrap_or(false)
                {
                    *per_wallet.entry(m.minter_wallet.clone()).or_default() += 1;
                }
            }
            for ((l, wallet), e) in t.allow_list.iter_mut() {
                if *l == list {
                    e.minted_count = per_wallet.get(wallet).copied().unwrap_or(0);
                    entries_updated += 1;
                }
            }
        }

        Ok(PhaseCounts {
            phase_id,
            minted_count,
            entries_updated,
        })
    }
}
