use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ordm_config::EngineConfig;
use ordm_db::{LeaseRequest, LedgerError, LedgerStore, OpenedMint, PhaseCounts};
use ordm_eligibility::{
    ensure_open, validate_allocation, validate_quantity, validate_request, wallet_remaining,
    Eligibility, Membership,
};
use ordm_oracle::ConfirmationOracle;
use ordm_schemas::{
    MintRecord, MintStatus, NewMint, Phase, Reservation, ReservationSelector,
    StuckTransactionRecord, TxKind,
};
use ordm_settlement::{MintEvent, Transition};
use ordm_stuck::StuckPolicy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Clock, EngineError, SystemClock};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// System-wide ceiling on a single claim's quantity.
    pub max_per_transaction: i64,
    pub lease: Duration,
    pub stuck: StuckPolicy,
    /// Max candidates examined per sweep.
    pub batch_limit: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl Limits {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_per_transaction: cfg.engine.max_per_transaction,
            lease: Duration::seconds(cfg.engine.lease_seconds),
            stuck: StuckPolicy::from_minutes(cfg.stuck.threshold_minutes),
            batch_limit: cfg.stuck.batch_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests / outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub collection_id: Uuid,
    #[serde(default)]
    pub phase_id: Option<Uuid>,
    pub wallet: String,
    pub quantity: i64,
    /// "Pick exact asset" flow; must name `quantity` distinct assets.
    #[serde(default)]
    pub specific_asset_ids: Option<Vec<Uuid>>,
    /// Overrides the configured lease duration.
    #[serde(default)]
    pub lease_seconds: Option<i64>,
}

/// What happened to one settlement event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied { from: MintStatus, to: MintStatus },
    /// Already absorbed; nothing changed.
    Duplicate { status: MintStatus },
    /// Not accepted in the record's current state; logged and dropped.
    Ignored { status: MintStatus, event: String },
}

// ---------------------------------------------------------------------------
// MintEngine
// ---------------------------------------------------------------------------

/// The inbound operations of the allocation and settlement engine.
///
/// Cheap to clone; every handle shares the same store and oracle.
#[derive(Clone)]
pub struct MintEngine {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) oracle: Arc<dyn ConfirmationOracle>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) limits: Limits,
}

impl MintEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        oracle: Arc<dyn ConfirmationOracle>,
        limits: Limits,
    ) -> Self {
        Self {
            store,
            oracle,
            clock: Arc::new(SystemClock),
            limits,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn oracle_source(&self) -> &'static str {
        self.oracle.source_name()
    }

    // -----------------------------------------------------------------------
    // Eligibility
    // -----------------------------------------------------------------------

    async fn load_phase(&self, phase_id: Uuid, collection_id: Uuid) -> Result<Phase, EngineError> {
        let phase = self
            .store
            .fetch_phase(phase_id)
            .await?
            .ok_or_else(|| EngineError::not_found("phase", phase_id))?;
        if phase.collection_id != collection_id {
            return Err(EngineError::PhaseMismatch {
                phase_id,
                collection_id,
            });
        }
        Ok(phase)
    }

    async fn eligibility_in(
        &self,
        phase: &Phase,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<Eligibility, EngineError> {
        let entry = match phase.allow_list_id {
            Some(list) => self.store.allow_list_entry(list, wallet).await?,
            None => None,
        };
        let membership = Membership::for_phase(phase, entry.as_ref());
        let attempts = self
            .store
            .count_wallet_attempts(wallet, phase.phase_id, now)
            .await?;
        Ok(wallet_remaining(phase, membership, wallet, attempts)?)
    }

    /// Remaining quota of `wallet` in the phase.
    pub async fn remaining(
        &self,
        wallet: &str,
        collection_id: Uuid,
        phase_id: Uuid,
    ) -> Result<Eligibility, EngineError> {
        let phase = self.load_phase(phase_id, collection_id).await?;
        self.eligibility_in(&phase, wallet, self.clock.now()).await
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Lease `quantity` assets for the wallet, all or nothing.
    pub async fn claim(&self, req: &ClaimRequest) -> Result<Vec<Reservation>, EngineError> {
        validate_quantity(req.quantity, self.limits.max_per_transaction)?;

        let specific_asset_ids = match &req.specific_asset_ids {
            Some(ids) => {
                let distinct: BTreeSet<Uuid> = ids.iter().copied().collect();
                if distinct.len() as i64 != req.quantity {
                    return Err(EngineError::InvalidRequest(format!(
                        "specific_asset_ids names {} distinct assets, quantity is {}",
                        distinct.len(),
                        req.quantity
                    )));
                }
                Some(distinct.into_iter().collect::<Vec<_>>())
            }
            None => None,
        };

        let lease = match req.lease_seconds {
            Some(s) if s < 1 => {
                return Err(EngineError::InvalidRequest(format!(
                    "lease_seconds={s} must be >= 1"
                )))
            }
            Some(s) => Duration::seconds(s),
            None => self.limits.lease,
        };

        let now = self.clock.now();
        let released = self.store.release_expired(now).await?;
        if released > 0 {
            info!(released, "expired leases released");
        }

        let quota = match req.phase_id {
            Some(phase_id) => {
                let phase = self.load_phase(phase_id, req.collection_id).await?;
                ensure_open(&phase, now)?;
                let eligibility = self.eligibility_in(&phase, &req.wallet, now).await?;
                validate_request(&eligibility, req.quantity, self.limits.max_per_transaction)?;
                validate_allocation(&phase, phase.minted_count, req.quantity)?;
                eligibility.max_allowed
            }
            None => None,
        };

        let lease_req = LeaseRequest {
            collection_id: req.collection_id,
            phase_id: req.phase_id,
            wallet: req.wallet.clone(),
            quantity: req.quantity,
            lease,
            specific_asset_ids,
            quota,
            now,
        };

        match self.store.lease_assets(&lease_req).await {
            Ok(reservations) => {
                for r in &reservations {
                    info!(
                        reservation_id = %r.reservation_id,
                        asset_id = %r.asset_id,
                        wallet = %r.wallet,
                        expires_at = %r.expires_at,
                        "lease created"
                    );
                }
                Ok(reservations)
            }
            Err(e) => {
                warn!(
                    wallet = %req.wallet,
                    collection_id = %req.collection_id,
                    quantity = req.quantity,
                    error = %e,
                    "claim rejected"
                );
                Err(e.into())
            }
        }
    }

    pub async fn cancel_claim(
        &self,
        selector: &ReservationSelector,
        wallet: &str,
    ) -> Result<Vec<Uuid>, EngineError> {
        let out = self.store.cancel_reservations(selector, wallet).await?;
        for id in &out.cancelled {
            info!(reservation_id = %id, wallet = %wallet, "lease cancelled");
        }
        Ok(out.cancelled)
    }

    /// Complete a reservation. `false` when there was nothing to complete;
    /// retrying is always safe.
    pub async fn complete_claim(
        &self,
        reservation_id: Uuid,
        wallet: &str,
        settlement_ref: Option<&str>,
    ) -> Result<bool, EngineError> {
        let done = self
            .store
            .complete_reservation(reservation_id, wallet, settlement_ref)
            .await?;
        if done {
            info!(reservation_id = %reservation_id, wallet = %wallet, "reservation completed");
        } else {
            debug!(reservation_id = %reservation_id, wallet = %wallet, "complete skipped");
        }
        Ok(done)
    }

    pub async fn list_reservations(
        &self,
        wallet: &str,
        collection_id: Uuid,
    ) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.store.list_reservations(wallet, collection_id).await?)
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Create the `pending` mint record for a live reservation, or return the
    /// open one that already exists.
    pub async fn begin_settlement(&self, new: &NewMint) -> Result<OpenedMint, EngineError> {
        if new.receiving_wallet.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "receiving_wallet must not be empty".to_string(),
            ));
        }
        if !new.fee_rate.is_finite() || new.fee_rate <= 0.0 {
            return Err(EngineError::InvalidRequest(format!(
                "fee_rate={} must be positive",
                new.fee_rate
            )));
        }

        let opened = self.store.open_mint(new, self.clock.now()).await?;
        if opened.created {
            info!(
                mint_id = %opened.record.mint_id,
                reservation_id = %new.reservation_id,
                asset_id = %opened.record.asset_id,
                wallet = %new.wallet,
                "mint record opened"
            );
        }
        Ok(opened)
    }

    pub async fn get_mint(&self, mint_id: Uuid) -> Result<MintRecord, EngineError> {
        self.store
            .fetch_mint(mint_id)
            .await?
            .ok_or_else(|| EngineError::not_found("mint", mint_id))
    }

    /// Feed one externally observed settlement event to the state machine.
    ///
    /// Events the record cannot accept in its current state are logged and
    /// reported as [`EventOutcome::Ignored`]; confirmation feeds deliver late
    /// and repeated events.
    pub async fn record_event(
        &self,
        mint_id: Uuid,
        event: MintEvent,
    ) -> Result<EventOutcome, EngineError> {
        validate_external_event(&event)?;
        self.drive(mint_id, &event).await
    }

    async fn drive(&self, mint_id: Uuid, event: &MintEvent) -> Result<EventOutcome, EngineError> {
        match self
            .store
            .apply_mint_event(mint_id, event, self.clock.now())
            .await
        {
            Ok(update) => Ok(match update.transition {
                Transition::Applied { from, to, effects } => {
                    info!(
                        mint_id = %mint_id,
                        event = event.name(),
                        from = from.as_str(),
                        to = to.as_str(),
                        claimed = effects.claim_asset,
                        counted = effects.count_toward_phase,
                        "mint transition"
                    );
                    EventOutcome::Applied { from, to }
                }
                Transition::Duplicate { status } => {
                    debug!(
                        mint_id = %mint_id,
                        event = event.name(),
                        status = status.as_str(),
                        "duplicate mint event"
                    );
                    EventOutcome::Duplicate { status }
                }
            }),
            Err(LedgerError::Transition(e)) => {
                warn!(
                    mint_id = %mint_id,
                    event = %e.event,
                    status = e.from.as_str(),
                    "mint event ignored"
                );
                Ok(EventOutcome::Ignored {
                    status: e.from,
                    event: e.event,
                })
            }
            Err(e) => {
                warn!(mint_id = %mint_id, event = event.name(), error = %e, "mint event rejected");
                Err(e.into())
            }
        }
    }

    pub async fn record_commit_broadcast(
        &self,
        mint_id: Uuid,
        tx_id: &str,
        output_index: i32,
        output_value: i64,
    ) -> Result<EventOutcome, EngineError> {
        self.record_event(
            mint_id,
            MintEvent::CommitBroadcast {
                tx_id: tx_id.to_string(),
                output_index,
                output_value,
            },
        )
        .await
    }

    pub async fn record_confirmations(
        &self,
        mint_id: Uuid,
        tx_kind: TxKind,
        confirmations: i32,
    ) -> Result<EventOutcome, EngineError> {
        self.record_event(
            mint_id,
            MintEvent::Confirmations {
                tx_kind,
                confirmations,
            },
        )
        .await
    }

    pub async fn record_commit_confirmed(&self, mint_id: Uuid) -> Result<EventOutcome, EngineError> {
        self.record_event(mint_id, MintEvent::CommitConfirmed).await
    }

    pub async fn record_reveal_broadcast(
        &self,
        mint_id: Uuid,
        tx_id: &str,
    ) -> Result<EventOutcome, EngineError> {
        self.record_event(
            mint_id,
            MintEvent::RevealBroadcast {
                tx_id: tx_id.to_string(),
            },
        )
        .await
    }

    pub async fn record_reveal_confirmed(
        &self,
        mint_id: Uuid,
        inscription_id: &str,
    ) -> Result<EventOutcome, EngineError> {
        self.record_event(
            mint_id,
            MintEvent::RevealConfirmed {
                inscription_id: inscription_id.to_string(),
            },
        )
        .await
    }

    pub async fn record_failure(
        &self,
        mint_id: Uuid,
        reason: &str,
        code: &str,
        flag_for_review: bool,
    ) -> Result<EventOutcome, EngineError> {
        self.record_event(
            mint_id,
            MintEvent::Failure {
                reason: reason.to_string(),
                code: code.to_string(),
                flag_for_review,
            },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    pub async fn list_open_stuck(&self) -> Result<Vec<StuckTransactionRecord>, EngineError> {
        Ok(self.store.list_open_stuck(self.limits.batch_limit).await?)
    }

    pub async fn recount_phase(&self, phase_id: Uuid) -> Result<PhaseCounts, EngineError> {
        let counts = self.store.recount_phase(phase_id).await?;
        info!(
            phase_id = %phase_id,
            minted_count = counts.minted_count,
            entries_updated = counts.entries_updated,
            "phase counters recomputed"
        );
        Ok(counts)
    }
}

/// Reject events callers may not send directly and obviously malformed ones.
fn validate_external_event(event: &MintEvent) -> Result<(), EngineError> {
    fn blank(s: &str) -> bool {
        s.trim().is_empty()
    }
    match event {
        MintEvent::FlagStuck { .. } | MintEvent::MarkResolved | MintEvent::Abandon => {
            Err(EngineError::InvalidRequest(format!(
                "{} is driven by the stuck sweep and resolve-stuck only",
                event.name()
            )))
        }
        MintEvent::CommitBroadcast { tx_id, .. } | MintEvent::RevealBroadcast { tx_id }
            if blank(tx_id) =>
        {
            Err(EngineError::InvalidRequest("tx_id must not be empty".to_string()))
        }
        MintEvent::CommitBroadcast { output_index, .. } if *output_index < 0 => Err(
            EngineError::InvalidRequest("output_index must not be negative".to_string()),
        ),
        MintEvent::RevealConfirmed { inscription_id } if blank(inscription_id) => Err(
            EngineError::InvalidRequest("inscription_id must not be empty".to_string()),
        ),
        MintEvent::Failure { code, .. } if blank(code) => Err(EngineError::InvalidRequest(
            "failure code must not be empty".to_string(),
        )),
        _ => Ok(()),
    }
}
