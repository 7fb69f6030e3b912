use chrono::{DateTime, Duration, Utc};
use ordm_schemas::{
    AllowListEntry, Asset, MintRecord, NewMint, Phase, Reservation, ReservationSelector,
    StuckFlag, StuckStatus, StuckTransactionRecord,
};
use ordm_settlement::{MintEvent, Transition, TransitionError};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient supply: requested {requested}, available {available}")]
    InsufficientSupply { requested: i64, available: i64 },

    /// Re-check inside the lease unit found the wallet over quota.
    #[error("{remaining} remaining, requested {requested}")]
    QuotaExceeded {
        remaining: i64,
        requested: i64,
        minted: i64,
        max_allowed: i64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("reservation {reservation_id} is owned by another wallet")]
    NotOwned { reservation_id: Uuid },

    #[error("reservation {reservation_id} is not live")]
    ReservationNotLive { reservation_id: Uuid },

    #[error("stuck record {stuck_id} already {}", status.as_str())]
    StuckClosed { stuck_id: Uuid, status: StuckStatus },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("ledger store unavailable: {0:#}")]
    Unavailable(#[from] anyhow::Error),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Unavailable(anyhow::Error::new(e))
    }
}

impl LedgerError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub collection_id: Uuid,
    pub phase_id: Option<Uuid>,
    pub wallet: String,
    pub quantity: i64,
    pub lease: Duration,
    /// Exact assets to lease; `quantity` must equal its length.
    pub specific_asset_ids: Option<Vec<Uuid>>,
    /// The wallet's `max_allowed` for the phase. When set, attempts are
    /// re-counted inside the lease unit.
    pub quota: Option<i64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenedMint {
    pub record: MintRecord,
    /// `false` when an open record for the reservation already existed.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MintUpdate {
    pub record: MintRecord,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlagOutcome {
    pub record: MintRecord,
    pub stuck: StuckTransactionRecord,
    /// `false` when an open stuck record for the same transaction existed.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseCounts {
    pub phase_id: Uuid,
    pub minted_count: i64,
    pub entries_updated: u64,
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Guarded ledger operations. Each method is atomic: it either commits all of
/// its writes or none.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Flip every `reserved` row whose lease elapsed at `now` to `expired`.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError>;

    /// Lease `quantity` assets, all or nothing.
    async fn lease_assets(&self, req: &LeaseRequest) -> Result<Vec<Reservation>, LedgerError>;

    /// Idempotently cancel `reserved` rows owned by `wallet`.
    ///
    /// Only the by-reservation selector reports `NotFound` / `NotOwned`; rows
    /// that are already terminal are skipped.
    async fn cancel_reservations(
        &self,
        selector: &ReservationSelector,
        wallet: &str,
    ) -> Result<CancelOutcome, LedgerError>;

    /// Flip a `reserved` row owned by `wallet` to `completed`. Returns `false`
    /// (no error) when the row is missing, not reserved or not owned.
    async fn complete_reservation(
        &self,
        reservation_id: Uuid,
        wallet: &str,
        settlement_ref: Option<&str>,
    ) -> Result<bool, LedgerError>;

    async fn fetch_reservation(&self, reservation_id: Uuid)
        -> Result<Option<Reservation>, LedgerError>;

    async fn list_reservations(
        &self,
        wallet: &str,
        collection_id: Uuid,
    ) -> Result<Vec<Reservation>, LedgerError>;

    async fn fetch_asset(&self, asset_id: Uuid) -> Result<Option<Asset>, LedgerError>;

    async fn fetch_phase(&self, phase_id: Uuid) -> Result<Option<Phase>, LedgerError>;

    async fn allow_list_entry(
        &self,
        allow_list_id: Uuid,
        wallet: &str,
    ) -> Result<Option<AllowListEntry>, LedgerError>;

    /// Non-released, countable mint records of the wallet in the phase, plus
    /// its live or completed reservations that have no mint record.
    async fn count_wallet_attempts(
        &self,
        wallet: &str,
        phase_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError>;

    /// Create the `pending` mint record for a live reservation owned by
    /// `new.wallet`, or return the open one that already exists.
    async fn open_mint(&self, new: &NewMint, now: DateTime<Utc>)
        -> Result<OpenedMint, LedgerError>;

    async fn fetch_mint(&self, mint_id: Uuid) -> Result<Option<MintRecord>, LedgerError>;

    /// Lock the record, run the state machine, persist the record and the
    /// transition's effects together.
    async fn apply_mint_event(
        &self,
        mint_id: Uuid,
        event: &MintEvent,
        now: DateTime<Utc>,
    ) -> Result<MintUpdate, LedgerError>;

    /// Unflagged in-flight records whose current leg was broadcast at or
    /// before `cutoff`, plus every `stuck` record. Oldest update first.
    async fn list_sweep_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MintRecord>, LedgerError>;

    /// Move the record to `stuck` and create the stuck record, unless an open
    /// one for the same transaction exists.
    async fn flag_stuck(
        &self,
        mint_id: Uuid,
        flag: &StuckFlag,
        now: DateTime<Utc>,
    ) -> Result<FlagOutcome, LedgerError>;

    async fn fetch_stuck(
        &self,
        stuck_id: Uuid,
    ) -> Result<Option<StuckTransactionRecord>, LedgerError>;

    async fn list_open_stuck(&self, limit: i64)
        -> Result<Vec<StuckTransactionRecord>, LedgerError>;

    /// Record a fee-bump decision on an open stuck record.
    async fn record_fee_bump(
        &self,
        stuck_id: Uuid,
        status: StuckStatus,
        target_fee_rate: f64,
    ) -> Result<StuckTransactionRecord, LedgerError>;

    /// Recompute the phase and allow-list counters from mint records.
    async fn recount_phase(&self, phase_id: Uuid) -> Result<PhaseCounts, LedgerError>;
}
