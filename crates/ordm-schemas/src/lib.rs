//! ordm-schemas
//!
//! Shared data model for the allocation and settlement engine. Every crate in
//! the workspace speaks these types; none of them carry behavior beyond small
//! predicates over their own fields.
//!
//! Status enums persist as lowercase strings (`as_str` / `parse`) so the
//! Postgres ledger and the in-memory ledger store byte-identical values.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

/// One unique mintable unit of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: Uuid,
    pub collection_id: Uuid,
    /// Flips to `true` exactly once, when the owning mint completes.
    pub is_claimed: bool,
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Completed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "completed" => Ok(ReservationStatus::Completed),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(anyhow!("invalid reservation status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Reserved)
    }
}

/// A time-boxed exclusive claim on one asset by one wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub asset_id: Uuid,
    pub collection_id: Uuid,
    pub phase_id: Option<Uuid>,
    pub wallet: String,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
    /// Inscription id (or other settlement reference) once completed.
    pub settlement_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// `reserved` and the lease has not elapsed at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at > now
    }
}

/// Which reservations a cancel request targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum ReservationSelector {
    Reservation { reservation_id: Uuid },
    Asset { asset_id: Uuid },
    AllForWallet { collection_id: Uuid },
}

// ---------------------------------------------------------------------------
// Phase / allow-list
// ---------------------------------------------------------------------------

/// A priced sale window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: Uuid,
    pub collection_id: Uuid,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub price_sats: i64,
    pub max_per_wallet: Option<i64>,
    pub total_allocation: Option<i64>,
    pub allow_list_id: Option<Uuid>,
    pub is_completed: bool,
    /// Materialized reveal count. Only moved by settlement transitions.
    pub minted_count: i64,
}

impl Phase {
    /// Open iff `now` is within `[starts_at, ends_at)` and the phase is not
    /// marked completed.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.is_completed || now < self.starts_at {
            return false;
        }
        match self.ends_at {
            Some(end) => now < end,
            None => true,
        }
    }
}

/// Allow-list membership row.
///
/// `allocation` is carried for reporting only; the per-wallet limit enforced
/// for an allow-list phase is the phase's `max_per_wallet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListEntry {
    pub allow_list_id: Uuid,
    pub wallet: String,
    pub allocation: i64,
    pub minted_count: i64,
}

// ---------------------------------------------------------------------------
// Mint records
// ---------------------------------------------------------------------------

/// Which leg of the commit/reveal pair a transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Commit,
    Reveal,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Commit => "commit",
            TxKind::Reveal => "reveal",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "commit" => Ok(TxKind::Commit),
            "reveal" => Ok(TxKind::Reveal),
            other => Err(anyhow!("invalid tx kind: {}", other)),
        }
    }
}

/// Settlement lifecycle of one mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintStatus {
    Pending,
    CommitBroadcast,
    CommitConfirming,
    CommitConfirmed,
    RevealBroadcast,
    RevealConfirming,
    /// Passed through on the way to `Completed`; never persisted by the
    /// state machine.
    RevealConfirmed,
    Completed,
    Failed,
    Stuck,
    Refunded,
    Cancelled,
}

impl MintStatus {
    pub const ALL: [MintStatus; 12] = [
        MintStatus::Pending,
        MintStatus::CommitBroadcast,
        MintStatus::CommitConfirming,
        MintStatus::CommitConfirmed,
        MintStatus::RevealBroadcast,
        MintStatus::RevealConfirming,
        MintStatus::RevealConfirmed,
        MintStatus::Completed,
        MintStatus::Failed,
        MintStatus::Stuck,
        MintStatus::Refunded,
        MintStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MintStatus::Pending => "pending",
            MintStatus::CommitBroadcast => "commit_broadcast",
            MintStatus::CommitConfirming => "commit_confirming",
            MintStatus::CommitConfirmed => "commit_confirmed",
            MintStatus::RevealBroadcast => "reveal_broadcast",
            MintStatus::RevealConfirming => "reveal_confirming",
            MintStatus::RevealConfirmed => "reveal_confirmed",
            MintStatus::Completed => "completed",
            MintStatus::Failed => "failed",
            MintStatus::Stuck => "stuck",
            MintStatus::Refunded => "refunded",
            MintStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        MintStatus::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| anyhow!("invalid mint status: {}", s))
    }

    /// No further transitions except late duplicates (and `Failed -> Refunded`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MintStatus::Completed | MintStatus::Failed | MintStatus::Refunded | MintStatus::Cancelled
        )
    }

    /// A transaction has been broadcast and is awaiting confirmation.
    pub fn is_awaiting_confirmation(&self) -> bool {
        matches!(
            self,
            MintStatus::CommitBroadcast
                | MintStatus::CommitConfirming
                | MintStatus::RevealBroadcast
                | MintStatus::RevealConfirming
        )
    }

    /// The attempt no longer holds its asset and no longer counts against a
    /// wallet's quota.
    pub fn is_released(&self) -> bool {
        matches!(
            self,
            MintStatus::Failed | MintStatus::Refunded | MintStatus::Cancelled
        )
    }
}

/// Settlement record for one claim. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintRecord {
    pub mint_id: Uuid,
    pub reservation_id: Uuid,
    pub asset_id: Uuid,
    pub collection_id: Uuid,
    pub phase_id: Option<Uuid>,
    pub minter_wallet: String,
    pub receiving_wallet: String,
    pub status: MintStatus,
    /// sats/vB used when the commit was built.
    pub fee_rate: f64,

    pub commit_tx_id: Option<String>,
    pub commit_output_index: Option<i32>,
    pub commit_output_value: Option<i64>,
    pub commit_broadcast_at: Option<DateTime<Utc>>,
    pub commit_confirmed_at: Option<DateTime<Utc>>,
    pub commit_confirmations: i32,

    pub reveal_tx_id: Option<String>,
    pub reveal_broadcast_at: Option<DateTime<Utc>>,
    pub reveal_confirmed_at: Option<DateTime<Utc>>,
    pub reveal_confirmations: i32,

    pub inscription_id: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,

    pub stuck_since: Option<DateTime<Utc>>,
    pub stuck_tx_kind: Option<TxKind>,

    pub flagged_for_review: bool,
    pub is_test: bool,
    pub is_admin: bool,
    /// Set once the record has been added to the phase / allow-list counters.
    pub phase_counted: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MintRecord {
    /// A fresh `pending` record for a reservation that is moving to settlement.
    pub fn pending(new: &NewMint, reservation: &Reservation, now: DateTime<Utc>) -> Self {
        Self {
            mint_id: Uuid::new_v4(),
            reservation_id: reservation.reservation_id,
            asset_id: reservation.asset_id,
            collection_id: reservation.collection_id,
            phase_id: reservation.phase_id,
            minter_wallet: reservation.wallet.clone(),
            receiving_wallet: new.receiving_wallet.clone(),
            status: MintStatus::Pending,
            fee_rate: new.fee_rate,
            commit_tx_id: None,
            commit_output_index: None,
            commit_output_value: None,
            commit_broadcast_at: None,
            commit_confirmed_at: None,
            commit_confirmations: 0,
            reveal_tx_id: None,
            reveal_broadcast_at: None,
            reveal_confirmed_at: None,
            reveal_confirmations: 0,
            inscription_id: None,
            error_message: None,
            error_code: None,
            stuck_since: None,
            stuck_tx_kind: None,
            flagged_for_review: false,
            is_test: new.is_test,
            is_admin: new.is_admin,
            phase_counted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Test and admin mints are excluded from every count.
    pub fn is_countable(&self) -> bool {
        !self.is_test && !self.is_admin
    }

    /// Counts against the minter's per-phase quota.
    pub fn counts_toward_quota(&self) -> bool {
        self.is_countable() && !self.status.is_released()
    }

    /// Keeps the asset out of the reservable pool.
    pub fn holds_asset(&self) -> bool {
        !self.status.is_released() || self.flagged_for_review
    }

    /// The transaction id of the given leg, if broadcast.
    pub fn tx_id(&self, kind: TxKind) -> Option<&str> {
        match kind {
            TxKind::Commit => self.commit_tx_id.as_deref(),
            TxKind::Reveal => self.reveal_tx_id.as_deref(),
        }
    }

    pub fn broadcast_at(&self, kind: TxKind) -> Option<DateTime<Utc>> {
        match kind {
            TxKind::Commit => self.commit_broadcast_at,
            TxKind::Reveal => self.reveal_broadcast_at,
        }
    }
}

/// Input for opening a mint record against a live reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMint {
    pub reservation_id: Uuid,
    pub wallet: String,
    pub receiving_wallet: String,
    pub fee_rate: f64,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub is_admin: bool,
}

// ---------------------------------------------------------------------------
// Stuck transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckStatus {
    Detected,
    RbfSent,
    CpfpSent,
    Resolved,
    Abandoned,
}

impl StuckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StuckStatus::Detected => "detected",
            StuckStatus::RbfSent => "rbf_sent",
            StuckStatus::CpfpSent => "cpfp_sent",
            StuckStatus::Resolved => "resolved",
            StuckStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "detected" => Ok(StuckStatus::Detected),
            "rbf_sent" => Ok(StuckStatus::RbfSent),
            "cpfp_sent" => Ok(StuckStatus::CpfpSent),
            "resolved" => Ok(StuckStatus::Resolved),
            "abandoned" => Ok(StuckStatus::Abandoned),
            other => Err(anyhow!("invalid stuck status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StuckStatus::Resolved | StuckStatus::Abandoned)
    }
}

/// One detected stall of a commit or reveal transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckTransactionRecord {
    pub stuck_id: Uuid,
    pub mint_id: Uuid,
    pub tx_kind: TxKind,
    pub tx_id: String,
    pub detected_at: DateTime<Utc>,
    pub elapsed_minutes: i64,
    /// Fee rate the transaction actually pays, when the oracle knows it.
    pub fee_rate: Option<f64>,
    pub recommended_fee_rate: Option<f64>,
    /// Fee rate requested for an RBF/CPFP bump.
    pub target_fee_rate: Option<f64>,
    pub status: StuckStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// What the detector measured when it decided to flag a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckFlag {
    pub tx_kind: TxKind,
    pub tx_id: String,
    pub elapsed_minutes: i64,
    pub fee_rate: Option<f64>,
    pub recommended_fee_rate: Option<f64>,
}

impl StuckTransactionRecord {
    pub fn detected(mint_id: Uuid, flag: &StuckFlag, now: DateTime<Utc>) -> Self {
        Self {
            stuck_id: Uuid::new_v4(),
            mint_id,
            tx_kind: flag.tx_kind,
            tx_id: flag.tx_id.clone(),
            detected_at: now,
            elapsed_minutes: flag.elapsed_minutes,
            fee_rate: flag.fee_rate,
            recommended_fee_rate: flag.recommended_fee_rate,
            target_fee_rate: None,
            status: StuckStatus::Detected,
            resolved_at: None,
        }
    }
}
