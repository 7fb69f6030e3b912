use chrono::Duration;
use ordm_schemas::{StuckFlag, TxKind};
use ordm_settlement::MintEvent;
use serde::{Deserialize, Serialize};

/// Default staleness threshold for a broadcast transaction.
pub const DEFAULT_STALE_MINUTES: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StuckPolicy {
    pub threshold: Duration,
}

impl Default for StuckPolicy {
    fn default() -> Self {
        Self {
            threshold: Duration::minutes(DEFAULT_STALE_MINUTES),
        }
    }
}

impl StuckPolicy {
    pub fn from_minutes(minutes: i64) -> Self {
        Self {
            threshold: Duration::minutes(minutes),
        }
    }
}

/// The leg of a mint that is currently waiting on the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InFlightLeg {
    pub tx_kind: TxKind,
    pub tx_id: String,
    pub broadcast_at: chrono::DateTime<chrono::Utc>,
}

/// What the confirmation oracle reported for a leg's transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainVerdict {
    Confirmed,
    /// In the mempool, paying `fee_rate` sats/vB when known.
    Unconfirmed { fee_rate: Option<f64> },
    /// The indexer has never seen the transaction (dropped or never relayed).
    Unknown,
}

/// A flag the detector wants to raise, still missing the current fee
/// recommendation (fetched only when a flag is actually needed).
#[derive(Clone, Debug, PartialEq)]
pub struct PendingFlag {
    pub tx_kind: TxKind,
    pub tx_id: String,
    pub elapsed_minutes: i64,
    pub fee_rate: Option<f64>,
}

impl PendingFlag {
    pub fn with_recommendation(self, recommended_fee_rate: f64) -> StuckFlag {
        StuckFlag {
            tx_kind: self.tx_kind,
            tx_id: self.tx_id,
            elapsed_minutes: self.elapsed_minutes,
            fee_rate: self.fee_rate,
            recommended_fee_rate: Some(recommended_fee_rate),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SweepDecision {
    /// The chain confirmed the leg; feed this event to the state machine.
    Heal { event: MintEvent },
    Flag(PendingFlag),
    /// Still unconfirmed and already flagged on an earlier sweep.
    AlreadyFlagged,
    /// Unconfirmed but younger than the threshold.
    NotStale,
    /// The record has no broadcast leg to check.
    NotInFlight,
}

/// Tally of one sweep, surfaced to the scheduler for logging/alerting.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: u64,
    pub flagged: u64,
    pub healed: u64,
    pub already_flagged: u64,
    pub not_stale: u64,
    pub oracle_errors: u64,
    pub store_errors: u64,
}

impl SweepReport {
    pub fn errors(&self) -> u64 {
        self.oracle_errors + self.store_errors
    }

    pub fn is_clean(&self) -> bool {
        self.errors() == 0
    }
}
