//! Mint settlement state machine.
//!
//! # Design
//!
//! Every settlement event is applied via [`apply`], which enforces:
//!
//! 1. **Legal transitions only.** Illegal events return [`TransitionError`]
//!    and leave the record untouched. External confirmation feeds deliver
//!    events more than once and out of order, so callers log and drop these.
//! 2. **Terminal facts exactly once.** Re-delivery of an event that the record
//!    has already absorbed returns [`Transition::Duplicate`] with no mutation
//!    and no effects. This is what makes `RevealConfirmed` safe to replay.
//!
//! # State diagram
//!
//! ```text
//!  Pending ─CommitBroadcast─► CommitBroadcast ─Confirmations─► CommitConfirming
//!                                   │                                 │
//!                                   └──────────CommitConfirmed────────┤
//!                                                                     ▼
//!  Completed ◄─RevealConfirmed─ RevealConfirming ◄── RevealBroadcast ◄─ CommitConfirmed
//!      ▲                                 ▲               │
//!      │                                 └─Confirmations─┘
//!      │
//!    MarkResolved          FlagStuck (from any *Broadcast / *Confirming)
//!      │                        │
//!      └──────────────────── Stuck ──Abandon──► Failed
//!                               │
//!                 replacement broadcast / late confirmation
//!                 return the stuck leg to its live state
//!
//!  Failure: any non-terminal ─► Failed      Refund: ─► Refunded
//!  Cancel:  any non-terminal ─► Cancelled
//! ```
//!
//! `RevealConfirmed` is a pass-through: a confirmed reveal lands directly in
//! `Completed` together with the asset claim and reservation completion.

use chrono::{DateTime, Utc};
use ordm_schemas::{MintRecord, MintStatus, TxKind};
use serde::{Deserialize, Serialize};

/// Reason recorded when an operator abandons a stuck mint.
pub const ABANDONED_REASON: &str = "transaction abandoned after it stayed unconfirmed";
pub const ABANDONED_CODE: &str = "STUCK_ABANDONED";

// ---------------------------------------------------------------------------
// MintEvent
// ---------------------------------------------------------------------------

/// Events that drive a [`MintRecord`] through settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MintEvent {
    /// The commit transaction was broadcast (or replaced by a fee bump).
    CommitBroadcast {
        tx_id: String,
        output_index: i32,
        output_value: i64,
    },
    /// Confirmation count observed for one leg, below finality.
    Confirmations { tx_kind: TxKind, confirmations: i32 },
    CommitConfirmed,
    /// The reveal transaction was broadcast (or replaced by a fee bump).
    RevealBroadcast { tx_id: String },
    RevealConfirmed { inscription_id: String },
    Failure {
        reason: String,
        code: String,
        #[serde(default)]
        flag_for_review: bool,
    },
    /// Injected by the stuck detector.
    FlagStuck { tx_kind: TxKind },
    /// Operator asserts the stuck mint settled.
    MarkResolved,
    /// Operator gives up on the stuck mint.
    Abandon,
    Refund,
    Cancel,
}

impl MintEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MintEvent::CommitBroadcast { .. } => "commit_broadcast",
            MintEvent::Confirmations { .. } => "confirmations",
            MintEvent::CommitConfirmed => "commit_confirmed",
            MintEvent::RevealBroadcast { .. } => "reveal_broadcast",
            MintEvent::RevealConfirmed { .. } => "reveal_confirmed",
            MintEvent::Failure { .. } => "failure",
            MintEvent::FlagStuck { .. } => "flag_stuck",
            MintEvent::MarkResolved => "mark_resolved",
            MintEvent::Abandon => "abandon",
            MintEvent::Refund => "refund",
            MintEvent::Cancel => "cancel",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition results
// ---------------------------------------------------------------------------

/// Side effects the store must commit in the same transaction as the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEffects {
    /// Flip the asset's `is_claimed` flag.
    pub claim_asset: bool,
    /// Complete the owning reservation with the inscription id.
    pub complete_reservation: bool,
    /// Add this mint to the phase and allow-list counters.
    pub count_toward_phase: bool,
    /// Resolve open stuck records for this leg.
    pub settled_leg: Option<TxKind>,
    /// Abandon every open stuck record of this mint.
    pub closes_stuck: bool,
    /// Expire the owning reservation so the asset returns to the pool.
    pub release_asset: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied {
        from: MintStatus,
        to: MintStatus,
        effects: SettlementEffects,
    },
    /// The record already reflects this event; nothing changed.
    Duplicate { status: MintStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    pub fn effects(&self) -> SettlementEffects {
        match self {
            Transition::Applied { effects, .. } => *effects,
            Transition::Duplicate { .. } => SettlementEffects::default(),
        }
    }
}

/// Returned when an event cannot legally be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: MintStatus,
    pub event: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal mint transition: {} + {}",
            self.from.as_str(),
            self.event
        )
    }
}

impl std::error::Error for TransitionError {}

/// Standard inscription id for the first inscription of a reveal transaction.
pub fn inscription_id_for_reveal(reveal_tx_id: &str) -> String {
    format!("{reveal_tx_id}i0")
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Apply `event` to `rec` at `now`.
///
/// # Errors
/// [`TransitionError`] when the event is illegal in the record's state. The
/// record is not modified in that case.
pub fn apply(
    rec: &mut MintRecord,
    event: &MintEvent,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    use MintEvent as E;
    use MintStatus::*;

    let from = rec.status;
    let stuck_leg = if from == Stuck { rec.stuck_tx_kind } else { None };
    let mut effects = SettlementEffects::default();

    match (from, event) {
        // ------------------------------------------------------------------
        // Commit broadcast (first broadcast or fee-bump replacement)
        // ------------------------------------------------------------------
        (
            CommitBroadcast | CommitConfirming | CommitConfirmed | RevealBroadcast
            | RevealConfirming | RevealConfirmed | Completed | Stuck,
            E::CommitBroadcast { tx_id, .. },
        ) if rec.commit_tx_id.as_deref() == Some(tx_id.as_str()) => {
            return Ok(Transition::Duplicate { status: from });
        }

        (
            Pending | CommitBroadcast | CommitConfirming,
            E::CommitBroadcast {
                tx_id,
                output_index,
                output_value,
            },
        ) => {
            set_commit(rec, tx_id, *output_index, *output_value, now);
            rec.status = CommitBroadcast;
        }

        (
            Stuck,
            E::CommitBroadcast {
                tx_id,
                output_index,
                output_value,
            },
        ) if stuck_leg == Some(TxKind::Commit) => {
            set_commit(rec, tx_id, *output_index, *output_value, now);
            clear_stuck(rec);
            rec.status = CommitBroadcast;
        }

        // ------------------------------------------------------------------
        // Confirmation progress
        // ------------------------------------------------------------------
        (
            CommitBroadcast | CommitConfirming,
            E::Confirmations {
                tx_kind: TxKind::Commit,
                confirmations,
            },
        ) if *confirmations > 0 => {
            rec.commit_confirmations = rec.commit_confirmations.max(*confirmations);
            rec.status = CommitConfirming;
        }

        (
            Stuck,
            E::Confirmations {
                tx_kind: TxKind::Commit,
                confirmations,
            },
        ) if *confirmations > 0 && stuck_leg == Some(TxKind::Commit) => {
            rec.commit_confirmations = rec.commit_confirmations.max(*confirmations);
            clear_stuck(rec);
            rec.status = CommitConfirming;
            effects.settled_leg = Some(TxKind::Commit);
        }

        (
            RevealBroadcast | RevealConfirming,
            E::Confirmations {
                tx_kind: TxKind::Reveal,
                confirmations,
            },
        ) if *confirmations > 0 => {
            rec.reveal_confirmations = rec.reveal_confirmations.max(*confirmations);
            rec.status = RevealConfirming;
        }

        (
            Stuck,
            E::Confirmations {
                tx_kind: TxKind::Reveal,
                confirmations,
            },
        ) if *confirmations > 0 && stuck_leg == Some(TxKind::Reveal) => {
            rec.reveal_confirmations = rec.reveal_confirmations.max(*confirmations);
            clear_stuck(rec);
            rec.status = RevealConfirming;
            effects.settled_leg = Some(TxKind::Reveal);
        }

        // Zero-count or late confirmation updates carry no new information.
        (
            CommitBroadcast | CommitConfirming | CommitConfirmed | RevealBroadcast
            | RevealConfirming | RevealConfirmed | Completed,
            E::Confirmations {
                tx_kind: TxKind::Commit,
                ..
            },
        )
        | (
            RevealBroadcast | RevealConfirming | RevealConfirmed | Completed,
            E::Confirmations {
                tx_kind: TxKind::Reveal,
                ..
            },
        ) => {
            return Ok(Transition::Duplicate { status: from });
        }

        // ------------------------------------------------------------------
        // Commit confirmed
        // ------------------------------------------------------------------
        (CommitBroadcast | CommitConfirming, E::CommitConfirmed) => {
            confirm_commit(rec, now);
            effects.settled_leg = Some(TxKind::Commit);
        }

        (Stuck, E::CommitConfirmed) if stuck_leg == Some(TxKind::Commit) => {
            confirm_commit(rec, now);
            clear_stuck(rec);
            effects.settled_leg = Some(TxKind::Commit);
        }

        (
            CommitConfirmed | RevealBroadcast | RevealConfirming | RevealConfirmed | Completed,
            E::CommitConfirmed,
        ) => {
            return Ok(Transition::Duplicate { status: from });
        }

        // ------------------------------------------------------------------
        // Reveal broadcast
        // ------------------------------------------------------------------
        (
            RevealBroadcast | RevealConfirming | RevealConfirmed | Completed | Stuck,
            E::RevealBroadcast { tx_id },
        ) if rec.reveal_tx_id.as_deref() == Some(tx_id.as_str()) => {
            return Ok(Transition::Duplicate { status: from });
        }

        (CommitConfirmed | RevealBroadcast | RevealConfirming, E::RevealBroadcast { tx_id }) => {
            set_reveal(rec, tx_id, now);
            rec.status = RevealBroadcast;
            count_once(rec, &mut effects);
        }

        (Stuck, E::RevealBroadcast { tx_id }) if stuck_leg == Some(TxKind::Reveal) => {
            set_reveal(rec, tx_id, now);
            clear_stuck(rec);
            rec.status = RevealBroadcast;
            count_once(rec, &mut effects);
        }

        // ------------------------------------------------------------------
        // Reveal confirmed -> Completed
        // ------------------------------------------------------------------
        (RevealBroadcast | RevealConfirming, E::RevealConfirmed { inscription_id }) => {
            complete(rec, Some(inscription_id.clone()), now, &mut effects);
            effects.settled_leg = Some(TxKind::Reveal);
        }

        (Stuck, E::RevealConfirmed { inscription_id }) if stuck_leg == Some(TxKind::Reveal) => {
            complete(rec, Some(inscription_id.clone()), now, &mut effects);
            effects.settled_leg = Some(TxKind::Reveal);
        }

        (RevealConfirmed | Completed, E::RevealConfirmed { inscription_id })
            if rec.inscription_id.as_deref() == Some(inscription_id.as_str()) =>
        {
            return Ok(Transition::Duplicate { status: from });
        }

        // ------------------------------------------------------------------
        // Failure
        // ------------------------------------------------------------------
        (Failed, E::Failure { .. }) => return Ok(Transition::Duplicate { status: from }),

        (
            st,
            E::Failure {
                reason,
                code,
                flag_for_review,
            },
        ) if !st.is_terminal() => {
            fail(rec, reason, code, &mut effects);
            rec.flagged_for_review = *flag_for_review;
        }

        // ------------------------------------------------------------------
        // Stuck detection
        // ------------------------------------------------------------------
        (CommitBroadcast | CommitConfirming, E::FlagStuck { tx_kind: TxKind::Commit })
        | (RevealBroadcast | RevealConfirming, E::FlagStuck { tx_kind: TxKind::Reveal }) => {
            if let E::FlagStuck { tx_kind } = event {
                rec.stuck_tx_kind = Some(*tx_kind);
            }
            rec.stuck_since = Some(now);
            rec.status = Stuck;
        }

        (Stuck, E::FlagStuck { tx_kind }) if stuck_leg == Some(*tx_kind) => {
            return Ok(Transition::Duplicate { status: from });
        }

        // ------------------------------------------------------------------
        // Operator resolution of a stuck mint
        // ------------------------------------------------------------------
        (Stuck, E::MarkResolved) => {
            let inscription = match (stuck_leg, rec.reveal_tx_id.as_deref()) {
                (Some(TxKind::Reveal), Some(reveal)) => Some(inscription_id_for_reveal(reveal)),
                _ => None,
            };
            effects.settled_leg = stuck_leg;
            complete(rec, inscription, now, &mut effects);
        }

        (Completed, E::MarkResolved) => return Ok(Transition::Duplicate { status: from }),

        (Stuck, E::Abandon) => {
            fail(rec, ABANDONED_REASON, ABANDONED_CODE, &mut effects);
        }

        (Failed, E::Abandon) if rec.error_code.as_deref() == Some(ABANDONED_CODE) => {
            return Ok(Transition::Duplicate { status: from });
        }

        // ------------------------------------------------------------------
        // Refund / cancel
        // ------------------------------------------------------------------
        (Refunded, E::Refund) | (Cancelled, E::Cancel) => {
            return Ok(Transition::Duplicate { status: from });
        }

        (st, E::Refund) if st == Failed || !st.is_terminal() => {
            clear_stuck(rec);
            effects.closes_stuck = true;
            rec.status = Refunded;
        }

        (st, E::Cancel) if !st.is_terminal() => {
            clear_stuck(rec);
            effects.closes_stuck = true;
            rec.status = Cancelled;
        }

        // ------------------------------------------------------------------
        // Everything else is illegal.
        // ------------------------------------------------------------------
        (st, ev) => {
            return Err(TransitionError {
                from: st,
                event: ev.name().to_string(),
            });
        }
    }

    if !rec.holds_asset() {
        effects.release_asset = true;
    }
    rec.updated_at = now;
    Ok(Transition::Applied {
        from,
        to: rec.status,
        effects,
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn set_commit(
    rec: &mut MintRecord,
    tx_id: &str,
    output_index: i32,
    output_value: i64,
    now: DateTime<Utc>,
) {
    rec.commit_tx_id = Some(tx_id.to_string());
    rec.commit_output_index = Some(output_index);
    rec.commit_output_value = Some(output_value);
    rec.commit_broadcast_at = Some(now);
    rec.commit_confirmations = 0;
}

fn confirm_commit(rec: &mut MintRecord, now: DateTime<Utc>) {
    rec.commit_confirmed_at = Some(now);
    rec.commit_confirmations = rec.commit_confirmations.max(1);
    rec.status = MintStatus::CommitConfirmed;
}

fn set_reveal(rec: &mut MintRecord, tx_id: &str, now: DateTime<Utc>) {
    rec.reveal_tx_id = Some(tx_id.to_string());
    rec.reveal_broadcast_at = Some(now);
    rec.reveal_confirmations = 0;
}

fn clear_stuck(rec: &mut MintRecord) {
    rec.stuck_since = None;
    rec.stuck_tx_kind = None;
}

fn count_once(rec: &mut MintRecord, effects: &mut SettlementEffects) {
    if !rec.phase_counted && rec.is_countable() {
        rec.phase_counted = true;
        effects.count_toward_phase = true;
    }
}

fn complete(
    rec: &mut MintRecord,
    inscription_id: Option<String>,
    now: DateTime<Utc>,
    effects: &mut SettlementEffects,
) {
    if inscription_id.is_some() {
        rec.inscription_id = inscription_id;
    }
    rec.reveal_confirmed_at = Some(now);
    rec.reveal_confirmations = rec.reveal_confirmations.max(1);
    clear_stuck(rec);
    rec.status = MintStatus::Completed;
    effects.claim_asset = true;
    effects.complete_reservation = true;
    count_once(rec, effects);
}

fn fail(rec: &mut MintRecord, reason: &str, code: &str, effects: &mut SettlementEffects) {
    rec.error_message = Some(reason.to_string());
    rec.error_code = Some(code.to_string());
    clear_stuck(rec);
    rec.status = MintStatus::Failed;
    effects.closes_stuck = true;
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
