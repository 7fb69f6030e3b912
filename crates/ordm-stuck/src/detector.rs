use chrono::{DateTime, Utc};
use ordm_schemas::{MintRecord, MintStatus, TxKind};
use ordm_settlement::{inscription_id_for_reveal, MintEvent};

use crate::{ChainVerdict, InFlightLeg, PendingFlag, StuckPolicy, SweepDecision};

/// The leg awaiting confirmation, if any.
///
/// A `Stuck` record reports the leg it got stuck on so later sweeps can heal it.
pub fn in_flight_leg(rec: &MintRecord) -> Option<InFlightLeg> {
    let tx_kind = match rec.status {
        MintStatus::CommitBroadcast | MintStatus::CommitConfirming => TxKind::Commit,
        MintStatus::RevealBroadcast | MintStatus::RevealConfirming => TxKind::Reveal,
        MintStatus::Stuck => rec.stuck_tx_kind?,
        _ => return None,
    };
    Some(InFlightLeg {
        tx_kind,
        tx_id: rec.tx_id(tx_kind)?.to_string(),
        broadcast_at: rec.broadcast_at(tx_kind)?,
    })
}

/// Broadcasts at or before this instant are stale.
pub fn stale_cutoff(now: DateTime<Utc>, policy: &StuckPolicy) -> DateTime<Utc> {
    now - policy.threshold
}

/// Records the sweep must look at: broadcasts at or before `cutoff` that were
/// never flagged, plus every stuck record (re-checked for a late confirmation).
pub fn is_sweep_candidate(rec: &MintRecord, cutoff: DateTime<Utc>) -> bool {
    if rec.status == MintStatus::Stuck {
        return true;
    }
    if !rec.status.is_awaiting_confirmation() || rec.stuck_since.is_some() {
        return false;
    }
    match in_flight_leg(rec) {
        Some(leg) => leg.broadcast_at <= cutoff,
        None => false,
    }
}

/// Batch order for sweep candidates: unflagged stale broadcasts first, then
/// stuck re-checks, each oldest `updated_at` first.
///
/// A stuck record that stays unconfirmed is never rewritten, so ordering on
/// `updated_at` alone would let open stuck records fill every batch.
pub fn sweep_order_key(rec: &MintRecord) -> (bool, DateTime<Utc>) {
    (rec.status == MintStatus::Stuck, rec.updated_at)
}

/// Decide what to do with one candidate given the oracle's verdict.
pub fn decide(
    rec: &MintRecord,
    verdict: &ChainVerdict,
    now: DateTime<Utc>,
    policy: &StuckPolicy,
) -> SweepDecision {
    let Some(leg) = in_flight_leg(rec) else {
        return SweepDecision::NotInFlight;
    };

    let fee_rate = match verdict {
        ChainVerdict::Confirmed => {
            let event = match leg.tx_kind {
                TxKind::Commit => MintEvent::CommitConfirmed,
                TxKind::Reveal => MintEvent::RevealConfirmed {
                    inscription_id: rec
                        .inscription_id
                        .clone()
                        .unwrap_or_else(|| inscription_id_for_reveal(&leg.tx_id)),
                },
            };
            return SweepDecision::Heal { event };
        }
        ChainVerdict::Unconfirmed { fee_rate } => *fee_rate,
        ChainVerdict::Unknown => None,
    };

    if rec.status == MintStatus::Stuck {
        return SweepDecision::AlreadyFlagged;
    }
    if leg.broadcast_at > stale_cutoff(now, policy) {
        return SweepDecision::NotStale;
    }

    SweepDecision::Flag(PendingFlag {
        tx_kind: leg.tx_kind,
        elapsed_minutes: (now - leg.broadcast_at).num_minutes(),
        tx_id: leg.tx_id,
        fee_rate,
    })
}
