//! ordm-eligibility
//!
//! Pure phase-eligibility calculator. No I/O, no wall clock: callers pass the
//! phase, the allow-list lookup result, the counts, and `now`.
//!
//! Two different definitions of "minted" live here and must stay separate:
//!
//! - [`wallet_remaining`] works on **attempts**: every non-failed,
//!   non-cancelled settlement attempt of the wallet in the phase, including
//!   live reservations that have not reached settlement yet. A wallet cannot
//!   double-claim while its first claim is still settling.
//! - [`allocation_remaining`] works on **reveals**: mints that reached the
//!   reveal stage (the materialized phase counter).

use chrono::{DateTime, Utc};
use ordm_schemas::{AllowListEntry, Phase};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EligibilityError {
    #[error("wallet {wallet} is not on the allow-list for phase {phase}")]
    NotOnAllowList { wallet: String, phase: Uuid },

    #[error("{remaining} remaining, requested {requested}")]
    QuotaExceeded {
        remaining: i64,
        requested: i64,
        minted: i64,
        max_allowed: i64,
    },

    #[error("quantity {requested} outside 1..={max_per_transaction}")]
    InvalidQuantity {
        requested: i64,
        max_per_transaction: i64,
    },

    #[error("phase {phase} is not open")]
    PhaseClosed { phase: Uuid },

    #[error("phase allocation exhausted: {remaining} remaining, requested {requested}")]
    AllocationExhausted { remaining: i64, requested: i64 },
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Allow-list standing of a wallet for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    /// Public phase: no allow-list attached.
    NotRequired,
    Listed,
    NotListed,
}

impl Membership {
    /// Derive membership from the phase and the result of the allow-list
    /// lookup for the wallet. Only presence matters; the entry's own
    /// `allocation` is not a limit.
    pub fn for_phase(phase: &Phase, entry: Option<&AllowListEntry>) -> Self {
        match (phase.allow_list_id, entry) {
            (None, _) => Membership::NotRequired,
            (Some(list), Some(e)) if e.allow_list_id == list => Membership::Listed,
            (Some(_), _) => Membership::NotListed,
        }
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

/// How much more a wallet may claim in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eligibility {
    /// `max(0, max_allowed - minted_count)`; `None` when the phase sets no
    /// per-wallet limit.
    pub remaining: Option<i64>,
    /// Non-failed, non-cancelled attempts, pending ones included.
    pub minted_count: i64,
    pub max_allowed: Option<i64>,
}

impl Eligibility {
    /// Largest quantity a single request may ask for right now.
    pub fn request_ceiling(&self, max_per_transaction: i64) -> i64 {
        match self.remaining {
            Some(r) => r.min(max_per_transaction),
            None => max_per_transaction,
        }
    }
}

/// Compute the wallet's remaining quota from its attempt count.
///
/// # Errors
/// [`EligibilityError::NotOnAllowList`] when the phase has an allow-list and
/// the wallet is not on it. This is distinct from a zero remaining quota.
pub fn wallet_remaining(
    phase: &Phase,
    membership: Membership,
    wallet: &str,
    attempts: i64,
) -> Result<Eligibility, EligibilityError> {
    if membership == Membership::NotListed {
        return Err(EligibilityError::NotOnAllowList {
            wallet: wallet.to_string(),
            phase: phase.phase_id,
        });
    }

    let minted_count = attempts.max(0);
    let remaining = phase
        .max_per_wallet
        .map(|max| (max - minted_count).max(0));

    Ok(Eligibility {
        remaining,
        minted_count,
        max_allowed: phase.max_per_wallet,
    })
}

/// Bounds check against the global per-transaction ceiling.
pub fn validate_quantity(requested: i64, max_per_transaction: i64) -> Result<(), EligibilityError> {
    if requested < 1 || requested > max_per_transaction {
        return Err(EligibilityError::InvalidQuantity {
            requested,
            max_per_transaction,
        });
    }
    Ok(())
}

/// Validate one request against the wallet's eligibility.
///
/// # Errors
/// [`EligibilityError::InvalidQuantity`] outside `1..=max_per_transaction`,
/// [`EligibilityError::QuotaExceeded`] with the exact remaining count
/// otherwise.
pub fn validate_request(
    eligibility: &Eligibility,
    requested: i64,
    max_per_transaction: i64,
) -> Result<(), EligibilityError> {
    validate_quantity(requested, max_per_transaction)?;

    if let (Some(remaining), Some(max_allowed)) = (eligibility.remaining, eligibility.max_allowed)
    {
        if requested > remaining {
            return Err(EligibilityError::QuotaExceeded {
                remaining,
                requested,
                minted: eligibility.minted_count,
                max_allowed,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Phase gating
// ---------------------------------------------------------------------------

pub fn ensure_open(phase: &Phase, now: DateTime<Utc>) -> Result<(), EligibilityError> {
    if phase.is_open(now) {
        Ok(())
    } else {
        Err(EligibilityError::PhaseClosed {
            phase: phase.phase_id,
        })
    }
}

/// Remaining phase allocation measured in reveals. `None` = unlimited.
pub fn allocation_remaining(phase: &Phase, revealed: i64) -> Option<i64> {
    phase
        .total_allocation
        .map(|total| (total - revealed.max(0)).max(0))
}

pub fn validate_allocation(
    phase: &Phase,
    revealed: i64,
    requested: i64,
) -> Result<(), EligibilityError> {
    match allocation_remaining(phase, revealed) {
        Some(remaining) if requested > remaining => Err(EligibilityError::AllocationExhausted {
            remaining,
            requested,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn phase(max_per_wallet: Option<i64>, allow_list_id: Option<Uuid>) -> Phase {
        let now = Utc::now();
        Phase {
            phase_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            name: "presale".to_string(),
            starts_at: now - Duration::minutes(5),
            ends_at: None,
            price_sats: 50_000,
            max_per_wallet,
            total_allocation: None,
            allow_list_id,
            is_completed: false,
            minted_count: 0,
        }
    }

    #[test]
    fn remaining_is_clamped_at_zero() {
        let p = phase(Some(2), None);
        let e = wallet_remaining(&p, Membership::NotRequired, "w", 5).unwrap();
        assert_eq!(e.remaining, Some(0));
        assert_eq!(e.minted_count, 5);
        assert_eq!(e.max_allowed, Some(2));
    }

    #[test]
    fn quota_exceeded_carries_remaining_count() {
        let p = phase(Some(5), None);
        let e = wallet_remaining(&p, Membership::NotRequired, "w", 2).unwrap();
        let err = validate_request(&e, 5, 10).unwrap_err();
        assert_eq!(
            err,
            EligibilityError::QuotaExceeded {
                remaining: 3,
                requested: 5,
                minted: 2,
                max_allowed: 5,
            }
        );
        assert_eq!(err.to_string(), "3 remaining, requested 5");
    }

    #[test]
    fn quota_of_two_with_two_attempts_rejects_one_more() {
        let p = phase(Some(2), None);
        let e = wallet_remaining(&p, Membership::NotRequired, "w", 2).unwrap();
        match validate_request(&e, 1, 10) {
            Err(EligibilityError::QuotaExceeded { remaining, .. }) => assert_eq!(remaining, 0),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
    }

    #[test]
    fn unlimited_wallet_still_bound_by_transaction_ceiling() {
        let p = phase(None, None);
        let e = wallet_remaining(&p, Membership::NotRequired, "w", 40).unwrap();
        assert_eq!(e.remaining, None);
        assert_eq!(e.request_ceiling(10), 10);
        assert!(validate_request(&e, 10, 10).is_ok());
        assert!(matches!(
            validate_request(&e, 11, 10),
            Err(EligibilityError::InvalidQuantity { .. })
        ));
        assert!(matches!(
            validate_request(&e, 0, 10),
            Err(EligibilityError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn allow_list_membership_gates_and_phase_limit_applies() {
        let list = Uuid::new_v4();
        let p = phase(Some(1), Some(list));

        assert_eq!(Membership::for_phase(&p, None), Membership::NotListed);
        let err = wallet_remaining(&p, Membership::NotListed, "bc1qstranger", 0).unwrap_err();
        assert!(matches!(err, EligibilityError::NotOnAllowList { .. }));

        // The entry's own allocation (5) is not the limit; the phase's (1) is.
        let entry = AllowListEntry {
            allow_list_id: list,
            wallet: "bc1qfriend".to_string(),
            allocation: 5,
            minted_count: 0,
        };
        let m = Membership::for_phase(&p, Some(&entry));
        assert_eq!(m, Membership::Listed);
        let e = wallet_remaining(&p, m, "bc1qfriend", 0).unwrap();
        assert_eq!(e.remaining, Some(1));
        assert!(validate_request(&e, 2, 10).is_err());
    }

    #[test]
    fn entry_from_another_list_is_not_membership() {
        let p = phase(Some(1), Some(Uuid::new_v4()));
        let entry = AllowListEntry {
            allow_list_id: Uuid::new_v4(),
            wallet: "w".to_string(),
            allocation: 1,
            minted_count: 0,
        };
        assert_eq!(Membership::for_phase(&p, Some(&entry)), Membership::NotListed);
    }

    #[test]
    fn allocation_counts_reveals_only() {
        let mut p = phase(None, None);
        assert_eq!(allocation_remaining(&p, 100), None);

        p.total_allocation = Some(10);
        assert_eq!(allocation_remaining(&p, 7), Some(3));
        assert!(validate_allocation(&p, 7, 3).is_ok());
        assert_eq!(
            validate_allocation(&p, 7, 4),
            Err(EligibilityError::AllocationExhausted {
                remaining: 3,
                requested: 4
            })
        );
    }

    #[test]
    fn closed_phase_is_rejected() {
        let mut p = phase(None, None);
        let now = Utc::now();
        assert!(ensure_open(&p, now).is_ok());
        p.ends_at = Some(now - Duration::seconds(1));
        assert!(matches!(
            ensure_open(&p, now),
            Err(EligibilityError::PhaseClosed { .. })
        ));
    }
}
