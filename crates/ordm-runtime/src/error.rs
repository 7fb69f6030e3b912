use ordm_db::LedgerError;
use ordm_eligibility::EligibilityError;
use ordm_oracle::OracleError;
use ordm_stuck::ResolutionError;
use thiserror::Error;
use uuid::Uuid;

/// Every failure an inbound engine call can report.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient supply: requested {requested}, available {available}")]
    InsufficientSupply { requested: i64, available: i64 },

    /// Not on the phase allow-list. Distinct from a zero remaining quota.
    #[error("wallet {wallet} is not eligible for phase {phase_id}")]
    NotEligible { wallet: String, phase_id: Uuid },

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

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("confirmation oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("ledger store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    #[error("quantity {requested} outside 1..={max_per_transaction}")]
    InvalidQuantity {
        requested: i64,
        max_per_transaction: i64,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("phase {phase_id} is not open")]
    PhaseClosed { phase_id: Uuid },

    #[error("phase {phase_id} does not belong to collection {collection_id}")]
    PhaseMismatch { phase_id: Uuid, collection_id: Uuid },

    #[error("phase allocation exhausted: {remaining} remaining, requested {requested}")]
    AllocationExhausted { remaining: i64, requested: i64 },
}

impl EngineError {
    /// Stable machine-readable code for API bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InsufficientSupply { .. } => "insufficient_supply",
            EngineError::NotEligible { .. } => "not_eligible",
            EngineError::QuotaExceeded { .. } => "quota_exceeded",
            EngineError::NotFound { .. } => "not_found",
            EngineError::NotOwned { .. } => "not_owned",
            EngineError::InvalidStateTransition(_) => "invalid_state_transition",
            EngineError::OracleUnavailable(_) => "oracle_unavailable",
            EngineError::StoreUnavailable(_) => "store_unavailable",
            EngineError::InvalidQuantity { .. } => "invalid_quantity",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::PhaseClosed { .. } => "phase_closed",
            EngineError::PhaseMismatch { .. } => "phase_mismatch",
            EngineError::AllocationExhausted { .. } => "allocation_exhausted",
        }
    }

    /// The count a client shows as "you have N left", when the error has one.
    pub fn remaining(&self) -> Option<i64> {
        match self {
            EngineError::QuotaExceeded { remaining, .. }
            | EngineError::AllocationExhausted { remaining, .. } => Some(*remaining),
            EngineError::InsufficientSupply { available, .. } => Some(*available),
            _ => None,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientSupply {
                requested,
                available,
            } => EngineError::InsufficientSupply {
                requested,
                available,
            },
            LedgerError::QuotaExceeded {
                remaining,
                requested,
                minted,
                max_allowed,
            } => EngineError::QuotaExceeded {
                remaining,
                requested,
                minted,
                max_allowed,
            },
            LedgerError::NotFound { entity, id } => EngineError::NotFound { entity, id },
            LedgerError::NotOwned { reservation_id } => EngineError::NotOwned { reservation_id },
            e @ (LedgerError::ReservationNotLive { .. }
            | LedgerError::StuckClosed { .. }
            | LedgerError::Transition(_)) => EngineError::InvalidStateTransition(e.to_string()),
            LedgerError::Unavailable(e) => EngineError::StoreUnavailable(e),
        }
    }
}

impl From<EligibilityError> for EngineError {
    fn from(e: EligibilityError) -> Self {
        match e {
            EligibilityError::NotOnAllowList { wallet, phase } => EngineError::NotEligible {
                wallet,
                phase_id: phase,
            },
            EligibilityError::QuotaExceeded {
                remaining,
                requested,
                minted,
                max_allowed,
            } => EngineError::QuotaExceeded {
                remaining,
                requested,
                minted,
                max_allowed,
            },
            EligibilityError::InvalidQuantity {
                requested,
                max_per_transaction,
            } => EngineError::InvalidQuantity {
                requested,
                max_per_transaction,
            },
            EligibilityError::PhaseClosed { phase } => EngineError::PhaseClosed { phase_id: phase },
            EligibilityError::AllocationExhausted {
                remaining,
                requested,
            } => EngineError::AllocationExhausted {
                remaining,
                requested,
            },
        }
    }
}

impl From<ResolutionError> for EngineError {
    fn from(e: ResolutionError) -> Self {
        match e {
            ResolutionError::AlreadyClosed { .. } => {
                EngineError::InvalidStateTransition(e.to_string())
            }
            ResolutionError::InvalidFeeRate { .. } | ResolutionError::FeeNotHigher { .. } => {
                EngineError::InvalidRequest(e.to_string())
            }
        }
    }
}

impl From<OracleError> for EngineError {
    fn from(e: OracleError) -> Self {
        EngineError::OracleUnavailable(e.to_string())
    }
}
