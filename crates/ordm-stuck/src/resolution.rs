use ordm_schemas::{StuckStatus, StuckTransactionRecord};
use ordm_settlement::MintEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Administrative action on a stuck record. Invoked individually, never
/// automatically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResolutionAction {
    MarkResolved,
    Abandon,
    RequestRbf { target_fee_rate: f64 },
    RequestCpfp { target_fee_rate: f64 },
}

impl ResolutionAction {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionAction::MarkResolved => "mark_resolved",
            ResolutionAction::Abandon => "abandon",
            ResolutionAction::RequestRbf { .. } => "request_rbf",
            ResolutionAction::RequestCpfp { .. } => "request_cpfp",
        }
    }
}

/// What the store has to commit for an action.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Drive the mint record; the transition's effects close the stuck record.
    Settle(MintEvent),
    /// Record the fee-bump intent. The replacement is broadcast elsewhere.
    FeeBump {
        status: StuckStatus,
        target_fee_rate: f64,
    },
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ResolutionError {
    #[error("stuck record already {}", status.as_str())]
    AlreadyClosed { status: StuckStatus },

    #[error("target fee rate {target} must be positive")]
    InvalidFeeRate { target: f64 },

    #[error("target fee rate {target} does not exceed current {current}")]
    FeeNotHigher { target: f64, current: f64 },
}

pub fn plan_resolution(
    record: &StuckTransactionRecord,
    action: &ResolutionAction,
) -> Result<Resolution, ResolutionError> {
    if record.status.is_terminal() {
        return Err(ResolutionError::AlreadyClosed {
            status: record.status,
        });
    }

    match action {
        ResolutionAction::MarkResolved => Ok(Resolution::Settle(MintEvent::MarkResolved)),
        ResolutionAction::Abandon => Ok(Resolution::Settle(MintEvent::Abandon)),
        ResolutionAction::RequestRbf { target_fee_rate } => {
            fee_bump(record, StuckStatus::RbfSent, *target_fee_rate)
        }
        ResolutionAction::RequestCpfp { target_fee_rate } => {
            fee_bump(record, StuckStatus::CpfpSent, *target_fee_rate)
        }
    }
}

fn fee_bump(
    record: &StuckTransactionRecord,
    status: StuckStatus,
    target: f64,
) -> Result<Resolution, ResolutionError> {
    if !target.is_finite() || target <= 0.0 {
        return Err(ResolutionError::InvalidFeeRate { target });
    }
    // A bump must beat both what the tx pays and any bump already requested.
    let current = record
        .target_fee_rate
        .into_iter()
        .chain(record.fee_rate)
        .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))));
    if let Some(current) = current {
        if target <= current {
            return Err(ResolutionError::FeeNotHigher { target, current });
        }
    }
    Ok(Resolution::FeeBump {
        status,
        target_fee_rate: target,
    })
}
