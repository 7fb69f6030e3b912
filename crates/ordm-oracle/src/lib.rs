//! ordm-oracle
//!
//! Blockchain confirmation oracle boundary: "is transaction X confirmed?"
//! and "what fee rate is recommended right now?".
//!
//! - [`EsploraOracle`] talks to an Esplora-compatible indexer (mempool.space).
//! - [`PaperOracle`] is a deterministic in-memory double for tests and
//!   paper deployments.
//!
//! Callers treat [`OracleError::NotFound`] as "unconfirmed": an indexer that
//! has never seen a transaction cannot vouch for its confirmation.

mod esplora;
mod paper;

pub use esplora::{EsploraOracle, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_MS};
pub use paper::PaperOracle;

use ordm_stuck::ChainVerdict;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Chain view of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub fee_sats: Option<u64>,
    pub vsize: Option<u64>,
    pub block_height: Option<u64>,
}

impl TxStatus {
    /// Effective fee rate in sats/vB, when both fee and size are known.
    pub fn fee_rate(&self) -> Option<f64> {
        match (self.fee_sats, self.vsize) {
            (Some(fee), Some(vsize)) if vsize > 0 => Some(fee as f64 / vsize as f64),
            _ => None,
        }
    }

    pub fn verdict(&self) -> ChainVerdict {
        if self.confirmed {
            ChainVerdict::Confirmed
        } else {
            ChainVerdict::Unconfirmed {
                fee_rate: self.fee_rate(),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transaction {0} not known to the indexer")]
    NotFound(String),

    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle http error status={status}: {message}")]
    Api { status: u16, message: String },

    #[error("oracle decode error: {0}")]
    Decode(String),

    #[error("oracle unavailable")]
    Unavailable,
}

// ---------------------------------------------------------------------------
// Oracle trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait ConfirmationOracle: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn transaction_status(&self, tx_id: &str) -> Result<TxStatus, OracleError>;

    /// Recommended fee rate (sats/vB) for prompt confirmation.
    async fn recommended_fee_rate(&self) -> Result<f64, OracleError>;

    /// Map the oracle answer onto a sweep verdict. `NotFound` is folded into
    /// [`ChainVerdict::Unknown`]; every other error propagates.
    async fn verdict(&self, tx_id: &str) -> Result<ChainVerdict, OracleError> {
        match self.transaction_status(tx_id).await {
            Ok(st) => Ok(st.verdict()),
            Err(OracleError::NotFound(_)) => Ok(ChainVerdict::Unknown),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_rate_requires_positive_vsize() {
        let mut st = TxStatus {
            confirmed: false,
            fee_sats: Some(1_410),
            vsize: Some(141),
            block_height: None,
        };
        assert_eq!(st.fee_rate(), Some(10.0));
        st.vsize = Some(0);
        assert_eq!(st.fee_rate(), None);
        assert_eq!(st.verdict(), ChainVerdict::Unconfirmed { fee_rate: None });
    }
}
