use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::{ConfirmationOracle, OracleError, TxStatus};

/// Deterministic in-memory oracle.
///
/// - Unknown tx ids answer [`OracleError::NotFound`].
/// - `set_unavailable(true)` makes every call fail with
///   [`OracleError::Unavailable`].
#[derive(Debug)]
pub struct PaperOracle {
    inner: RwLock<PaperState>,
}

#[derive(Debug)]
struct PaperState {
    txs: BTreeMap<String, TxStatus>,
    recommended_fee_rate: f64,
    unavailable: bool,
}

impl Default for PaperOracle {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl PaperOracle {
    pub fn new(recommended_fee_rate: f64) -> Self {
        Self {
            inner: RwLock::new(PaperState {
                txs: BTreeMap::new(),
                recommended_fee_rate,
                unavailable: false,
            }),
        }
    }

    pub async fn set_unconfirmed(&self, tx_id: &str, fee_rate: Option<f64>) {
        // Represent the rate as fee over a 1000 vB tx.
        let fee_sats = fee_rate.map(|r| (r * 1000.0).round() as u64);
        self.inner.write().await.txs.insert(
            tx_id.to_string(),
            TxStatus {
                confirmed: false,
                fee_sats,
                vsize: fee_sats.map(|_| 1000),
                block_height: None,
            },
        );
    }

    pub async fn set_confirmed(&self, tx_id: &str, block_height: u64) {
        let mut g = self.inner.write().await;
        let entry = g.txs.entry(tx_id.to_string()).or_insert(TxStatus {
            confirmed: true,
            fee_sats: None,
            vsize: None,
            block_height: None,
        });
        entry.confirmed = true;
        entry.block_height = Some(block_height);
    }

    pub async fn forget(&self, tx_id: &str) {
        self.inner.write().await.txs.remove(tx_id);
    }

    pub async fn set_recommended_fee_rate(&self, rate: f64) {
        self.inner.write().await.recommended_fee_rate = rate;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().await.unavailable = unavailable;
    }
}

#[async_trait::async_trait]
impl ConfirmationOracle for PaperOracle {
    fn source_name(&self) -> &'static str {
        "paper"
    }

    async fn transaction_status(&self, tx_id: &str) -> Result<TxStatus, OracleError> {
        let g = self.inner.read().await;
        if g.unavailable {
            return Err(OracleError::Unavailable);
        }
        g.txs
            .get(tx_id)
            .cloned()
            .ok_or_else(|| OracleError::NotFound(tx_id.to_string()))
    }

    async fn recommended_fee_rate(&self) -> Result<f64, OracleError> {
        let g = self.inner.read().await;
        if g.unavailable {
            return Err(OracleError::Unavailable);
        }
        Ok(g.recommended_fee_rate)
    }
}
