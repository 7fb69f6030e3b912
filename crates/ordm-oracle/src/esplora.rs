use std::time::Duration;

use serde::Deserialize;

use crate::{ConfirmationOracle, OracleError, TxStatus};

pub const DEFAULT_BASE_URL: &str = "https://mempool.space/api";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Esplora / mempool.space backed oracle.
#[derive(Debug, Clone)]
pub struct EsploraOracle {
    http: reqwest::Client,
    base_url: reqwest::Url,
}

impl EsploraOracle {
    pub fn new() -> Result<Self, OracleError> {
        Self::new_with_base_url(DEFAULT_BASE_URL.to_string(), DEFAULT_TIMEOUT_MS)
    }

    pub fn new_with_base_url(base_url: String, timeout_ms: u64) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        let base_url = reqwest::Url::parse(&base_url)
            .map_err(|e| OracleError::Transport(format!("invalid base url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(OracleError::Transport(format!(
                "invalid base url {base_url}: not a hierarchical url"
            )));
        }
        Ok(Self { http, base_url })
    }

    /// Base URL with `segments` appended. Each segment is percent-encoded, so a
    /// caller-supplied txid can never add path components or a query.
    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(&self, segments: &[&str]) -> Result<reqwest::Response, OracleError> {
        self.http
            .get(self.url(segments))
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    fee: Option<u64>,
    weight: Option<u64>,
    status: EsploraTxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: f64,
}

async fn api_error(resp: reqwest::Response) -> OracleError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    OracleError::Api { status, message }
}

#[async_trait::async_trait]
impl ConfirmationOracle for EsploraOracle {
    fn source_name(&self) -> &'static str {
        "esplora"
    }

    async fn transaction_status(&self, tx_id: &str) -> Result<TxStatus, OracleError> {
        let resp = self.get(&["tx", tx_id]).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OracleError::NotFound(tx_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let tx: EsploraTx = resp
            .json()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))?;

        tracing::debug!(tx_id, confirmed = tx.status.confirmed, "esplora tx status");
        Ok(TxStatus {
            confirmed: tx.status.confirmed,
            fee_sats: tx.fee,
            // Esplora reports weight units; vsize rounds up.
            vsize: tx.weight.map(|w| w.div_ceil(4)),
            block_height: tx.status.block_height,
        })
    }

    async fn recommended_fee_rate(&self) -> Result<f64, OracleError> {
        let resp = self.get(&["v1", "fees", "recommended"]).await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let fees: RecommendedFees = resp
            .json()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))?;
        Ok(fees.fastest_fee)
    }
}
