//! Command handler modules for the ordm CLI.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod stuck;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ordm_config::{
    load_layered_yaml, report_unused_keys, ConfigSurface, EngineConfig, UnusedKeyPolicy,
};
use ordm_db::{LedgerStore, PgLedger};
use ordm_oracle::{ConfirmationOracle, EsploraOracle};
use ordm_runtime::{Limits, MintEngine};
use ordm_stuck::ResolutionAction;
use tracing::warn;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Load layered config for a CLI command. Unused keys are reported, not fatal.
pub fn load_engine_config(paths: &[String]) -> Result<EngineConfig> {
    if paths.is_empty() {
        return Ok(EngineConfig::default());
    }
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&refs)?;
    let unused = report_unused_keys(ConfigSurface::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !unused.is_clean() {
        warn!(keys = ?unused.unused_leaf_pointers, "CONFIG_UNUSED_KEYS");
    }
    EngineConfig::from_loaded(&loaded)
}

/// Engine over the Postgres ledger (ORDM_DATABASE_URL) and the configured
/// Esplora indexer.
pub async fn engine_from_env(cfg: &EngineConfig) -> Result<MintEngine> {
    let pool = ordm_db::connect_from_env().await?;
    let store: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(pool));
    let oracle: Arc<dyn ConfirmationOracle> = Arc::new(
        EsploraOracle::new_with_base_url(cfg.oracle.base_url.clone(), cfg.oracle.timeout_ms)
            .context("oracle client init failed")?,
    );
    Ok(MintEngine::new(store, oracle, Limits::from_config(cfg)))
}

/// Parse a CLI `--action` string into a [`ResolutionAction`].
pub fn parse_action(action: &str, target_fee_rate: Option<f64>) -> Result<ResolutionAction> {
    let fee = |name: &str| {
        target_fee_rate.with_context(|| format!("--target-fee-rate is required for {name}"))
    };
    match action.trim().to_lowercase().replace('-', "_").as_str() {
        "mark_resolved" => Ok(ResolutionAction::MarkResolved),
        "abandon" => Ok(ResolutionAction::Abandon),
        "rbf" | "request_rbf" => Ok(ResolutionAction::RequestRbf {
            target_fee_rate: fee("rbf")?,
        }),
        "cpfp" | "request_cpfp" => Ok(ResolutionAction::RequestCpfp {
            target_fee_rate: fee("cpfp")?,
        }),
        other => bail!(
            "invalid --action '{}'. expected one of: mark-resolved | abandon | rbf | cpfp",
            other
        ),
    }
}
