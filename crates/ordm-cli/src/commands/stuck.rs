//! Stuck-transaction commands: one-shot sweep, listing, operator resolution.
//!
//! Output is `key=value` lines so scripts can grep it.

use anyhow::Result;
use ordm_runtime::MintEngine;
use ordm_stuck::{ResolutionAction, SweepReport};
use uuid::Uuid;

/// Run exactly one sweep. Errors on individual candidates are reported in the
/// counters; the command fails only if the sweep itself could not run.
pub async fn sweep_once(engine: &MintEngine) -> Result<SweepReport> {
    let report = engine.run_stuck_sweep().await?;
    println!(
        "examined={} flagged={} healed={} already_flagged={} not_stale={}",
        report.examined, report.flagged, report.healed, report.already_flagged, report.not_stale
    );
    println!(
        "oracle_errors={} store_errors={} clean={}",
        report.oracle_errors,
        report.store_errors,
        report.is_clean()
    );
    Ok(report)
}

pub async fn list_open(engine: &MintEngine) -> Result<()> {
    let open = engine.list_open_stuck().await?;
    println!("open_stuck={}", open.len());
    for s in open {
        println!(
            "stuck_id={} mint_id={} tx_kind={} tx_id={} status={} elapsed_minutes={} fee_rate={} recommended_fee_rate={}",
            s.stuck_id,
            s.mint_id,
            s.tx_kind.as_str(),
            s.tx_id,
            s.status.as_str(),
            s.elapsed_minutes,
            fmt_rate(s.fee_rate),
            fmt_rate(s.recommended_fee_rate),
        );
    }
    Ok(())
}

pub async fn resolve(engine: &MintEngine, stuck_id: Uuid, action: &ResolutionAction) -> Result<()> {
    let out = engine.resolve_stuck(stuck_id, action).await?;
    println!(
        "stuck_id={} action={} stuck_status={} mint_id={} mint_status={} target_fee_rate={}",
        out.stuck.stuck_id,
        action.name(),
        out.stuck.status.as_str(),
        out.mint.mint_id,
        out.mint.status.as_str(),
        fmt_rate(out.stuck.target_fee_rate),
    );
    Ok(())
}

fn fmt_rate(rate: Option<f64>) -> String {
    rate.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
}
