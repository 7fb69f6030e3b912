//! Stuck-transaction sweep and operator resolution.
//!
//! One sweep examines at most `batch_limit` candidates. A failure on one
//! candidate (oracle or store) is counted in the [`SweepReport`] and the sweep
//! moves on; only failing to list candidates fails the sweep itself. An
//! oracle outage never causes a flag.

use ordm_db::LedgerError;
use ordm_schemas::{MintRecord, StuckTransactionRecord};
use ordm_stuck::{
    decide, in_flight_leg, plan_resolution, stale_cutoff, PendingFlag, Resolution,
    ResolutionAction, SweepDecision, SweepReport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{EngineError, MintEngine};

/// Stuck record and mint record after a resolution action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckResolution {
    pub stuck: StuckTransactionRecord,
    pub mint: MintRecord,
}

impl MintEngine {
    pub async fn run_stuck_sweep(&self) -> Result<SweepReport, EngineError> {
        let now = self.clock.now();
        let cutoff = stale_cutoff(now, &self.limits.stuck);
        let candidates = self
            .store
            .list_sweep_candidates(cutoff, self.limits.batch_limit)
            .await?;

        let mut report = SweepReport::default();
        // Fetched at most once per sweep, and only when something gets flagged.
        let mut recommended: Option<f64> = None;

        for rec in candidates {
            report.examined += 1;
            let Some(leg) = in_flight_leg(&rec) else {
                continue;
            };

            let verdict = match self.oracle.verdict(&leg.tx_id).await {
                Ok(v) => v,
                Err(e) => {
                    report.oracle_errors += 1;
                    warn!(
                        mint_id = %rec.mint_id,
                        tx_id = %leg.tx_id,
                        error = %e,
                        "confirmation check failed; retry next sweep"
                    );
                    continue;
                }
            };

            match decide(&rec, &verdict, now, &self.limits.stuck) {
                SweepDecision::Heal { event } => {
                    match self.store.apply_mint_event(rec.mint_id, &event, now).await {
                        Ok(update) if update.transition.is_applied() => {
                            report.healed += 1;
                            info!(
                                mint_id = %rec.mint_id,
                                tx_id = %leg.tx_id,
                                from = rec.status.as_str(),
                                to = update.record.status.as_str(),
                                "missed confirmation healed"
                            );
                        }
                        Ok(_) => {}
                        Err(LedgerError::Transition(e)) => {
                            debug!(mint_id = %rec.mint_id, error = %e, "record moved on before heal");
                        }
                        Err(e) => {
                            report.store_errors += 1;
                            error!(mint_id = %rec.mint_id, error = %e, "heal failed");
                        }
                    }
                }
                SweepDecision::Flag(pending) => {
                    let rate = match recommended {
                        Some(r) => r,
                        None => match self.oracle.recommended_fee_rate().await {
                            Ok(r) => {
                                recommended = Some(r);
                                r
                            }
                            Err(e) => {
                                report.oracle_errors += 1;
                                warn!(
                                    mint_id = %rec.mint_id,
                                    error = %e,
                                    "fee recommendation unavailable; not flagging"
                                );
                                continue;
                            }
                        },
                    };
                    self.flag(&rec, pending, rate, &mut report).await;
                }
                SweepDecision::AlreadyFlagged => report.already_flagged += 1,
                SweepDecision::NotStale => report.not_stale += 1,
                SweepDecision::NotInFlight => {}
            }
        }

        info!(
            examined = report.examined,
            flagged = report.flagged,
            healed = report.healed,
            already_flagged = report.already_flagged,
            oracle_errors = report.oracle_errors,
            store_errors = report.store_errors,
            "stuck sweep finished"
        );
        Ok(report)
    }

    async fn flag(
        &self,
        rec: &MintRecord,
        pending: PendingFlag,
        recommended_fee_rate: f64,
        report: &mut SweepReport,
    ) {
        let flag = pending.with_recommendation(recommended_fee_rate);
        match self.store.flag_stuck(rec.mint_id, &flag, self.clock.now()).await {
            Ok(out) if out.created => {
                report.flagged += 1;
                warn!(
                    mint_id = %rec.mint_id,
                    stuck_id = %out.stuck.stuck_id,
                    tx_kind = flag.tx_kind.as_str(),
                    tx_id = %flag.tx_id,
                    elapsed_minutes = flag.elapsed_minutes,
                    fee_rate = ?flag.fee_rate,
                    recommended_fee_rate,
                    "transaction flagged stuck"
                );
            }
            Ok(_) => report.already_flagged += 1,
            Err(LedgerError::Transition(e)) => {
                debug!(mint_id = %rec.mint_id, error = %e, "record moved on before flag");
            }
            Err(e) => {
                report.store_errors += 1;
                error!(mint_id = %rec.mint_id, error = %e, "flag failed");
            }
        }
    }

    /// Apply one administrative action to an open stuck record.
    pub async fn resolve_stuck(
        &self,
        stuck_id: Uuid,
        action: &ResolutionAction,
    ) -> Result<StuckResolution, EngineError> {
        let stuck = self
            .store
            .fetch_stuck(stuck_id)
            .await?
            .ok_or_else(|| EngineError::not_found("stuck transaction", stuck_id))?;

        let resolution = match plan_resolution(&stuck, action) {
            Ok(r) => r,
            Err(e) => {
                warn!(stuck_id = %stuck_id, action = action.name(), error = %e, "resolution refused");
                return Err(e.into());
            }
        };

        let out = match resolution {
            Resolution::Settle(event) => {
                let update = self
                    .store
                    .apply_mint_event(stuck.mint_id, &event, self.clock.now())
                    .await?;
                let stuck = self
                    .store
                    .fetch_stuck(stuck_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("stuck transaction", stuck_id))?;
                StuckResolution {
                    stuck,
                    mint: update.record,
                }
            }
            Resolution::FeeBump {
                status,
                target_fee_rate,
            } => {
                let stuck = self
                    .store
                    .record_fee_bump(stuck_id, status, target_fee_rate)
                    .await?;
                let mint = self.get_mint(stuck.mint_id).await?;
                StuckResolution { stuck, mint }
            }
        };

        info!(
            stuck_id = %stuck_id,
            mint_id = %out.mint.mint_id,
            action = action.name(),
            stuck_status = out.stuck.status.as_str(),
            mint_status = out.mint.status.as_str(),
            "stuck record resolved"
        );
        Ok(out)
    }
}
