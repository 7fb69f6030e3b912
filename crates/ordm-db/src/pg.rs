use anyhow::Context;
use chrono::{DateTime, Utc};
use ordm_schemas::{
    AllowListEntry, Asset, MintRecord, MintStatus, NewMint, Phase, Reservation,
    ReservationSelector, ReservationStatus, StuckFlag, StuckStatus, StuckTransactionRecord,
    TxKind,
};
use ordm_settlement::{apply, MintEvent, SettlementEffects, TransitionError};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::store::{
    CancelOutcome, FlagOutcome, LeaseRequest, LedgerError, LedgerStore, MintUpdate, OpenedMint,
    PhaseCounts,
};

/// Postgres-backed ledger.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Seeding (collection generation and phase setup live outside the engine)
    // -----------------------------------------------------------------------

    pub async fn insert_assets(&self, collection_id: Uuid, n: usize) -> Result<Vec<Uuid>, LedgerError> {
        let ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        sqlx::query(
            r#"
            insert into assets (asset_id, collection_id)
            select unnest($1::uuid[]), $2
            "#,
        )
        .bind(&ids)
        .bind(collection_id)
        .execute(&self.pool)
        .await
        .context("insert_assets failed")?;
        Ok(ids)
    }

    pub async fn insert_phase(&self, p: &Phase) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            insert into phases (
              phase_id, collection_id, name, starts_at, ends_at, price_sats,
              max_per_wallet, total_allocation, allow_list_id, is_completed, minted_count
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(p.phase_id)
        .bind(p.collection_id)
        .bind(&p.name)
        .bind(p.starts_at)
        .bind(p.ends_at)
        .bind(p.price_sats)
        .bind(p.max_per_wallet)
        .bind(p.total_allocation)
        .bind(p.allow_list_id)
        .bind(p.is_completed)
        .bind(p.minted_count)
        .execute(&self.pool)
        .await
        .context("insert_phase failed")?;
        Ok(())
    }

    pub async fn insert_allow_list_entry(&self, e: &AllowListEntry) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            insert into allow_list_entries (allow_list_id, wallet, allocation, minted_count)
            values ($1, $2, $3, $4)
            on conflict (allow_list_id, wallet) do update set allocation = excluded.allocation
            "#,
        )
        .bind(e.allow_list_id)
        .bind(&e.wallet)
        .bind(e.allocation)
        .bind(e.minted_count)
        .execute(&self.pool)
        .await
        .context("insert_allow_list_entry failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn reservation_from_row(row: &PgRow) -> Result<Reservation, LedgerError> {
    Ok(Reservation {
        reservation_id: row.try_get("reservation_id")?,
        asset_id: row.try_get("asset_id")?,
        collection_id: row.try_get("collection_id")?,
        phase_id: row.try_get("phase_id")?,
        wallet: row.try_get("wallet")?,
        status: ReservationStatus::parse(&row.try_get::<String, _>("status")?)?,
        expires_at: row.try_get("expires_at")?,
        settlement_ref: row.try_get("settlement_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

fn phase_from_row(row: &PgRow) -> Result<Phase, LedgerError> {
    Ok(Phase {
        phase_id: row.try_get("phase_id")?,
        collection_id: row.try_get("collection_id")?,
        name: row.try_get("name")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        price_sats: row.try_get("price_sats")?,
        max_per_wallet: row.try_get("max_per_wallet")?,
        total_allocation: row.try_get("total_allocation")?,
        allow_list_id: row.try_get("allow_list_id")?,
        is_completed: row.try_get("is_completed")?,
        minted_count: row.try_get("minted_count")?,
    })
}

fn mint_from_row(row: &PgRow) -> Result<MintRecord, LedgerError> {
    let stuck_tx_kind = row
        .try_get::<Option<String>, _>("stuck_tx_kind")?
        .map(|s| TxKind::parse(&s))
        .transpose()?;

    Ok(MintRecord {
        mint_id: row.try_get("mint_id")?,
        reservation_id: row.try_get("reservation_id")?,
        asset_id: row.try_get("asset_id")?,
        collection_id: row.try_get("collection_id")?,
        phase_id: row.try_get("phase_id")?,
        minter_wallet: row.try_get("minter_wallet")?,
        receiving_wallet: row.try_get("receiving_wallet")?,
        status: MintStatus::parse(&row.try_get::<String, _>("status")?)?,
        fee_rate: row.try_get("fee_rate")?,
        commit_tx_id: row.try_get("commit_tx_id")?,
        commit_output_index: row.try_get("commit_output_index")?,
        commit_output_value: row.try_get("commit_output_value")?,
        commit_broadcast_at: row.try_get("commit_broadcast_at")?,
        commit_confirmed_at: row.try_get("commit_confirmed_at")?,
        commit_confirmations: row.try_get("commit_confirmations")?,
        reveal_tx_id: row.try_get("reveal_tx_id")?,
        reveal_broadcast_at: row.try_get("reveal_broadcast_at")?,
        reveal_confirmed_at: row.try_get("reveal_confirmed_at")?,
        reveal_confirmations: row.try_get("reveal_confirmations")?,
        inscription_id: row.try_get("inscription_id")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
        stuck_since: row.try_get("stuck_since")?,
        stuck_tx_kind,
        flagged_for_review: row.try_get("flagged_for_review")?,
        is_test: row.try_get("is_test")?,
        is_admin: row.try_get("is_admin")?,
        phase_counted: row.try_get("phase_counted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn stuck_from_row(row: &PgRow) -> Result<StuckTransactionRecord, LedgerError> {
    Ok(StuckTransactionRecord {
        stuck_id: row.try_get("stuck_id")?,
        mint_id: row.try_get("mint_id")?,
        tx_kind: TxKind::parse(&row.try_get::<String, _>("tx_kind")?)?,
        tx_id: row.try_get("tx_id")?,
        detected_at: row.try_get("detected_at")?,
        elapsed_minutes: row.try_get("elapsed_minutes")?,
        fee_rate: row.try_get("fee_rate")?,
        recommended_fee_rate: row.try_get("recommended_fee_rate")?,
        target_fee_rate: row.try_get("target_fee_rate")?,
        status: StuckStatus::parse(&row.try_get::<String, _>("status")?)?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

// ---------------------------------------------------------------------------
// Statement helpers (run inside a caller-owned transaction)
// ---------------------------------------------------------------------------

const HOLDING_MINT: &str = "(m.status not in ('failed','refunded','cancelled') or m.flagged_for_review)";

async fn count_attempts(
    conn: &mut PgConnection,
    wallet: &str,
    phase_id: Uuid,
    now: DateTime<Utc>,
) -> Result<i64, LedgerError> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select (
          (select count(*) from mint_records m
            where m.phase_id = $2 and m.minter_wallet = $1
              and not m.is_test and not m.is_admin
              and m.status not in ('failed','refunded','cancelled'))
          +
          (select count(*) from reservations r
            where r.phase_id = $2 and r.wallet = $1
              and ((r.status = 'reserved' and r.expires_at > $3) or r.status = 'completed')
              and not exists (select 1 from mint_records m where m.reservation_id = r.reservation_id))
        )::bigint
        "#,
    )
    .bind(wallet)
    .bind(phase_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .context("count_attempts failed")?;
    Ok(n)
}

/// Lock one random selectable asset, skipping rows other leases hold.
async fn pick_candidate(
    conn: &mut PgConnection,
    collection_id: Uuid,
    tried: &[Uuid],
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, LedgerError> {
    let sql = format!(
        r#"
        select a.asset_id
        from assets a
        where a.collection_id = $1
          and not a.is_claimed
          and a.asset_id <> all($2)
          and not exists (
            select 1 from reservations r
            where r.asset_id = a.asset_id and r.status = 'reserved' and r.expires_at > $3)
          and not exists (
            select 1 from mint_records m where m.asset_id = a.asset_id and {HOLDING_MINT})
        order by random()
        limit 1
        for update of a skip locked
        "#
    );
    let row = sqlx::query(&sql)
        .bind(collection_id)
        .bind(tried)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .context("pick_candidate failed")?;
    Ok(row.map(|r| r.try_get("asset_id")).transpose()?)
}

/// Lock one named asset if it is selectable right now.
async fn lock_exact(
    conn: &mut PgConnection,
    asset_id: Uuid,
    collection_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, LedgerError> {
    let sql = format!(
        r#"
        select a.asset_id
        from assets a
        where a.asset_id = $1
          and a.collection_id = $2
          and not a.is_claimed
          and not exists (
            select 1 from reservations r
            where r.asset_id = a.asset_id and r.status = 'reserved' and r.expires_at > $3)
          and not exists (
            select 1 from mint_records m where m.asset_id = a.asset_id and {HOLDING_MINT})
        for update of a skip locked
        "#
    );
    let row = sqlx::query(&sql)
        .bind(asset_id)
        .bind(collection_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .context("lock_exact failed")?;
    Ok(row.is_some())
}

/// Insert the lease row. `None` when a concurrent lease won the partial
/// unique index.
async fn insert_reservation(
    conn: &mut PgConnection,
    asset_id: Uuid,
    req: &LeaseRequest,
) -> Result<Option<Reservation>, LedgerError> {
    sqlx::query(
        r#"
        update reservations
        set status = 'expired'
        where asset_id = $1 and status = 'reserved' and expires_at <= $2
        "#,
    )
    .bind(asset_id)
    .bind(req.now)
    .execute(&mut *conn)
    .await
    .context("expire stale lease for asset failed")?;

    let row = sqlx::query(
        r#"
        insert into reservations (
          reservation_id, asset_id, collection_id, phase_id, wallet, status, expires_at, created_at
        ) values ($1, $2, $3, $4, $5, 'reserved', $6, $7)
        on conflict (asset_id) where status = 'reserved' do nothing
        returning *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(asset_id)
    .bind(req.collection_id)
    .bind(req.phase_id)
    .bind(&req.wallet)
    .bind(req.now + req.lease)
    .bind(req.now)
    .fetch_optional(&mut *conn)
    .await
    .context("insert_reservation failed")?;

    row.as_ref().map(reservation_from_row).transpose()
}

async fn lock_mint(conn: &mut PgConnection, mint_id: Uuid) -> Result<MintRecord, LedgerError> {
    let row = sqlx::query("select * from mint_records where mint_id = $1 for update")
        .bind(mint_id)
        .fetch_optional(&mut *conn)
        .await
        .context("lock_mint failed")?
        .ok_or_else(|| LedgerError::not_found("mint", mint_id))?;
    mint_from_row(&row)
}

async fn insert_mint(conn: &mut PgConnection, m: &MintRecord) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        insert into mint_records (
          mint_id, reservation_id, asset_id, collection_id, phase_id, minter_wallet,
          receiving_wallet, status, fee_rate, is_test, is_admin, created_at, updated_at
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(m.mint_id)
    .bind(m.reservation_id)
    .bind(m.asset_id)
    .bind(m.collection_id)
    .bind(m.phase_id)
    .bind(&m.minter_wallet)
    .bind(&m.receiving_wallet)
    .bind(m.status.as_str())
    .bind(m.fee_rate)
    .bind(m.is_test)
    .bind(m.is_admin)
    .bind(m.created_at)
    .bind(m.updated_at)
    .execute(&mut *conn)
    .await
    .context("insert_mint failed")?;
    Ok(())
}

async fn update_mint(conn: &mut PgConnection, m: &MintRecord) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        update mint_records set
          status = $2,
          commit_tx_id = $3,
          commit_output_index = $4,
          commit_output_value = $5,
          commit_broadcast_at = $6,
          commit_confirmed_at = $7,
          commit_confirmations = $8,
          reveal_tx_id = $9,
          reveal_broadcast_at = $10,
          reveal_confirmed_at = $11,
          reveal_confirmations = $12,
          inscription_id = $13,
          error_message = $14,
          error_code = $15,
          stuck_since = $16,
          stuck_tx_kind = $17,
          flagged_for_review = $18,
          phase_counted = $19,
          updated_at = $20
        where mint_id = $1
        "#,
    )
    .bind(m.mint_id)
    .bind(m.status.as_str())
    .bind(&m.commit_tx_id)
    .bind(m.commit_output_index)
    .bind(m.commit_output_value)
    .bind(m.commit_broadcast_at)
    .bind(m.commit_confirmed_at)
    .bind(m.commit_confirmations)
    .bind(&m.reveal_tx_id)
    .bind(m.reveal_broadcast_at)
    .bind(m.reveal_confirmed_at)
    .bind(m.reveal_confirmations)
    .bind(&m.inscription_id)
    .bind(&m.error_message)
    .bind(&m.error_code)
    .bind(m.stuck_since)
    .bind(m.stuck_tx_kind.map(|k| k.as_str()))
    .bind(m.flagged_for_review)
    .bind(m.phase_counted)
    .bind(m.updated_at)
    .execute(&mut *conn)
    .await
    .context("update_mint failed")?;
    Ok(())
}

/// Side effects of a transition, in the same transaction as the record.
async fn commit_effects(
    conn: &mut PgConnection,
    m: &MintRecord,
    effects: SettlementEffects,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    if effects.claim_asset {
        sqlx::query("update assets set is_claimed = true where asset_id = $1 and not is_claimed")
            .bind(m.asset_id)
            .execute(&mut *conn)
            .await
            .context("claim asset failed")?;
    }

    if effects.complete_reservation {
        sqlx::query(
            r#"
            update reservations
            set status = 'completed', settlement_ref = $2
            where reservation_id = $1 and status <> 'completed'
            "#,
        )
        .bind(m.reservation_id)
        .bind(&m.inscription_id)
        .execute(&mut *conn)
        .await
        .context("complete reservation on settlement failed")?;
    }

    if effects.release_asset {
        sqlx::query(
            r#"
            update reservations
            set status = 'expired'
            where reservation_id = $1 and status = 'reserved'
            "#,
        )
        .bind(m.reservation_id)
        .execute(&mut *conn)
        .await
        .context("release reservation failed")?;
    }

    if let (true, Some(phase_id)) = (effects.count_toward_phase, m.phase_id) {
        sqlx::query("update phases set minted_count = minted_count + 1 where phase_id = $1")
            .bind(phase_id)
            .execute(&mut *conn)
            .await
            .context("phase counter increment failed")?;
        sqlx::query(
            r#"
            update allow_list_entries e
            set minted_count = e.minted_count + 1
            from phases p
            where p.phase_id = $1 and e.allow_list_id = p.allow_list_id and e.wallet = $2
            "#,
        )
        .bind(phase_id)
        .bind(&m.minter_wallet)
        .execute(&mut *conn)
        .await
        .context("allow-list counter increment failed")?;
    }

    if let Some(kind) = effects.settled_leg {
        sqlx::query(
            r#"
            update stuck_transactions
            set status = 'resolved', resolved_at = $3
            where mint_id = $1 and tx_kind = $2 and status not in ('resolved','abandoned')
            "#,
        )
        .bind(m.mint_id)
        .bind(kind.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("resolve stuck records failed")?;
    }

    if effects.closes_stuck {
        sqlx::query(
            r#"
            update stuck_transactions
            set status = 'abandoned', resolved_at = $2
            where mint_id = $1 and status not in ('resolved','abandoned')
            "#,
        )
        .bind(m.mint_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("abandon stuck records failed")?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl LedgerStore for PgLedger {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let res = sqlx::query(
            r#"
            update reservations
            set status = 'expired'
            where status = 'reserved' and expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("release_expired failed")?;
        Ok(res.rows_affected())
    }

    async fn lease_assets(&self, req: &LeaseRequest) -> Result<Vec<Reservation>, LedgerError> {
        let mut tx = self.pool.begin().await.context("lease begin failed")?;

        if let (Some(max_allowed), Some(phase_id)) = (req.quota, req.phase_id) {
            // Serializes concurrent claims of one wallet in one phase.
            sqlx::query("select pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("{}:{}", req.wallet, phase_id))
                .execute(&mut *tx)
                .await
                .context("quota lock failed")?;

            let minted = count_attempts(&mut tx, &req.wallet, phase_id, req.now).await?;
            let remaining = (max_allowed - minted).max(0);
            if req.quantity > remaining {
                tx.rollback().await.context("lease rollback failed")?;
                debug!(
                    wallet = %req.wallet,
                    phase_id = %phase_id,
                    minted,
                    max_allowed,
                    requested = req.quantity,
                    "quota re-check under lock refused lease"
                );
                return Err(LedgerError::QuotaExceeded {
                    remaining,
                    requested: req.quantity,
                    minted,
                    max_allowed,
                });
            }
        }

        let mut leased: Vec<Reservation> = Vec::new();
        match &req.specific_asset_ids {
            Some(ids) => {
                let mut seen: Vec<Uuid> = Vec::with_capacity(ids.len());
                for id in ids {
                    if seen.contains(id) {
                        continue;
                    }
                    seen.push(*id);
                    if !lock_exact(&mut tx, *id, req.collection_id, req.now).await? {
                        break;
                    }
                    match insert_reservation(&mut tx, *id, req).await? {
                        Some(r) => leased.push(r),
                        None => break,
                    }
                }
            }
            None => {
                let mut tried: Vec<Uuid> = Vec::new();
                while (leased.len() as i64) < req.quantity {
                    let Some(asset_id) =
                        pick_candidate(&mut tx, req.collection_id, &tried, req.now).await?
                    else {
                        break;
                    };
                    tried.push(asset_id);
                    if let Some(r) = insert_reservation(&mut tx, asset_id, req).await? {
                        leased.push(r);
                    }
                }
            }
        }

        if (leased.len() as i64) < req.quantity {
            tx.rollback().await.context("lease rollback failed")?;
            debug!(
                wallet = %req.wallet,
                collection_id = %req.collection_id,
                requested = req.quantity,
                leased = leased.len(),
                "partial lease rolled back"
            );
            return Err(LedgerError::InsufficientSupply {
                requested: req.quantity,
                available: leased.len() as i64,
            });
        }

        tx.commit().await.context("lease commit failed")?;
        Ok(leased)
    }

    async fn cancel_reservations(
        &self,
        selector: &ReservationSelector,
        wallet: &str,
    ) -> Result<CancelOutcome, LedgerError> {
        let mut tx = self.pool.begin().await.context("cancel begin failed")?;

        let rows = match selector {
            ReservationSelector::Reservation { reservation_id } => {
                let owner: Option<(String,)> =
                    sqlx::query_as("select wallet from reservations where reservation_id = $1 for update")
                        .bind(reservation_id)
                        .fetch_optional(&mut *tx)
                        .await
                        .context("cancel lookup failed")?;
                match owner {
                    None => return Err(LedgerError::not_found("reservation", reservation_id)),
                    Some((w,)) if w != wallet => {
                        return Err(LedgerError::NotOwned {
                            reservation_id: *reservation_id,
                        })
                    }
                    Some(_) => {}
                }
                sqlx::query(
                    r#"
                    update reservations set status = 'cancelled'
                    where reservation_id = $1 and status = 'reserved'
                    returning reservation_id
                    "#,
                )
                .bind(reservation_id)
                .fetch_all(&mut *tx)
                .await
            }
            ReservationSelector::Asset { asset_id } => {
                sqlx::query(
                    r#"
                    update reservations set status = 'cancelled'
                    where asset_id = $1 and wallet = $2 and status = 'reserved'
                    returning reservation_id
                    "#,
                )
                .bind(asset_id)
                .bind(wallet)
                .fetch_all(&mut *tx)
                .await
            }
            ReservationSelector::AllForWallet { collection_id } => {
                sqlx::query(
                    r#"
                    update reservations set status = 'cancelled'
                    where collection_id = $1 and wallet = $2 and status = 'reserved'
                    returning reservation_id
                    "#,
                )
                .bind(collection_id)
                .bind(wallet)
                .fetch_all(&mut *tx)
                .await
            }
        }
        .context("cancel update failed")?;

        tx.commit().await.context("cancel commit failed")?;

        let cancelled = rows
            .iter()
            .map(|r| r.try_get("reservation_id"))
            .collect::<Result<Vec<Uuid>, _>>()?;
        Ok(CancelOutcome { cancelled })
    }

    async fn complete_reservation(
        &self,
        reservation_id: Uuid,
        wallet: &str,
        settlement_ref: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let res = sqlx::query(
            r#"
            update reservations
            set status = 'completed', settlement_ref = $3
            where reservation_id = $1 and wallet = $2 and status = 'reserved'
            "#,
        )
        .bind(reservation_id)
        .bind(wallet)
        .bind(settlement_ref)
        .execute(&self.pool)
        .await
        .context("complete_reservation failed")?;
        Ok(res.rows_affected() == 1)
    }

    async fn fetch_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<Option<Reservation>, LedgerError> {
        let row = sqlx::query("select * from reservations where reservation_id = $1")
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_reservation failed")?;
        row.as_ref().map(reservation_from_row).transpose()
    }

    async fn list_reservations(
        &self,
        wallet: &str,
        collection_id: Uuid,
    ) -> Result<Vec<Reservation>, LedgerError> {
        let rows = sqlx::query(
            r#"
            select * from reservations
            where wallet = $1 and collection_id = $2
            order by created_at asc
            "#,
        )
        .bind(wallet)
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await
        .context("list_reservations failed")?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn fetch_asset(&self, asset_id: Uuid) -> Result<Option<Asset>, LedgerError> {
        let row: Option<(Uuid, Uuid, bool)> = sqlx::query_as(
            "select asset_id, collection_id, is_claimed from assets where asset_id = $1",
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_asset failed")?;
        Ok(row.map(|(asset_id, collection_id, is_claimed)| Asset {
            asset_id,
            collection_id,
            is_claimed,
        }))
    }

    async fn fetch_phase(&self, phase_id: Uuid) -> Result<Option<Phase>, LedgerError> {
        let row = sqlx::query("select * from phases where phase_id = $1")
            .bind(phase_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_phase failed")?;
        row.as_ref().map(phase_from_row).transpose()
    }

    async fn allow_list_entry(
        &self,
        allow_list_id: Uuid,
        wallet: &str,
    ) -> Result<Option<AllowListEntry>, LedgerError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            select allocation, minted_count
            from allow_list_entries
            where allow_list_id = $1 and wallet = $2
            "#,
        )
        .bind(allow_list_id)
        .bind(wallet)
        .fetch_optional(&self.pool)
        .await
        .context("allow_list_entry failed")?;
        Ok(row.map(|(allocation, minted_count)| AllowListEntry {
            allow_list_id,
            wallet: wallet.to_string(),
            allocation,
            minted_count,
        }))
    }

    async fn count_wallet_attempts(
        &self,
        wallet: &str,
        phase_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, LedgerError> {
        let mut conn = self.pool.acquire().await.context("acquire failed")?;
        count_attempts(&mut conn, wallet, phase_id, now).await
    }

    async fn open_mint(&self, new: &NewMint, now: DateTime<Utc>) -> Result<OpenedMint, LedgerError> {
        let mut tx = self.pool.begin().await.context("open_mint begin failed")?;

        let row = sqlx::query("select * from reservations where reservation_id = $1 for update")
            .bind(new.reservation_id)
            .fetch_optional(&mut *tx)
            .await
            .context("open_mint reservation lookup failed")?
            .ok_or_else(|| LedgerError::not_found("reservation", new.reservation_id))?;
        let reservation = reservation_from_row(&row)?;
        if reservation.wallet != new.wallet {
            return Err(LedgerError::NotOwned {
                reservation_id: reservation.reservation_id,
            });
        }

        let existing = sqlx::query(
            r#"
            select * from mint_records
            where reservation_id = $1 and status not in ('failed','refunded','cancelled')
            "#,
        )
        .bind(reservation.reservation_id)
        .fetch_optional(&mut *tx)
        .await
        .context("open_mint existing lookup failed")?;
        if let Some(row) = existing {
            let record = mint_from_row(&row)?;
            tx.commit().await.context("open_mint commit failed")?;
            return Ok(OpenedMint {
                record,
                created: false,
            });
        }

        if !reservation.is_live(now) {
            return Err(LedgerError::ReservationNotLive {
                reservation_id: reservation.reservation_id,
            });
        }

        let record = MintRecord::pending(new, &reservation, now);
        insert_mint(&mut tx, &record).await?;
        tx.commit().await.context("open_mint commit failed")?;
        Ok(OpenedMint {
            record,
            created: true,
        })
    }

    async fn fetch_mint(&self, mint_id: Uuid) -> Result<Option<MintRecord>, LedgerError> {
        let row = sqlx::query("select * from mint_records where mint_id = $1")
            .bind(mint_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_mint failed")?;
        row.as_ref().map(mint_from_row).transpose()
    }

    async fn apply_mint_event(
        &self,
        mint_id: Uuid,
        event: &MintEvent,
        now: DateTime<Utc>,
    ) -> Result<MintUpdate, LedgerError> {
        let mut tx = self.pool.begin().await.context("apply_mint_event begin failed")?;
        let mut rec = lock_mint(&mut tx, mint_id).await?;

        // An illegal event drops `tx`, which rolls back the row lock.
        let transition = apply(&mut rec, event, now)?;
        if transition.is_applied() {
            update_mint(&mut tx, &rec).await?;
            commit_effects(&mut tx, &rec, transition.effects(), now).await?;
        }
        tx.commit().await.context("apply_mint_event commit failed")?;

        Ok(MintUpdate {
            record: rec,
            transition,
        })
    }

    async fn list_sweep_candidates(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<MintRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            select * from mint_records
            where status = 'stuck'
               or (stuck_since is null and (
                    (status in ('commit_broadcast','commit_confirming') and commit_broadcast_at <= $1)
                 or (status in ('reveal_broadcast','reveal_confirming') and reveal_broadcast_at <= $1)))
            order by (status = 'stuck') asc, updated_at asc
            limit $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_sweep_candidates failed")?;
        rows.iter().map(mint_from_row).collect()
    }

    async fn flag_stuck(
        &self,
        mint_id: Uuid,
        flag: &StuckFlag,
        now: DateTime<Utc>,
    ) -> Result<FlagOutcome, LedgerError> {
        let mut tx = self.pool.begin().await.context("flag_stuck begin failed")?;
        let mut rec = lock_mint(&mut tx, mint_id).await?;

        if rec.tx_id(flag.tx_kind) != Some(flag.tx_id.as_str()) {
            return Err(TransitionError {
                from: rec.status,
                event: "flag_stuck".to_string(),
            }
            .into());
        }

        let transition = apply(
            &mut rec,
            &MintEvent::FlagStuck {
                tx_kind: flag.tx_kind,
            },
            now,
        )?;
        if transition.is_applied() {
            update_mint(&mut tx, &rec).await?;
        }

        let fresh = StuckTransactionRecord::detected(mint_id, flag, now);
        let inserted = sqlx::query(
            r#"
            insert into stuck_transactions (
              stuck_id, mint_id, tx_kind, tx_id, detected_at, elapsed_minutes,
              fee_rate, recommended_fee_rate, status
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, 'detected')
            on conflict (mint_id, tx_id) where status not in ('resolved','abandoned') do nothing
            returning *
            "#,
        )
        .bind(fresh.stuck_id)
        .bind(mint_id)
        .bind(flag.tx_kind.as_str())
        .bind(&flag.tx_id)
        .bind(now)
        .bind(flag.elapsed_minutes)
        .bind(flag.fee_rate)
        .bind(flag.recommended_fee_rate)
        .fetch_optional(&mut *tx)
        .await
        .context("insert stuck record failed")?;

        let (stuck, created) = match inserted {
            Some(row) => (stuck_from_row(&row)?, true),
            None => {
                let row = sqlx::query(
                    r#"
                    select * from stuck_transactions
                    where mint_id = $1 and tx_id = $2 and status not in ('resolved','abandoned')
                    "#,
                )
                .bind(mint_id)
                .bind(&flag.tx_id)
                .fetch_one(&mut *tx)
                .await
                .context("existing stuck record lookup failed")?;
                (stuck_from_row(&row)?, false)
            }
        };

        tx.commit().await.context("flag_stuck commit failed")?;
        Ok(FlagOutcome {
            record: rec,
            stuck,
            created,
        })
    }

    async fn fetch_stuck(
        &self,
        stuck_id: Uuid,
    ) -> Result<Option<StuckTransactionRecord>, LedgerError> {
        let row = sqlx::query("select * from stuck_transactions where stuck_id = $1")
            .bind(stuck_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_stuck failed")?;
        row.as_ref().map(stuck_from_row).transpose()
    }

    async fn list_open_stuck(
        &self,
        limit: i64,
    ) -> Result<Vec<StuckTransactionRecord>, LedgerError> {
        let rows = sqlx::query(
            r#"
            select * from stuck_transactions
            where status not in ('resolved','abandoned')
            order by detected_at asc
            limit $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_open_stuck failed")?;
        rows.iter().map(stuck_from_row).collect()
    }

    async fn record_fee_bump(
        &self,
        stuck_id: Uuid,
        status: StuckStatus,
        target_fee_rate: f64,
    ) -> Result<StuckTransactionRecord, LedgerError> {
        let row = sqlx::query(
            r#"
            update stuck_transactions
            set status = $2, target_fee_rate = $3
            where stuck_id = $1 and status not in ('resolved','abandoned')
            returning *
            "#,
        )
        .bind(stuck_id)
        .bind(status.as_str())
        .bind(target_fee_rate)
        .fetch_optional(&self.pool)
        .await
        .context("record_fee_bump failed")?;

        match row {
            Some(row) => stuck_from_row(&row),
            None => match self.fetch_stuck(stuck_id).await? {
                Some(existing) => Err(LedgerError::StuckClosed {
                    stuck_id,
                    status: existing.status,
                }),
                None => Err(LedgerError::not_found("stuck transaction", stuck_id)),
            },
        }
    }

    async fn recount_phase(&self, phase_id: Uuid) -> Result<PhaseCounts, LedgerError> {
        let mut tx = self.pool.begin().await.context("recount begin failed")?;

        let row: Option<(i64, Option<Uuid>)> = sqlx::query_as(
            r#"
            update phases p
            set minted_count = (
              select count(*) from mint_records m
              where m.phase_id = p.phase_id and m.phase_counted)
            where p.phase_id = $1
            returning p.minted_count, p.allow_list_id
            "#,
        )
        .bind(phase_id)
        .fetch_optional(&mut *tx)
        .await
        .context("recount phase failed")?;
        let (minted_count, allow_list_id) =
            row.ok_or_else(|| LedgerError::not_found("phase", phase_id))?;

        let mut entries_updated = 0;
        if let Some(list) = allow_list_id {
            // An allow-list may back several phases; its counter spans all of them.
            let res = sqlx::query(
                r#"
                update allow_list_entries e
                set minted_count = (
                  select count(*) from mint_records m
                  join phases p on p.phase_id = m.phase_id
                  where p.allow_list_id = e.allow_list_id
                    and m.minter_wallet = e.wallet
                    and m.phase_counted)
                where e.allow_list_id = $1
                "#,
            )
            .bind(list)
            .execute(&mut *tx)
            .await
            .context("recount allow-list failed")?;
            entries_updated = res.rows_affected();
        }

        tx.commit().await.context("recount commit failed")?;
        Ok(PhaseCounts {
            phase_id,
            minted_count,
            entries_updated,
        })
    }
}
