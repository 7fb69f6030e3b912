//! ordm-db
//!
//! Ledger store for assets, reservations, phases, allow-lists, mint records
//! and stuck-transaction records.
//!
//! Every guarded unit (lease, settlement transition plus its side effects,
//! stuck flag) is one atomic operation on the [`LedgerStore`] trait:
//! - [`PgLedger`]: one Postgres transaction per unit, candidate assets chosen
//!   with `FOR UPDATE SKIP LOCKED`, a partial unique index as the last line
//!   against two live reservations for one asset.
//! - [`MemoryLedger`]: one async mutex owning every table; each operation runs
//!   entirely under the lock.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod memory;
mod pg;
mod store;

pub use memory::MemoryLedger;
pub use pg::PgLedger;
pub use store::{
    CancelOutcome, FlagOutcome, LeaseRequest, LedgerError, LedgerStore, MintUpdate, OpenedMint,
    PhaseCounts,
};

pub const ENV_DB_URL: &str = "ORDM_DATABASE_URL";

/// Connect to Postgres using ORDM_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_ledger_tables: bool,
}

/// Connectivity plus schema presence.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'mint_records'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_ledger_tables: exists,
    })
}
