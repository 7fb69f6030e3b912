//! Request and response types for the ordm-daemon HTTP endpoints.
//!
//! `Serialize + Deserialize` so Axum can encode them and tests can decode
//! them. No business logic lives here.

use ordm_schemas::{MintRecord, Reservation, ReservationSelector, StuckTransactionRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    /// "postgres" | "memory"
    pub store: String,
    /// "esplora" | "paper"
    pub oracle: String,
    pub uptime_secs: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx response produced by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine code, e.g. "quota_exceeded".
    pub error: String,
    pub message: String,
    /// Remaining quota, allocation or supply when the error carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

// ---------------------------------------------------------------------------
// /v1/claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelClaimRequest {
    pub wallet: String,
    pub selector: ReservationSelector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelClaimResponse {
    pub cancelled: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteClaimRequest {
    pub reservation_id: Uuid,
    pub wallet: String,
    #[serde(default)]
    pub settlement_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteClaimResponse {
    /// false when there was nothing to complete.
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationsQuery {
    pub wallet: String,
    pub collection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationsResponse {
    pub reservations: Vec<Reservation>,
}

// ---------------------------------------------------------------------------
// /v1/eligibility
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityQuery {
    pub wallet: String,
    pub collection_id: Uuid,
    pub phase_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityResponse {
    pub wallet: String,
    pub phase_id: Uuid,
    /// null when the phase has no per-wallet limit.
    pub remaining: Option<i64>,
    pub minted_count: i64,
    pub max_allowed: Option<i64>,
}

// ---------------------------------------------------------------------------
// /v1/mints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginSettlementResponse {
    /// false when an open record for the reservation already existed.
    pub created: bool,
    pub mint: MintRecord,
}

// ---------------------------------------------------------------------------
// /v1/stuck
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckListResponse {
    pub stuck: Vec<StuckTransactionRecord>,
}

// ---------------------------------------------------------------------------
// /v1/phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecountResponse {
    pub phase_id: Uuid,
    pub minted_count: i64,
    pub entries_updated: u64,
}
