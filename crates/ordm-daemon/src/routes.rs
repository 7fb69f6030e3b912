//! Axum router and HTTP handlers for ordm-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Every handler is a thin shim over one [`MintEngine`]
//! call; engine errors become JSON bodies through [`ApiError`].
//!
//! [`MintEngine`]: ordm_runtime::MintEngine

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use ordm_runtime::{ClaimRequest, EngineError, EventOutcome, StuckResolution};
use ordm_schemas::{MintRecord, NewMint};
use ordm_settlement::MintEvent;
use ordm_stuck::{ResolutionAction, SweepReport};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    api_types::{
        BeginSettlementResponse, CancelClaimRequest, CancelClaimResponse, ClaimResponse,
        CompleteClaimRequest, CompleteClaimResponse, EligibilityQuery, EligibilityResponse,
        ErrorResponse, HealthResponse, RecountResponse, ReservationsQuery, ReservationsResponse,
        StuckListResponse,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are not applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/stream", get(stream))
        .route("/v1/claims", post(claim))
        .route("/v1/claims/cancel", post(cancel_claim))
        .route("/v1/claims/complete", post(complete_claim))
        .route("/v1/reservations", get(list_reservations))
        .route("/v1/eligibility", get(eligibility))
        .route("/v1/mints", post(begin_settlement))
        .route("/v1/mints/:mint_id", get(get_mint))
        .route("/v1/mints/:mint_id/events", post(record_event))
        .route("/v1/stuck", get(list_stuck))
        .route("/v1/stuck/sweep", post(run_sweep))
        .route("/v1/stuck/:stuck_id/resolve", post(resolve_stuck))
        .route("/v1/phases/:phase_id/recount", post(recount_phase))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Engine failure rendered as `{ error, message, remaining? }`.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::QuotaExceeded { .. }
        | EngineError::InsufficientSupply { .. }
        | EngineError::AllocationExhausted { .. }
        | EngineError::PhaseClosed { .. }
        | EngineError::InvalidStateTransition(_) => StatusCode::CONFLICT,
        EngineError::NotEligible { .. } | EngineError::NotOwned { .. } => StatusCode::FORBIDDEN,
        EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::StoreUnavailable(_) | EngineError::OracleUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::InvalidQuantity { .. }
        | EngineError::InvalidRequest(_)
        | EngineError::PhaseMismatch { .. } => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.code().to_string(),
                message: self.0.to_string(),
                remaining: self.0.remaining(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            store: st.engine.store_backend().to_string(),
            oracle: st.engine.oracle_source().to_string(),
            uptime_secs: uptime_secs(),
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/claims
// ---------------------------------------------------------------------------

pub(crate) async fn claim(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<(StatusCode, Json<ClaimResponse>)> {
    let reservations = st.engine.claim(&req).await?;
    Ok((StatusCode::CREATED, Json(ClaimResponse { reservations })))
}

// ---------------------------------------------------------------------------
// POST /v1/claims/cancel
// ---------------------------------------------------------------------------

pub(crate) async fn cancel_claim(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CancelClaimRequest>,
) -> ApiResult<Json<CancelClaimResponse>> {
    let cancelled = st.engine.cancel_claim(&req.selector, &req.wallet).await?;
    Ok(Json(CancelClaimResponse { cancelled }))
}

// ---------------------------------------------------------------------------
// POST /v1/claims/complete
// ---------------------------------------------------------------------------

pub(crate) async fn complete_claim(
    State(st): State<Arc<AppState>>,
    Json(req): Json<CompleteClaimRequest>,
) -> ApiResult<Json<CompleteClaimResponse>> {
    let completed = st
        .engine
        .complete_claim(req.reservation_id, &req.wallet, req.settlement_ref.as_deref())
        .await?;
    Ok(Json(CompleteClaimResponse { completed }))
}

// ---------------------------------------------------------------------------
// GET /v1/reservations?wallet=..&collection_id=..
// ---------------------------------------------------------------------------

pub(crate) async fn list_reservations(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ReservationsQuery>,
) -> ApiResult<Json<ReservationsResponse>> {
    let reservations = st
        .engine
        .list_reservations(&q.wallet, q.collection_id)
        .await?;
    Ok(Json(ReservationsResponse { reservations }))
}

// ---------------------------------------------------------------------------
// GET /v1/eligibility?wallet=..&collection_id=..&phase_id=..
// ---------------------------------------------------------------------------

pub(crate) async fn eligibility(
    State(st): State<Arc<AppState>>,
    Query(q): Query<EligibilityQuery>,
) -> ApiResult<Json<EligibilityResponse>> {
    let e = st
        .engine
        .remaining(&q.wallet, q.collection_id, q.phase_id)
        .await?;
    Ok(Json(EligibilityResponse {
        wallet: q.wallet,
        phase_id: q.phase_id,
        remaining: e.remaining,
        minted_count: e.minted_count,
        max_allowed: e.max_allowed,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/mints
// ---------------------------------------------------------------------------

pub(crate) async fn begin_settlement(
    State(st): State<Arc<AppState>>,
    Json(req): Json<NewMint>,
) -> ApiResult<(StatusCode, Json<BeginSettlementResponse>)> {
    let opened = st.engine.begin_settlement(&req).await?;
    let status = if opened.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(BeginSettlementResponse {
            created: opened.created,
            mint: opened.record,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET /v1/mints/:mint_id
// ---------------------------------------------------------------------------

pub(crate) async fn get_mint(
    State(st): State<Arc<AppState>>,
    Path(mint_id): Path<Uuid>,
) -> ApiResult<Json<MintRecord>> {
    Ok(Json(st.engine.get_mint(mint_id).await?))
}

// ---------------------------------------------------------------------------
// POST /v1/mints/:mint_id/events
// ---------------------------------------------------------------------------

/// Body is one tagged [`MintEvent`], e.g.
/// `{"type":"commit_broadcast","tx_id":"..","output_index":0,"output_value":546}`.
/// Ignored and duplicate events still answer 200; the outcome says which.
pub(crate) async fn record_event(
    State(st): State<Arc<AppState>>,
    Path(mint_id): Path<Uuid>,
    Json(event): Json<MintEvent>,
) -> ApiResult<Json<EventOutcome>> {
    Ok(Json(st.engine.record_event(mint_id, event).await?))
}

// ---------------------------------------------------------------------------
// GET /v1/stuck
// ---------------------------------------------------------------------------

pub(crate) async fn list_stuck(
    State(st): State<Arc<AppState>>,
) -> ApiResult<Json<StuckListResponse>> {
    let stuck = st.engine.list_open_stuck().await?;
    Ok(Json(StuckListResponse { stuck }))
}

// ---------------------------------------------------------------------------
// POST /v1/stuck/sweep
// ---------------------------------------------------------------------------

pub(crate) async fn run_sweep(State(st): State<Arc<AppState>>) -> ApiResult<Json<SweepReport>> {
    info!("stuck/sweep requested");
    Ok(Json(st.sweep_once().await?))
}

// ---------------------------------------------------------------------------
// POST /v1/stuck/:stuck_id/resolve
// ---------------------------------------------------------------------------

/// Body is one tagged [`ResolutionAction`], e.g.
/// `{"action":"request_rbf","target_fee_rate":25.0}`.
pub(crate) async fn resolve_stuck(
    State(st): State<Arc<AppState>>,
    Path(stuck_id): Path<Uuid>,
    Json(action): Json<ResolutionAction>,
) -> ApiResult<Json<StuckResolution>> {
    let out = st.engine.resolve_stuck(stuck_id, &action).await?;
    let _ = st.bus.send(BusMsg::LogLine {
        level: "INFO".to_string(),
        msg: format!(
            "stuck {} {} -> {}",
            stuck_id,
            action.name(),
            out.stuck.status.as_str()
        ),
    });
    Ok(Json(out))
}

// ---------------------------------------------------------------------------
// POST /v1/phases/:phase_id/recount
// ---------------------------------------------------------------------------

pub(crate) async fn recount_phase(
    State(st): State<Arc<AppState>>,
    Path(phase_id): Path<Uuid>,
) -> ApiResult<Json<RecountResponse>> {
    let c = st.engine.recount_phase(phase_id).await?;
    Ok(Json(RecountResponse {
        phase_id: c.phase_id,
        minted_count: c.minted_count,
        entries_updated: c.entries_updated,
    }))
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Sweep(_) => "sweep",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outages_map_to_503_and_conflicts_to_409() {
        let down = EngineError::StoreUnavailable(anyhow::anyhow!("pool timed out"));
        assert_eq!(status_for(&down), StatusCode::SERVICE_UNAVAILABLE);
        let oracle = EngineError::OracleUnavailable("timeout".to_string());
        assert_eq!(status_for(&oracle), StatusCode::SERVICE_UNAVAILABLE);
        let closed = EngineError::PhaseClosed {
            phase_id: Uuid::new_v4(),
        };
        assert_eq!(status_for(&closed), StatusCode::CONFLICT);
    }
}
