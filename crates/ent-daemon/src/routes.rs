//! HTTP surface over a running [`ent_runtime::StoreHandle`].
//!
//! Every handler reads or drives the store through its handle; none of them
//! mutates entitlement state directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use ent_runtime::{BusMsg, StoreError};
use ent_schemas::ProductId;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, ProductView, ProductsResponse, PurchaseRequest,
        ReconcileResponse, StatusResponse,
    },
    state::{uptime_secs, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Bare router. CORS and request tracing are layered on in `main`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/products", get(products))
        .route("/v1/purchase", post(purchase))
        .route("/v1/reconcile", post(reconcile))
        .route("/v1/alert/dismiss", post(dismiss_alert))
        .route("/v1/stream", get(stream))
        .with_state(state)
}

fn status_response(st: &AppState) -> StatusResponse {
    StatusResponse {
        daemon_uptime_secs: uptime_secs(),
        config_hash: st.config_hash.clone(),
        provider: st.provider.to_string(),
        store: st.store.status(),
    }
}

fn error_response(code: StatusCode, error: impl ToString) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::Provider(_) => error_response(StatusCode::BAD_GATEWAY, err),
        StoreError::Stopped => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

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
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(status_response(&st)))
}

// ---------------------------------------------------------------------------
// GET /v1/products
// ---------------------------------------------------------------------------

/// Catalog as last published by the store, most expensive first.
pub(crate) async fn products(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let products = st
        .store
        .status()
        .subscriptions
        .iter()
        .map(ProductView::from)
        .collect();
    (StatusCode::OK, Json(ProductsResponse { products }))
}

// ---------------------------------------------------------------------------
// POST /v1/purchase
// ---------------------------------------------------------------------------

/// Always 200 once the attempt ran: failures are reported through
/// `purchase_error_alert` in the returned status.
pub(crate) async fn purchase(
    State(st): State<Arc<AppState>>,
    Json(req): Json<PurchaseRequest>,
) -> Response {
    let product_id = req.product_id.trim();
    if product_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "product_id must not be empty");
    }

    info!(product_id, "purchase requested");
    st.store.purchase(ProductId::new(product_id)).await;
    (StatusCode::OK, Json(status_response(&st))).into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/reconcile
// ---------------------------------------------------------------------------

/// Manual restore: one reconciliation pass on a fresh snapshot.
pub(crate) async fn reconcile(State(st): State<Arc<AppState>>) -> Response {
    match st.store.refresh().await {
        Ok(report) => {
            info!(active = report.has_active_subscription, "manual reconcile");
            (
                StatusCode::OK,
                Json(ReconcileResponse {
                    has_active_subscription: report.has_active_subscription,
                    verified_count: report.verified_count,
                    unverified_count: report.unverified_count,
                    anomalies: report
                        .anomalies
                        .iter()
                        .map(|a| a.kind().to_string())
                        .collect(),
                }),
            )
                .into_response()
        }
        Err(err) => store_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/alert/dismiss
// ---------------------------------------------------------------------------

pub(crate) async fn dismiss_alert(State(st): State<Arc<AppState>>) -> Response {
    match st.store.dismiss_alert().await {
        Ok(()) => (StatusCode::OK, Json(status_response(&st))).into_response(),
        Err(err) => store_error_response(err),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.store.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            // A lagging subscriber skips what it missed.
            Err(_) => None,
        }
    })
}
