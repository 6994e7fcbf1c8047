use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use optionsdesk_acquisition::{
    models::{DataRequest, DataRequestKind, FailureRecord, FallbackRecord},
    registry::FailureSummary,
    AcquireOptions, Acquisition, DiagnosticsReport,
};
use serde::{Deserialize, Serialize};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    config::Config,
    error::{ApiError, ApiResult},
    main_lib::AppState,
};

const DEFAULT_RECORD_LIMIT: usize = 50;

pub async fn healthz() -> &'static str {
    "ok"
}

async fn acquire(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DataRequest>,
) -> ApiResult<Json<Acquisition>> {
    let needs_symbol = matches!(
        request.kind,
        DataRequestKind::Quote | DataRequestKind::Historical | DataRequestKind::OptionChain
    );
    if needs_symbol && request.symbol.as_deref().map_or(true, |s| s.trim().is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "{} requests need a symbol",
            request.kind
        )));
    }
    if request.kind == DataRequestKind::OptionGreeks && request.contract.is_none() {
        return Err(ApiError::BadRequest(
            "option_greeks requests need a contract".to_string(),
        ));
    }
    let options = AcquireOptions::with_timeout(state.acquire_timeout);
    let acquisition = state.orchestrator.acquire_with(&request, options).await;
    Ok(Json(acquisition))
}

async fn diagnostics(State(state): State<Arc<AppState>>) -> ApiResult<Json<DiagnosticsReport>> {
    Ok(Json(state.orchestrator.diagnostics().await))
}

async fn priorities(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<BTreeMap<DataRequestKind, Vec<String>>>> {
    let chains = DataRequestKind::ALL
        .iter()
        .map(|kind| (*kind, state.orchestrator.priorities(*kind).to_vec()))
        .collect();
    Ok(Json(chains))
}

async fn failure_summary(State(state): State<Arc<AppState>>) -> ApiResult<Json<FailureSummary>> {
    Ok(Json(state.orchestrator.failures().summarize()))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn provider_failures(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<FailureRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_RECORD_LIMIT);
    Ok(Json(state.orchestrator.failures().recent(&provider, limit)))
}

async fn fallbacks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<FallbackRecord>>> {
    let records = state.orchestrator.failures().fallback_records();
    let skip = records
        .len()
        .saturating_sub(query.limit.unwrap_or(DEFAULT_RECORD_LIMIT));
    Ok(Json(records.into_iter().skip(skip).collect()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PruneResponse {
    removed: usize,
}

async fn prune_failures(State(state): State<Arc<AppState>>) -> ApiResult<Json<PruneResponse>> {
    let removed = state.orchestrator.failures().prune();
    tracing::info!("Pruned {} failure and fallback records", removed);
    Ok(Json(PruneResponse { removed }))
}

async fn prune_cache(State(state): State<Arc<AppState>>) -> ApiResult<Json<PruneResponse>> {
    let removed = state.orchestrator.prune_expired();
    tracing::info!("Pruned {} expired cache entries and observed inputs", removed);
    Ok(Json(PruneResponse { removed }))
}

pub fn app_router(state: Arc<AppState>, config: &Config) -> Router {
    let api = Router::new()
        .route("/healthz", get(healthz))
        .route("/acquire", post(acquire))
        .route("/diagnostics", get(diagnostics))
        .route("/priorities", get(priorities))
        .route("/failures", get(failure_summary))
        .route("/failures/prune", post(prune_failures))
        .route("/cache/prune", post(prune_cache))
        .route("/failures/{provider}", get(provider_failures))
        .route("/fallbacks", get(fallbacks))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
}
