use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use server_api::{create_save, fetch_save_set, get_unit, ApiContext};
use shared::{
    domain::UnitId,
    error::{ApiError, ErrorCode},
    protocol::{CreateSaveRequest, Save, SaveSet, UnitOfWork},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

/// Slack on top of the document limit for the JSON envelope.
const REQUEST_ENVELOPE_BYTES: usize = 16 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        max_document_bytes: settings.max_document_bytes,
    };

    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .api
        .max_document_bytes
        .saturating_add(REQUEST_ENVELOPE_BYTES);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/units/:unit_id", get(http_get_unit))
        .route(
            "/units/:unit_id/saves",
            get(http_fetch_save_set).post(http_create_save),
        )
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|err| {
            error!("healthz: storage check failed: {err}");
            StatusCode::SERVICE_UNAVAILABLE
        })?;
    Ok("ok")
}

async fn http_get_unit(
    State(state): State<Arc<AppState>>,
    Path(unit_id): Path<i64>,
) -> ApiResult<UnitOfWork> {
    get_unit(&state.api, UnitId(unit_id))
        .await
        .map(Json)
        .map_err(into_response_error)
}

async fn http_fetch_save_set(
    State(state): State<Arc<AppState>>,
    Path(unit_id): Path<i64>,
) -> ApiResult<SaveSet> {
    fetch_save_set(&state.api, UnitId(unit_id))
        .await
        .map(Json)
        .map_err(into_response_error)
}

async fn http_create_save(
    State(state): State<Arc<AppState>>,
    Path(unit_id): Path<i64>,
    Json(req): Json<CreateSaveRequest>,
) -> ApiResult<Save> {
    create_save(&state.api, UnitId(unit_id), &req.workspace)
        .await
        .map(Json)
        .map_err(into_response_error)
}

fn into_response_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("api: request failed code={:?} message={}", err.code, err.message);
    }
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
