use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use opsdash_core::BuildKind;
use orchestrator::{AbortOutcome, BuildStatus};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::error::AppError;
use crate::state::AppState;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BuildQuery {
    /// Run the scripted mock pipeline instead of the real toolchain
    #[serde(default)]
    pub mock: bool,
}

#[utoipa::path(
    post,
    path = "/api/build",
    params(BuildQuery),
    responses(
        (status = 200, description = "Build output as newline-delimited JSON", content_type = "application/x-ndjson", body = events::BuildMessage),
        (status = 400, description = "Malformed query", body = crate::error::ErrorResponse),
        (status = 409, description = "A build is already running", body = crate::error::ErrorResponse)
    ),
    tag = "build"
)]
pub async fn start_build(
    State(state): State<AppState>,
    query: Result<Query<BuildQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let kind = BuildKind::from_mock_flag(query.mock);

    let stream = state.builds.start(kind)?;
    let body = Body::from_stream(stream.map(|msg| msg.to_ndjson()));

    Ok((
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/api/build/abort",
    responses(
        (status = 200, description = "Abort result; cleanup problems are reported in `warning`", body = AbortOutcome)
    ),
    tag = "build"
)]
pub async fn abort_build(State(state): State<AppState>) -> Json<AbortOutcome> {
    Json(state.builds.abort().await)
}

#[utoipa::path(
    get,
    path = "/api/build/status",
    responses(
        (status = 200, description = "Active and most recent build session", body = BuildStatus)
    ),
    tag = "build"
)]
pub async fn build_status(State(state): State<AppState>) -> Json<BuildStatus> {
    Json(state.builds.status())
}
