pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "opsdash API",
        version = "0.1.0",
        description = "Operations dashboard backend - build orchestration"
    ),
    paths(
        routes::health_check,
        routes::get_config,
        routes::build::start_build,
        routes::build::abort_build,
        routes::build::build_status,
    ),
    components(schemas(
        routes::HealthResponse,
        config::PublicConfig,
        error::ErrorResponse,
        events::BuildMessage,
        events::CompletionStatus,
        orchestrator::AbortOutcome,
        orchestrator::AbortStatus,
        orchestrator::BuildStatus,
        orchestrator::ActiveSummary,
        opsdash_core::BuildSession,
        opsdash_core::BuildState,
        opsdash_core::BuildKind,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "config", description = "Frontend configuration"),
        (name = "build", description = "Build orchestration: start, stream, abort"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let app_dir = state.app_dir.clone();

    let api_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route("/api/config", get(routes::get_config))
        .route("/api/build", post(routes::build::start_build))
        .route("/api/build/abort", post(routes::build::abort_build))
        .route("/api/build/status", get(routes::build::build_status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(app_dir) = app_dir {
        let index_file = app_dir.join("index.html");
        let serve_dir = ServeDir::new(&app_dir).not_found_service(ServeFile::new(&index_file));
        api_router.fallback_service(serve_dir)
    } else {
        api_router
    }
}
