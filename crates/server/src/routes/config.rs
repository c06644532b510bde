use axum::extract::State;
use axum::Json;

use crate::config::PublicConfig;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/api/config",
    responses(
        (status = 200, description = "Settings the frontend needs", body = PublicConfig)
    ),
    tag = "config"
)]
pub async fn get_config(State(state): State<AppState>) -> Json<PublicConfig> {
    Json(state.config.public())
}
