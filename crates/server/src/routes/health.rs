//! Routes reporting whether the backing database is usable.

use axum::{
    Router,
    extract::State,
    response::Json as ResponseJson,
    routing::{get, post},
};
use services::services::database_availability::AvailabilityStatus;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError};

/// GET /api/health/database
/// Cached verdict, probing only when the cache has expired
pub async fn get_database_status(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<AvailabilityStatus>>, ApiError> {
    let availability = deployment
        .availability()
        .ok_or(ApiError::StoreNotConfigured)?;
    availability.is_available().await;
    Ok(ResponseJson(ApiResponse::success(availability.status())))
}

/// POST /api/health/database/check
pub async fn check_database(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<AvailabilityStatus>>, ApiError> {
    let availability = deployment
        .availability()
        .ok_or(ApiError::StoreNotConfigured)?;
    availability.force_check().await;
    Ok(ResponseJson(ApiResponse::success(availability.status())))
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new().nest(
        "/health/database",
        Router::new()
            .route("/", get(get_database_status))
            .route("/check", post(check_database)),
    )
}
