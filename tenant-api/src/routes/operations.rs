use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tenant_orchestrator::{
    Operation, OperationFilters, OperationStatus, OperationType, OrchestratorError,
};
use utoipa::IntoParams;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/{id}", get(get_operation))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OperationsQuery {
    pub tenant_id: Option<String>,
    /// `provision`, `destroy` or `tables`
    #[serde(rename = "type")]
    pub operation_type: Option<String>,
    /// `running`, `success` or `failed`
    pub status: Option<String>,
}

/// Parse a snake_case enum value; unknown values are a client error.
fn parse_filter<T: DeserializeOwned>(name: &str, value: Option<String>) -> ApiResult<Option<T>> {
    value
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.clone()))
                .map_err(|_| ApiError::BadRequest(format!("invalid {} filter: {}", name, s)))
        })
        .transpose()
}

#[utoipa::path(
    get,
    path = "/api/v1/operations",
    params(OperationsQuery),
    responses(
        (status = 200, description = "Operations, newest first", body = Vec<Operation>),
        (status = 400, description = "Unknown type or status filter")
    ),
    tag = "operations"
)]
pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult<Json<Vec<Operation>>> {
    let filters = OperationFilters {
        tenant_id: query.tenant_id,
        operation_type: parse_filter::<OperationType>("type", query.operation_type)?,
        status: parse_filter::<OperationStatus>("status", query.status)?,
    };

    let operations = state.store().get_operations(filters).await?;

    Ok(Json(operations))
}

#[utoipa::path(
    get,
    path = "/api/v1/operations/{id}",
    params(("id" = String, Path, description = "Operation ID")),
    responses(
        (status = 200, description = "Operation", body = Operation),
        (status = 404, description = "Operation not found")
    ),
    tag = "operations"
)]
pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    let operation = state.store().get_operation(&id).await.map_err(|e| match e {
        OrchestratorError::NotFound(_) => ApiError::NotFound(format!("Operation not found: {}", id)),
        other => other.into(),
    })?;

    Ok(Json(operation))
}
