use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
    tables::TablesReport,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenant_orchestrator::{
    Environment, NewTenant, OperationType, OrchestratorError, Outputs, TeardownMode,
    TeardownReport, TenantRecord, TenantStatus,
};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/tenants", get(list_tenants).post(register_tenant))
        .route(
            "/api/v1/tenants/{id}",
            get(get_tenant).delete(delete_tenant),
        )
        .route("/api/v1/tenants/{id}/outputs", get(get_outputs))
        .route("/api/v1/tenants/{id}/sub-tenants", post(register_sub_tenant))
        .route(
            "/api/v1/tenants/{id}/destroy-infrastructure",
            post(destroy_infrastructure),
        )
        .route("/api/v1/tenants/{id}/tables", post(create_tables))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterTenantRequest {
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    /// Falls back to the service's default region.
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RegistrationResponse {
    pub tenant_id: String,
    pub job_id: String,
    pub status: TenantStatus,
    pub status_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantSummary {
    pub id: String,
    pub name: String,
    pub status: TenantStatus,
    pub environment: Environment,
    pub region: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<TenantRecord> for TenantSummary {
    fn from(record: TenantRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            environment: record.environment,
            region: record.region,
            parent_id: record.parent_id,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantListResponse {
    pub tenants: Vec<TenantSummary>,
    pub total: usize,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Only tenants in this status.
    pub status: Option<TenantStatus>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeleteQuery {
    /// Delete the records without destroying any infrastructure.
    #[serde(default)]
    pub skip_infrastructure: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub message: String,
    pub tenant_id: String,
    pub infrastructure_destroyed: bool,
    pub sub_tenants_deleted: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DestroyResponse {
    pub message: String,
    pub tenant_id: String,
    /// False when the tenant had no workspace and nothing was run.
    pub destroyed: bool,
}

fn status_url(tenant_id: &str) -> String {
    format!("/api/v1/tenants/{}", tenant_id)
}

#[utoipa::path(
    post,
    path = "/api/v1/tenants",
    request_body = RegisterTenantRequest,
    responses(
        (status = 201, description = "Tenant registered and provisioning started", body = RegistrationResponse),
        (status = 400, description = "Invalid request")
    ),
    tag = "tenants"
)]
pub async fn register_tenant(
    State(state): State<AppState>,
    Json(req): Json<RegisterTenantRequest>,
) -> ApiResult<(StatusCode, Json<RegistrationResponse>)> {
    let record = state.store().create(new_tenant(&state, req, None)).await?;
    let ticket = state.scheduler.submit(&record.id).await?;

    info!(tenant_id = %ticket.tenant_id, job_id = %ticket.job_id, "Tenant registered");

    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            status_url: status_url(&record.id),
            tenant_id: ticket.tenant_id,
            job_id: ticket.job_id,
            status: TenantStatus::InProgress,
            created_at: record.created_at,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/sub-tenants",
    params(("id" = String, Path, description = "Parent tenant ID")),
    request_body = RegisterTenantRequest,
    responses(
        (status = 201, description = "Sub-tenant registered and provisioning started", body = RegistrationResponse),
        (status = 400, description = "Parent not ready or busy; the sub-tenant record is kept as FAILED and its id is named in the error"),
        (status = 404, description = "Parent tenant not found")
    ),
    tag = "tenants"
)]
pub async fn register_sub_tenant(
    State(state): State<AppState>,
    Path(parent_id): Path<String>,
    Json(req): Json<RegisterTenantRequest>,
) -> ApiResult<(StatusCode, Json<RegistrationResponse>)> {
    let parent = state.store().get(&parent_id).await?;
    if parent.is_sub_tenant() {
        return Err(ApiError::BadRequest(format!(
            "tenant {} is itself a sub-tenant",
            parent_id
        )));
    }

    let record = state
        .store()
        .create(new_tenant(&state, req, Some(parent.id)))
        .await?;
    // Parent readiness is checked by the scheduler, which records the
    // failure on the new tenant before returning it.
    let ticket = state.scheduler.submit(&record.id).await.map_err(|e| match e {
        OrchestratorError::Precondition(msg) => ApiError::BadRequest(format!(
            "{}; sub-tenant {} was recorded as failed",
            msg, record.id
        )),
        other => other.into(),
    })?;

    info!(
        tenant_id = %ticket.tenant_id,
        parent_id = %parent_id,
        "Sub-tenant registered"
    );

    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            status_url: status_url(&record.id),
            tenant_id: ticket.tenant_id,
            job_id: ticket.job_id,
            status: TenantStatus::InProgress,
            created_at: record.created_at,
        }),
    ))
}

fn new_tenant(state: &AppState, req: RegisterTenantRequest, parent_id: Option<String>) -> NewTenant {
    NewTenant {
        name: req.name,
        environment: req.environment,
        region: req
            .region
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| state.config.gcp_region.clone()),
        parent_id,
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants",
    params(ListQuery),
    responses(
        (status = 200, description = "Tenants, newest first", body = TenantListResponse)
    ),
    tag = "tenants"
)]
pub async fn list_tenants(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<TenantListResponse>> {
    let records = match query.status {
        Some(status) => state.store().list_by_status(status).await?,
        None => state.store().list().await?,
    };

    let tenants: Vec<TenantSummary> = records.into_iter().map(TenantSummary::from).collect();
    Ok(Json(TenantListResponse {
        total: tenants.len(),
        tenants,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}",
    params(("id" = String, Path, description = "Tenant ID")),
    responses(
        (status = 200, description = "Tenant record", body = TenantRecord),
        (status = 404, description = "Tenant not found")
    ),
    tag = "tenants"
)]
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TenantRecord>> {
    Ok(Json(state.store().get(&id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/tenants/{id}/outputs",
    params(("id" = String, Path, description = "Tenant ID")),
    responses(
        (status = 200, description = "Redacted deployment outputs"),
        (status = 400, description = "Deployment not completed"),
        (status = 404, description = "Tenant not found or no outputs recorded")
    ),
    tag = "tenants"
)]
pub async fn get_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Outputs>> {
    let record = state.store().get(&id).await?;

    if record.status != TenantStatus::Completed {
        return Err(ApiError::BadRequest(format!(
            "Deployment not completed. Current status: {}",
            record.status
        )));
    }

    match record.outputs {
        Some(outputs) if !outputs.is_empty() => Ok(Json(outputs)),
        _ => Err(ApiError::NotFound(format!(
            "No outputs available for tenant {}",
            id
        ))),
    }
}

#[utoipa::path(
    delete,
    path = "/api/v1/tenants/{id}",
    params(("id" = String, Path, description = "Tenant ID"), DeleteQuery),
    responses(
        (status = 200, description = "Tenant and its sub-tenants deleted", body = DeleteResponse),
        (status = 404, description = "Tenant not found"),
        (status = 409, description = "An operation is in progress"),
        (status = 500, description = "Infrastructure teardown failed; the record is kept as FAILED")
    ),
    tag = "tenants"
)]
pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<DeleteResponse>> {
    let mode = if query.skip_infrastructure {
        TeardownMode::RecordOnly
    } else {
        TeardownMode::Delete
    };

    // Children go first: their databases live on the parent's instance.
    let cascade = state
        .scheduler
        .teardown_with_sub_tenants(&id, mode)
        .await?;

    Ok(Json(DeleteResponse {
        message: format!("Tenant {} deleted successfully", id),
        tenant_id: id,
        infrastructure_destroyed: !query.skip_infrastructure,
        sub_tenants_deleted: cascade.sub_tenants_deleted,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/destroy-infrastructure",
    params(("id" = String, Path, description = "Tenant ID")),
    responses(
        (status = 200, description = "Infrastructure destroyed; the record is kept as FAILED with its outputs cleared", body = DestroyResponse),
        (status = 404, description = "Tenant not found"),
        (status = 409, description = "An operation is in progress"),
        (status = 500, description = "Destroy failed")
    ),
    tag = "tenants"
)]
pub async fn destroy_infrastructure(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DestroyResponse>> {
    let outcome = state
        .scheduler
        .teardown(&id, TeardownMode::InfrastructureOnly)
        .await?;
    let destroyed = outcome.report == Some(TeardownReport::Destroyed);

    Ok(Json(DestroyResponse {
        message: if destroyed {
            format!("Infrastructure destroyed successfully for {}", id)
        } else {
            format!("No infrastructure found for {}", id)
        },
        tenant_id: id,
        destroyed,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/tenants/{id}/tables",
    params(("id" = String, Path, description = "Tenant ID")),
    responses(
        (status = 200, description = "Tables created", body = TablesReport),
        (status = 400, description = "Tenant or parent not completed, or outputs missing"),
        (status = 404, description = "Tenant not found"),
        (status = 409, description = "An operation is in progress"),
        (status = 500, description = "A remote step failed")
    ),
    tag = "tenants"
)]
pub async fn create_tables(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TablesReport>> {
    let tables = state.tables.clone();
    let store = state.store().clone();
    let tenant_id = id.clone();
    let report = state
        .scheduler
        .run_exclusive(&id, OperationType::Tables, async move {
            tables.initialize(&store, &tenant_id).await
        })
        .await?;

    Ok(Json(report))
}
