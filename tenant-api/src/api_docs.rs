use crate::routes::tenants::{
    DeleteResponse, DestroyResponse, RegisterTenantRequest, RegistrationResponse,
    TenantListResponse, TenantSummary,
};
use crate::tables::TablesReport;
use tenant_orchestrator::{
    Environment, Operation, OperationStatus, OperationType, TenantRecord, TenantStatus,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::tenants::register_tenant,
        crate::routes::tenants::register_sub_tenant,
        crate::routes::tenants::list_tenants,
        crate::routes::tenants::get_tenant,
        crate::routes::tenants::get_outputs,
        crate::routes::tenants::delete_tenant,
        crate::routes::tenants::destroy_infrastructure,
        crate::routes::tenants::create_tables,
        crate::routes::operations::list_operations,
        crate::routes::operations::get_operation,
    ),
    components(
        schemas(
            TenantRecord,
            TenantStatus,
            Environment,
            RegisterTenantRequest,
            RegistrationResponse,
            TenantSummary,
            TenantListResponse,
            DeleteResponse,
            DestroyResponse,
            TablesReport,
            Operation,
            OperationStatus,
            OperationType
        )
    ),
    tags(
        (name = "tenants", description = "Tenant registration, teardown and table setup"),
        (name = "operations", description = "Provision and destroy history"),
        (name = "health", description = "Liveness and readiness")
    )
)]
pub struct ApiDoc;
