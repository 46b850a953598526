use crate::error::{OrchestratorError, Result};
use crate::tenant::TenantStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// One admitted attempt against a tenant's infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Operation {
    pub id: String,
    pub tenant_id: String,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationType {
    Provision,
    Destroy,
    /// Schema setup on an already provisioned database.
    Tables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct OperationFilters {
    pub tenant_id: Option<String>,
    pub operation_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
}

impl TenantStore {
    /// Record a newly admitted operation in the running state
    pub async fn record_operation(
        &self,
        tenant_id: &str,
        operation_type: OperationType,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO operations (id, tenant_id, operation_type, status, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(operation_type)
        .bind(OperationStatus::Running)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(id)
    }

    /// Close an operation with its final status
    pub async fn complete_operation(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE operations SET status = ?, completed_at = ?, error = ? WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now().timestamp())
        .bind(error)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("operation {}", id)));
        }

        Ok(())
    }

    /// Close every still-running operation of a tenant as failed. Used when
    /// the task that owned them is gone.
    pub async fn fail_running_operations(&self, tenant_id: &str, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE operations SET status = ?, completed_at = ?, error = ?
             WHERE tenant_id = ? AND status = ?",
        )
        .bind(OperationStatus::Failed)
        .bind(Utc::now().timestamp())
        .bind(error)
        .bind(tenant_id)
        .bind(OperationStatus::Running)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Get a single operation by ID
    pub async fn get_operation(&self, id: &str) -> Result<Operation> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {}", id)))?;

        Ok(row.into())
    }

    /// Get operations, newest first, with optional filters
    pub async fn get_operations(&self, filters: OperationFilters) -> Result<Vec<Operation>> {
        let mut query = "SELECT * FROM operations WHERE 1=1".to_string();

        if filters.tenant_id.is_some() {
            query.push_str(" AND tenant_id = ?");
        }
        if filters.operation_type.is_some() {
            query.push_str(" AND operation_type = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY started_at DESC, rowid DESC");

        let mut q = sqlx::query_as::<_, OperationRow>(&query);

        if let Some(tenant_id) = &filters.tenant_id {
            q = q.bind(tenant_id);
        }
        if let Some(operation_type) = filters.operation_type {
            q = q.bind(operation_type);
        }
        if let Some(status) = filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(self.pool()).await?;

        Ok(rows.into_iter().map(Operation::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    tenant_id: String,
    operation_type: OperationType,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            operation_type: row.operation_type,
            status: row.status,
            started_at: DateTime::from_timestamp(row.started_at, 0).unwrap_or_default(),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            error: row.error,
        }
    }
}
