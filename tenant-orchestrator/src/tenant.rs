use crate::error::{OrchestratorError, Result};
use crate::outputs::Outputs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantRecord {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub environment: Environment,
    pub region: String,
    pub parent_id: Option<String>,
    pub status: TenantStatus,
    pub error_message: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub outputs: Option<Outputs>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl TenantRecord {
    pub fn is_sub_tenant(&self) -> bool {
        self.parent_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TenantStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TenantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TenantStatus::Completed | TenantStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TenantStatus::Pending => "pending",
            TenantStatus::InProgress => "in_progress",
            TenantStatus::Completed => "completed",
            TenantStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewTenant {
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    pub region: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl NewTenant {
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(OrchestratorError::InvalidInput(format!(
                "tenant name must be between 1 and {} characters",
                MAX_NAME_LEN
            )));
        }

        let region_ok = !self.region.is_empty()
            && self
                .region
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !region_ok {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid region: {:?}",
                self.region
            )));
        }

        Ok(())
    }
}

/// SQLite-backed store of tenant records. The scheduler is the only writer of
/// status transitions; the API layer creates and deletes records.
#[derive(Clone)]
pub struct TenantStore {
    pool: SqlitePool,
}

impl TenantStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new tenant in the pending state
    pub async fn create(&self, req: NewTenant) -> Result<TenantRecord> {
        req.validate()?;

        let id = Uuid::new_v4().to_string();
        let job_id = format!("job-{}", &id[..8]);
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO tenants (id, job_id, name, environment, region, parent_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&job_id)
        .bind(req.name.trim())
        .bind(req.environment)
        .bind(&req.region)
        .bind(&req.parent_id)
        .bind(TenantStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(tenant_id = %id, name = %req.name.trim(), "Created tenant record");

        self.get(&id).await
    }

    /// Get a single tenant by ID
    pub async fn get(&self, id: &str) -> Result<TenantRecord> {
        self.find(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    pub async fn find(&self, id: &str) -> Result<Option<TenantRecord>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TenantRecord::try_from).transpose()
    }

    /// All tenants, newest first
    pub async fn list(&self) -> Result<Vec<TenantRecord>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT * FROM tenants ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantRecord::try_from).collect()
    }

    pub async fn list_by_status(&self, status: TenantStatus) -> Result<Vec<TenantRecord>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT * FROM tenants WHERE status = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantRecord::try_from).collect()
    }

    /// Sub-tenants of the given parent
    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<TenantRecord>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT * FROM tenants WHERE parent_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantRecord::try_from).collect()
    }

    /// Set the status; the error message column is overwritten (None clears it)
    pub async fn update_status(
        &self,
        id: &str,
        status: TenantStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenants SET status = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error_message)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        tracing::info!(tenant_id = %id, status = %status, "Updated tenant status");

        Ok(())
    }

    /// Compare-and-set on the status column. Returns false when the tenant was
    /// not in `from` (or does not exist).
    pub async fn transition(
        &self,
        id: &str,
        from: TenantStatus,
        to: TenantStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tenants SET status = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(error_message)
        .bind(Utc::now().timestamp())
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn update_outputs(&self, id: &str, outputs: &Outputs) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET outputs = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(outputs)?)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Drop the outputs of a tenant whose infrastructure no longer exists
    pub async fn clear_outputs(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE tenants SET outputs = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }

        tracing::info!(tenant_id = %id, "Deleted tenant record");

        Ok(())
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct TenantRow {
    id: String,
    job_id: String,
    name: String,
    environment: Environment,
    region: String,
    parent_id: Option<String>,
    status: TenantStatus,
    error_message: Option<String>,
    outputs: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TenantRow> for TenantRecord {
    type Error = OrchestratorError;

    fn try_from(row: TenantRow) -> Result<Self> {
        let outputs = row
            .outputs
            .map(|s| serde_json::from_str::<Outputs>(&s))
            .transpose()?;

        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            name: row.name,
            environment: row.environment,
            region: row.region,
            parent_id: row.parent_id,
            status: row.status,
            error_message: row.error_message,
            outputs,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        })
    }
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
