//! Table initialization for provisioned tenant databases.
//!
//! The database is only reachable from inside the tenant network, so the
//! schema is applied from a helper VM: the SQL file is uploaded to the
//! tenant's private bucket, then a list of remote steps fetches it on the VM
//! and feeds it to the MySQL client there.
//!
//! Top-level tenants read their connection from the
//! `<tenant_id_underscored>_DATABASE_URI` secret. Sub-tenants share the
//! parent's server, so they use the parent's secret with their own
//! `database_name` output, and their database is created first.

use crate::config::Config;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenant_orchestrator::outputs::output_str;
use tenant_orchestrator::{
    ConnectionInfo, OrchestratorError, ProcessRunner, RemoteShell, RemoteStep, RemoteStepFailure,
    RemoteStepRunner, TenantRecord, TenantStatus, TenantStore, ToolCommand,
};
use thiserror::Error;
use tracing::{info, instrument};
use utoipa::ToSchema;

pub const CLUSTER_SQL_FILE: &str = "cluster_tenants.sql";
pub const SUBNETWORK_SQL_FILE: &str = "subnetwork_tenants.sql";

const SECRET_TIMEOUT: Duration = Duration::from_secs(60);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum TablesError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("{0}")]
    NotReady(String),

    #[error("required output missing: {0}")]
    MissingOutput(&'static str),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("SQL file not found: {}", .0.display())]
    SqlFileMissing(PathBuf),

    #[error("failed to read connection secret {secret}: {message}")]
    Secret { secret: String, message: String },

    #[error("failed to upload SQL file: {0}")]
    Upload(String),

    #[error("failed to create tables: {0}")]
    Step(#[from] RemoteStepFailure),
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TablesReport {
    pub tenant_id: String,
    pub database: String,
    pub sql_file: String,
    pub artifact: String,
    pub steps_run: usize,
}

#[derive(Debug, Clone)]
pub struct TablesSettings {
    pub gcloud: String,
    pub gsutil: String,
    pub project_id: String,
    pub default_region: String,
    pub vm_name: Option<String>,
    pub vm_zone: Option<String>,
    pub sql_dir: PathBuf,
    pub step_timeout: Duration,
}

impl TablesSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            gcloud: config.gcloud_binary.clone(),
            gsutil: config.gsutil_binary.clone(),
            project_id: config.gcp_project_id.clone(),
            default_region: config.gcp_region.clone(),
            vm_name: config.db_init_vm_name.clone(),
            vm_zone: config.db_init_vm_zone.clone(),
            sql_dir: config.sql_dir.clone(),
            step_timeout: Duration::from_secs(600),
        }
    }
}

/// Name of the secret holding a tenant's database URI.
pub fn secret_name(tenant_id: &str) -> String {
    format!("{}_DATABASE_URI", tenant_id.replace('-', "_"))
}

#[derive(Debug, Clone)]
pub struct TableInitializer {
    settings: TablesSettings,
    runner: ProcessRunner,
}

/// Everything resolved from the store before any command runs.
struct Target {
    secret_owner: String,
    database: Option<String>,
    bucket: String,
    region: String,
    sql_file: &'static str,
}

impl TableInitializer {
    pub fn new(settings: TablesSettings) -> Self {
        Self {
            settings,
            runner: ProcessRunner::new(),
        }
    }

    pub fn settings(&self) -> &TablesSettings {
        &self.settings
    }

    #[instrument(skip(self, store), fields(tenant_id = %tenant_id))]
    pub async fn initialize(
        &self,
        store: &TenantStore,
        tenant_id: &str,
    ) -> Result<TablesReport, TablesError> {
        let record = store.get(tenant_id).await?;
        let target = self.resolve(store, &record).await?;

        let vm_name = self
            .settings
            .vm_name
            .as_deref()
            .ok_or(TablesError::NotConfigured("DB_INIT_VM_NAME"))?;
        let zone = self
            .settings
            .vm_zone
            .clone()
            .unwrap_or_else(|| format!("{}-a", target.region));

        let sql_path = self.settings.sql_dir.join(target.sql_file);
        if !sql_path.is_file() {
            return Err(TablesError::SqlFileMissing(sql_path));
        }

        let connection = self.read_connection(&target.secret_owner).await?;
        let connection = match &target.database {
            Some(database) => connection.with_database(database.clone()),
            None => connection,
        };

        let artifact = self
            .upload(&sql_path, &target.bucket, tenant_id, target.sql_file)
            .await?;

        let steps = plan_steps(&connection, &artifact, tenant_id, target.database.is_some());
        let shell = RemoteShell::gcloud_ssh(
            &self.settings.gcloud,
            vm_name,
            &zone,
            &self.settings.project_id,
        )
        .with_timeout(self.settings.step_timeout);
        let steps_run = RemoteStepRunner::new(shell, self.runner.clone())
            .run(&steps)
            .await?;

        info!("Tables created in {}", connection.database);

        Ok(TablesReport {
            tenant_id: tenant_id.to_string(),
            database: connection.database,
            sql_file: target.sql_file.to_string(),
            artifact,
            steps_run,
        })
    }

    async fn resolve(
        &self,
        store: &TenantStore,
        record: &TenantRecord,
    ) -> Result<Target, TablesError> {
        if record.status != TenantStatus::Completed {
            return Err(TablesError::NotReady(format!(
                "tenant must be completed before tables are created; current status: {}",
                record.status
            )));
        }

        let outputs = record.outputs.clone().unwrap_or_default();
        let bucket = output_str(&outputs, "private_bucket_name")
            .ok_or(TablesError::MissingOutput("private_bucket_name"))?
            .into_owned();
        let region = if record.region.is_empty() {
            self.settings.default_region.clone()
        } else {
            record.region.clone()
        };

        let Some(parent_id) = &record.parent_id else {
            return Ok(Target {
                secret_owner: record.id.clone(),
                database: None,
                bucket,
                region,
                sql_file: CLUSTER_SQL_FILE,
            });
        };

        let database = output_str(&outputs, "database_name")
            .ok_or(TablesError::MissingOutput("database_name"))?
            .into_owned();
        let parent = store.find(parent_id).await?.ok_or_else(|| {
            TablesError::NotReady(format!("parent tenant not found: {}", parent_id))
        })?;
        if parent.status != TenantStatus::Completed {
            return Err(TablesError::NotReady(format!(
                "parent tenant must be completed; current status: {}",
                parent.status
            )));
        }

        Ok(Target {
            secret_owner: parent.id,
            database: Some(database),
            bucket,
            region,
            sql_file: SUBNETWORK_SQL_FILE,
        })
    }

    async fn read_connection(&self, owner: &str) -> Result<ConnectionInfo, TablesError> {
        let secret = secret_name(owner);
        let command = ToolCommand::new(
            self.settings.gcloud.clone(),
            [
                "secrets".to_string(),
                "versions".to_string(),
                "access".to_string(),
                "latest".to_string(),
                format!("--secret={}", secret),
                format!("--project={}", self.settings.project_id),
            ],
        );

        let result = self
            .runner
            .run(&self.settings.sql_dir, &command, SECRET_TIMEOUT)
            .await;
        if !result.success {
            return Err(TablesError::Secret {
                secret,
                message: result.failure_message().to_string(),
            });
        }

        ConnectionInfo::parse(result.output.trim()).map_err(|e| TablesError::Secret {
            secret,
            message: e.to_string(),
        })
    }

    /// Upload the SQL file to `gs://<bucket>/database-init/<tenant>/<file>`.
    async fn upload(
        &self,
        sql_path: &Path,
        bucket: &str,
        tenant_id: &str,
        file_name: &str,
    ) -> Result<String, TablesError> {
        let destination = format!("gs://{}/database-init/{}/{}", bucket, tenant_id, file_name);
        let command = ToolCommand::new(
            self.settings.gsutil.clone(),
            [
                "cp".to_string(),
                sql_path.display().to_string(),
                destination.clone(),
            ],
        );

        let result = self
            .runner
            .run(&self.settings.sql_dir, &command, UPLOAD_TIMEOUT)
            .await;
        if !result.success {
            return Err(TablesError::Upload(result.failure_message().to_string()));
        }

        info!("Uploaded {} to {}", file_name, destination);
        Ok(destination)
    }
}

/// Remote steps for one initialization, in execution order.
pub fn plan_steps(
    connection: &ConnectionInfo,
    artifact: &str,
    tenant_id: &str,
    create_database: bool,
) -> Vec<RemoteStep> {
    let local_file = format!("/tmp/create_tables_{}.sql", tenant_id);

    let mut steps = vec![
        RemoteStep::install("mysql", "mysql-client", "mysql"),
        RemoteStep::install("gsutil", "gsutil", "gcloud-sdk"),
        RemoteStep::FetchArtifact {
            source: artifact.to_string(),
            destination: local_file.clone(),
        },
    ];

    if create_database {
        steps.push(RemoteStep::RunStatement {
            connection: connection.clone(),
            database: "mysql".to_string(),
            statement: format!(
                "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;",
                connection.database.replace('`', "")
            ),
        });
    }

    steps.push(RemoteStep::RunStatement {
        connection: connection.clone(),
        database: connection.database.clone(),
        statement: "SELECT 1;".to_string(),
    });
    steps.push(RemoteStep::RunStatementFile {
        connection: connection.clone(),
        path: local_file,
    });

    steps
}
