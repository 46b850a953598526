use anyhow::{bail, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tenant_orchestrator::{ToolSettings, WorkspaceSettings};

/// What the reconciler does with IN_PROGRESS tenants no task owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// Move them to FAILED so a caller can resubmit.
    #[default]
    Fail,
    /// Only log them.
    Report,
}

impl FromStr for StalePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(StalePolicy::Fail),
            "report" => Ok(StalePolicy::Report),
            other => Err(format!("unknown stale policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Required in `x-api-key` when set.
    pub api_key: Option<String>,

    pub deployments_path: PathBuf,
    pub template_path: PathBuf,
    pub sql_dir: PathBuf,

    pub terraform_binary: String,
    pub init_timeout_secs: u64,
    pub apply_timeout_secs: u64,
    pub destroy_timeout_secs: u64,
    pub output_timeout_secs: u64,

    pub gcp_project_id: String,
    pub gcp_region: String,
    pub gcp_credentials_file: Option<PathBuf>,
    pub state_bucket: String,

    pub gcloud_binary: String,
    pub gsutil_binary: String,
    pub db_init_vm_name: Option<String>,
    pub db_init_vm_zone: Option<String>,

    pub reconcile_interval_secs: u64,
    pub stale_policy: StalePolicy,
    pub shutdown_grace_secs: u64,
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tenant-api")
        .join("tenants.db")
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let template_path = var("TERRAFORM_TEMPLATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/app/infrastructure/base"));
        let sql_dir = var("TABLES_SQL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| template_path.join("sql"));

        Self {
            bind_addr: var("TENANT_API_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            db_path: var("TENANT_API_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_db_path),
            api_key: var("TENANT_API_KEY"),

            deployments_path: var("DEPLOYMENTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/data/deployments")),
            template_path,
            sql_dir,

            terraform_binary: var("TERRAFORM_BINARY").unwrap_or_else(|| "terraform".to_string()),
            init_timeout_secs: number("TERRAFORM_INIT_TIMEOUT", 300),
            apply_timeout_secs: number("TERRAFORM_APPLY_TIMEOUT", 1800),
            destroy_timeout_secs: number("TERRAFORM_DESTROY_TIMEOUT", 1800),
            output_timeout_secs: number("TERRAFORM_OUTPUT_TIMEOUT", 60),

            gcp_project_id: var("GCP_PROJECT_ID").unwrap_or_default(),
            gcp_region: var("GCP_REGION").unwrap_or_else(|| "me-central2".to_string()),
            gcp_credentials_file: var("GCP_CREDENTIALS_FILE").map(PathBuf::from),
            state_bucket: var("STATE_BUCKET_NAME").unwrap_or_default(),

            gcloud_binary: var("GCLOUD_BINARY").unwrap_or_else(|| "gcloud".to_string()),
            gsutil_binary: var("GSUTIL_BINARY").unwrap_or_else(|| "gsutil".to_string()),
            db_init_vm_name: var("DB_INIT_VM_NAME"),
            db_init_vm_zone: var("DB_INIT_VM_ZONE"),

            reconcile_interval_secs: number("RECONCILE_INTERVAL", 60),
            stale_policy: var("STALE_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            shutdown_grace_secs: number("SHUTDOWN_GRACE", 30),
        }
    }

    /// Settings the service cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.gcp_project_id.is_empty() {
            bail!("GCP_PROJECT_ID must be set");
        }
        if self.state_bucket.is_empty() {
            bail!("STATE_BUCKET_NAME must be set");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("RECONCILE_INTERVAL must be greater than zero");
        }
        Ok(())
    }

    pub fn workspace_settings(&self) -> WorkspaceSettings {
        WorkspaceSettings {
            deployments_root: self.deployments_path.clone(),
            template_dir: self.template_path.clone(),
            project_id: self.gcp_project_id.clone(),
            state_bucket: self.state_bucket.clone(),
            credentials_source: self.gcp_credentials_file.clone(),
        }
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            binary: self.terraform_binary.clone(),
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            apply_timeout: Duration::from_secs(self.apply_timeout_secs),
            destroy_timeout: Duration::from_secs(self.destroy_timeout_secs),
            output_timeout: Duration::from_secs(self.output_timeout_secs),
            ..ToolSettings::default()
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
