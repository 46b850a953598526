//! Per-tenant working directories for the provisioning tool.
//!
//! Each tenant gets `<deployments_root>/<tenant_id>`, seeded from the shared
//! template tree plus generated `backend.tf` and `terraform.tfvars`. The remote
//! state prefix written into `backend.tf` is derived from the tenant id, which
//! keeps tenants from ever sharing tool state.

use crate::error::{OrchestratorError, Result};
use crate::tenant::Environment;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tera::{Context as TeraContext, Tera, Value};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Files in the template tree with this suffix are template-only markers.
const TEMPLATE_MARKER_SUFFIX: &str = ".template";
/// Tool-local plugin cache; never copied between workspaces.
const TOOL_DATA_DIR: &str = ".terraform";
const MAX_TENANT_ID_LEN: usize = 64;

static CONFIG_TERA: OnceLock<Tera> = OnceLock::new();

fn config_tera() -> &'static Tera {
    CONFIG_TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.register_filter("hcl", hcl_filter);
        tera.add_raw_templates(vec![
            ("backend.tf", include_str!("templates/backend.tf.tera")),
            ("terraform.tfvars", include_str!("templates/terraform.tfvars.tera")),
        ])
        .expect("Failed to add workspace config templates");
        tera
    })
}

/// Escape a value for use inside a double-quoted HCL string.
fn hcl_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(Value::String(escape_hcl(&raw)))
}

fn escape_hcl(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace("${", "$${")
        .replace("%{", "%%{")
}

/// Remote state key for a tenant: `-` is not allowed in the key namespace.
pub fn state_prefix(tenant_id: &str) -> String {
    tenant_id.replace('-', "_")
}

/// Tenant ids become directory names, so they must be a single plain path
/// component.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && !tenant_id.starts_with('.')
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "tenant id is not a valid workspace name: {:?}",
            tenant_id
        )))
    }
}

/// What the generated variables file needs to know about a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentParams {
    pub name: String,
    pub environment: Environment,
    pub region: String,
    /// Set for sub-tenants only.
    pub parent: Option<ParentResource>,
}

/// The parent tenant's already-created database instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentResource {
    pub tenant_id: String,
    pub instance: String,
}

#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub deployments_root: PathBuf,
    pub template_dir: PathBuf,
    pub project_id: String,
    pub state_bucket: String,
    /// Service account key copied into every workspace, when present.
    pub credentials_source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    settings: WorkspaceSettings,
}

impl WorkspaceManager {
    pub fn new(settings: WorkspaceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    pub fn workspace_path(&self, tenant_id: &str) -> PathBuf {
        self.settings.deployments_root.join(tenant_id)
    }

    /// File name the credential material gets inside a workspace.
    pub fn credentials_file_name(&self) -> Option<String> {
        self.settings
            .credentials_source
            .as_ref()?
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn workspace_exists(&self, tenant_id: &str) -> bool {
        validate_tenant_id(tenant_id).is_ok() && self.workspace_path(tenant_id).is_dir()
    }

    /// Whether the tool has already been initialized in the workspace.
    pub fn is_initialized(&self, workspace: &Path) -> bool {
        workspace.join(TOOL_DATA_DIR).is_dir()
    }

    /// Allocate a fresh workspace. Any previous workspace for the tenant is
    /// removed first so no state carries over between attempts.
    #[instrument(skip(self, params), fields(tenant_id = %tenant_id))]
    pub fn create_workspace(&self, tenant_id: &str, params: &DeploymentParams) -> Result<PathBuf> {
        validate_tenant_id(tenant_id)?;
        let workspace = self.workspace_path(tenant_id);

        if workspace.exists() {
            info!("Removing previous workspace {}", workspace.display());
            fs::remove_dir_all(&workspace)
                .map_err(|e| workspace_error("remove previous workspace", &workspace, e))?;
        }

        fs::create_dir_all(&workspace)
            .map_err(|e| workspace_error("create workspace", &workspace, e))?;
        info!("Created workspace directory: {}", workspace.display());

        self.copy_template(&workspace)?;
        self.ensure_credentials(&workspace)?;
        self.render_backend(&workspace, tenant_id)?;
        self.render_variables(&workspace, tenant_id, params)?;

        Ok(workspace)
    }

    /// Remove the tenant's workspace. Removing a workspace that does not exist
    /// succeeds.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub fn destroy_workspace(&self, tenant_id: &str) -> Result<()> {
        validate_tenant_id(tenant_id)?;
        let workspace = self.workspace_path(tenant_id);

        match fs::remove_dir_all(&workspace) {
            Ok(()) => {
                info!("Removed workspace {}", workspace.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(workspace_error("remove workspace", &workspace, e)),
        }
    }

    /// Copy the credential file into the workspace if it is missing there.
    /// Missing credential material is not fatal: an ambient identity may work.
    pub fn ensure_credentials(&self, workspace: &Path) -> Result<()> {
        let (Some(source), Some(name)) = (
            self.settings.credentials_source.as_ref(),
            self.credentials_file_name(),
        ) else {
            return Ok(());
        };

        let target = workspace.join(name);
        if target.is_file() {
            return Ok(());
        }

        if source.is_file() {
            fs::copy(source, &target)
                .map_err(|e| workspace_error("copy credentials", &target, e))?;
            debug!("Copied credentials into workspace from {}", source.display());
        } else {
            warn!(
                "Credentials file not found at {}; relying on ambient identity",
                source.display()
            );
        }

        Ok(())
    }

    fn copy_template(&self, workspace: &Path) -> Result<()> {
        let template = &self.settings.template_dir;
        if !template.is_dir() {
            return Err(OrchestratorError::Workspace(format!(
                "template directory not found: {}",
                template.display()
            )));
        }

        let entries = WalkDir::new(template)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != TOOL_DATA_DIR);

        for entry in entries {
            let entry = entry.map_err(|e| {
                OrchestratorError::Workspace(format!("failed to read template tree: {}", e))
            })?;
            let relative = entry.path().strip_prefix(template).map_err(|e| {
                OrchestratorError::Workspace(format!("unexpected template path: {}", e))
            })?;
            let target = workspace.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|e| workspace_error("create directory", &target, e))?;
            } else if entry
                .file_name()
                .to_string_lossy()
                .ends_with(TEMPLATE_MARKER_SUFFIX)
            {
                debug!("Skipping template marker {}", relative.display());
            } else {
                fs::copy(entry.path(), &target)
                    .map_err(|e| workspace_error("copy template file", &target, e))?;
            }
        }

        Ok(())
    }

    fn render_backend(&self, workspace: &Path, tenant_id: &str) -> Result<()> {
        let prefix = state_prefix(tenant_id);

        let mut context = TeraContext::new();
        context.insert("state_bucket", &self.settings.state_bucket);
        context.insert("state_prefix", &prefix);

        let content = config_tera().render("backend.tf", &context)?;
        let path = workspace.join("backend.tf");
        fs::write(&path, content).map_err(|e| workspace_error("write", &path, e))?;

        info!(
            "Generated backend.tf: state bucket '{}', prefix '{}'",
            self.settings.state_bucket, prefix
        );
        Ok(())
    }

    fn render_variables(
        &self,
        workspace: &Path,
        tenant_id: &str,
        params: &DeploymentParams,
    ) -> Result<()> {
        let mut context = TeraContext::new();
        context.insert("project_id", &self.settings.project_id);
        context.insert("region", &params.region);
        context.insert("environment", params.environment.as_str());
        context.insert("tenant_id", tenant_id);
        context.insert("created_date", &Utc::now().format("%Y-%m-%d").to_string());
        context.insert(
            "parent_instance",
            &params.parent.as_ref().map(|p| p.instance.as_str()),
        );
        context.insert("tenant_name", &params.name);

        let content = config_tera().render("terraform.tfvars", &context)?;
        let path = workspace.join("terraform.tfvars");
        fs::write(&path, content).map_err(|e| workspace_error("write", &path, e))?;

        info!("Generated terraform.tfvars: {}", path.display());
        Ok(())
    }
}

fn workspace_error(action: &str, path: &Path, err: io::Error) -> OrchestratorError {
    OrchestratorError::Workspace(format!("failed to {} {}: {}", action, path.display(), err))
}
