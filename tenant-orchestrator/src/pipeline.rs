//! The ordered provisioning protocol.
//!
//! Provision: `WORKSPACE_CREATE → INIT → APPLY → COLLECT_OUTPUTS`.
//! Teardown: `WORKSPACE_ENSURE → [INIT] → DESTROY`.
//!
//! Stages run strictly one after another and the first failure stops the
//! attempt. A failed apply is not rolled back; the remote side may hold
//! partially created resources until a destroy succeeds.

use crate::outputs::ToolOutputs;
use crate::runner::{OperationResult, ProcessRunner, ToolCommand, DEFAULT_CREDENTIALS_ENV};
use crate::workspace::{validate_tenant_id, DeploymentParams, WorkspaceManager};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub binary: String,
    pub init_timeout: Duration,
    pub apply_timeout: Duration,
    pub destroy_timeout: Duration,
    pub output_timeout: Duration,
    pub credentials_env: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            init_timeout: Duration::from_secs(300),
            apply_timeout: Duration::from_secs(1800),
            destroy_timeout: Duration::from_secs(1800),
            output_timeout: Duration::from_secs(60),
            credentials_env: DEFAULT_CREDENTIALS_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    WorkspaceCreate,
    WorkspaceEnsure,
    Init,
    Apply,
    CollectOutputs,
    Destroy,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::WorkspaceCreate => "workspace_create",
            PipelineStage::WorkspaceEnsure => "workspace_ensure",
            PipelineStage::Init => "init",
            PipelineStage::Apply => "apply",
            PipelineStage::CollectOutputs => "collect_outputs",
            PipelineStage::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// A pipeline attempt that stopped at `stage`. The message is raw (not yet
/// classified).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PipelineFailure {
    pub stage: PipelineStage,
    pub message: String,
    pub timed_out: bool,
}

impl PipelineFailure {
    fn new(stage: PipelineStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            timed_out: false,
        }
    }

    fn from_step(stage: PipelineStage, prefix: &str, result: &OperationResult) -> Self {
        Self {
            stage,
            message: format!("{}: {}", prefix, result.failure_message()),
            timed_out: result.timed_out,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReport {
    /// No workspace existed, so nothing was ever created from here.
    NothingToDestroy,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct DeploymentPipeline {
    workspaces: WorkspaceManager,
    runner: ProcessRunner,
    tool: ToolSettings,
}

impl DeploymentPipeline {
    pub fn new(workspaces: WorkspaceManager, tool: ToolSettings) -> Self {
        let runner = match workspaces.credentials_file_name() {
            Some(name) => ProcessRunner::new().with_credentials(name, tool.credentials_env.clone()),
            None => ProcessRunner::new(),
        };

        Self {
            workspaces,
            runner,
            tool,
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn tool(&self) -> &ToolSettings {
        &self.tool
    }

    fn command(&self, args: &[&str]) -> ToolCommand {
        ToolCommand::new(self.tool.binary.clone(), args.iter().copied())
    }

    fn init_command(&self) -> ToolCommand {
        self.command(&["init", "-no-color", "-input=false"])
            .with_log("init")
    }

    fn apply_command(&self) -> ToolCommand {
        self.command(&["apply", "-auto-approve", "-no-color", "-input=false"])
            .with_log("apply")
    }

    fn destroy_command(&self) -> ToolCommand {
        self.command(&["destroy", "-auto-approve", "-no-color", "-input=false"])
            .with_log("destroy")
    }

    // No log artifact: the raw output document can carry secret values.
    fn output_command(&self) -> ToolCommand {
        self.command(&["output", "-json"])
    }

    /// Create the workspace, then init, apply, and collect outputs.
    #[instrument(skip(self, params), fields(tenant_id = %tenant_id))]
    pub async fn run_full_deployment(
        &self,
        tenant_id: &str,
        params: &DeploymentParams,
    ) -> Result<ToolOutputs, PipelineFailure> {
        let workspace = self.create_workspace(tenant_id, params).await?;

        info!("Running init");
        let init = self
            .runner
            .run(&workspace, &self.init_command(), self.tool.init_timeout)
            .await;
        if !init.success {
            return Err(PipelineFailure::from_step(PipelineStage::Init, "init failed", &init));
        }

        info!("Running apply");
        let apply = self
            .runner
            .run(&workspace, &self.apply_command(), self.tool.apply_timeout)
            .await;
        if !apply.success {
            return Err(PipelineFailure::from_step(PipelineStage::Apply, "apply failed", &apply));
        }

        let outputs = self.collect_outputs(&workspace).await?;
        info!("Deployment finished with {} outputs", outputs.len());

        Ok(outputs)
    }

    /// Destroy whatever the tenant's workspace manages. A tenant without a
    /// workspace has nothing to destroy and no command is run.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn destroy_infrastructure(
        &self,
        tenant_id: &str,
    ) -> Result<TeardownReport, PipelineFailure> {
        validate_tenant_id(tenant_id)
            .map_err(|e| PipelineFailure::new(PipelineStage::WorkspaceEnsure, e.to_string()))?;

        if !self.workspaces.workspace_exists(tenant_id) {
            info!("No workspace found; treating infrastructure as already destroyed");
            return Ok(TeardownReport::NothingToDestroy);
        }

        let workspace = self.workspaces.workspace_path(tenant_id);
        let manager = self.workspaces.clone();
        let ensure_path = workspace.clone();
        blocking(PipelineStage::WorkspaceEnsure, move || {
            manager.ensure_credentials(&ensure_path)
        })
        .await
        .map_err(|e| prefixed(e, "workspace preparation failed"))?;

        if !self.workspaces.is_initialized(&workspace) {
            info!("Workspace not initialized; running init before destroy");
            let init = self
                .runner
                .run(&workspace, &self.init_command(), self.tool.init_timeout)
                .await;
            if !init.success {
                return Err(PipelineFailure::from_step(PipelineStage::Init, "init failed", &init));
            }
        }

        info!("Running destroy");
        let destroy = self
            .runner
            .run(&workspace, &self.destroy_command(), self.tool.destroy_timeout)
            .await;
        if !destroy.success {
            // The workspace stays behind for diagnosis and a later retry.
            return Err(PipelineFailure::from_step(
                PipelineStage::Destroy,
                "destroy failed",
                &destroy,
            ));
        }

        let manager = self.workspaces.clone();
        let id = tenant_id.to_string();
        if let Err(e) = blocking(PipelineStage::Destroy, move || manager.destroy_workspace(&id)).await {
            warn!("Infrastructure destroyed but workspace cleanup failed: {}", e);
        }

        info!("Infrastructure destroyed");
        Ok(TeardownReport::Destroyed)
    }

    async fn create_workspace(
        &self,
        tenant_id: &str,
        params: &DeploymentParams,
    ) -> Result<PathBuf, PipelineFailure> {
        let manager = self.workspaces.clone();
        let id = tenant_id.to_string();
        let params = params.clone();

        blocking(PipelineStage::WorkspaceCreate, move || {
            manager.create_workspace(&id, &params)
        })
        .await
        .map_err(|e| prefixed(e, "workspace creation failed"))
    }

    async fn collect_outputs(&self, workspace: &Path) -> Result<ToolOutputs, PipelineFailure> {
        let result = self
            .runner
            .run(workspace, &self.output_command(), self.tool.output_timeout)
            .await;
        if !result.success {
            return Err(PipelineFailure::from_step(
                PipelineStage::CollectOutputs,
                "outputs missing",
                &result,
            ));
        }

        match ToolOutputs::parse(&result.output) {
            Ok(outputs) if outputs.is_empty() => Err(PipelineFailure::new(
                PipelineStage::CollectOutputs,
                "outputs missing: the tool reported no outputs",
            )),
            Ok(outputs) => Ok(outputs),
            Err(e) => Err(PipelineFailure::new(
                PipelineStage::CollectOutputs,
                format!("outputs missing: unreadable output document ({})", e),
            )),
        }
    }
}

/// Run filesystem work off the async executor.
async fn blocking<T, F>(stage: PipelineStage, f: F) -> Result<T, PipelineFailure>
where
    T: Send + 'static,
    F: FnOnce() -> crate::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineFailure::new(stage, e.to_string())),
        Err(e) => Err(PipelineFailure::new(stage, format!("filesystem task failed: {}", e))),
    }
}

fn prefixed(failure: PipelineFailure, prefix: &str) -> PipelineFailure {
    PipelineFailure {
        message: format!("{}: {}", prefix, failure.message),
        ..failure
    }
}
