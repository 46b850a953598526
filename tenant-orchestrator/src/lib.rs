//! Tenant provisioning business logic
//!
//! This crate drives an external infrastructure tool to provision isolated
//! per-tenant cloud resources. It owns the tenant store, the per-tenant
//! workspaces, the ordered deployment pipeline and the scheduler that keeps
//! at most one operation per tenant in flight. It is consumed by the
//! tenant-api HTTP service but has no HTTP knowledge of its own.

pub mod classifier;
pub mod db;
pub mod error;
pub mod operation;
pub mod outputs;
pub mod pipeline;
pub mod remote;
pub mod runner;
pub mod scheduler;
pub mod tenant;
pub mod workspace;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use classifier::{classify, diagnose, Diagnosis};
pub use error::{OrchestratorError, Result};
pub use operation::{Operation, OperationFilters, OperationStatus, OperationType};
pub use outputs::{Outputs, ToolOutputs};
pub use pipeline::{DeploymentPipeline, PipelineFailure, PipelineStage, TeardownReport, ToolSettings};
pub use remote::{ConnectionInfo, RemoteShell, RemoteStep, RemoteStepFailure, RemoteStepRunner};
pub use runner::{OperationResult, ProcessRunner, ToolCommand};
pub use scheduler::{
    CascadeOutcome, OperationTicket, TaskScheduler, TeardownMode, TeardownOutcome,
};
pub use tenant::{Environment, NewTenant, TenantRecord, TenantStatus, TenantStore};
pub use workspace::{DeploymentParams, ParentResource, WorkspaceManager, WorkspaceSettings};
