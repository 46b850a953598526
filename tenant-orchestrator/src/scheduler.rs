//! Admission and execution of tenant operations.
//!
//! The scheduler owns the registry of active operations. A tenant id is in the
//! registry for exactly as long as a task is working on it, so at most one
//! operation per tenant runs at any time. The registry lock only guards map
//! mutation and is never held across an await.
//!
//! State transitions:
//!
//! ```text
//! PENDING | COMPLETED | FAILED --submit-----> IN_PROGRESS --pipeline--> COMPLETED | FAILED
//! any non-running status       --teardown---> IN_PROGRESS --destroy---> deleted | FAILED
//! ```
//!
//! A kept record whose infrastructure was destroyed ends FAILED with its
//! outputs cleared, so nothing can attach to resources that are gone.

use crate::classifier::{classify, diagnose};
use crate::error::{OrchestratorError, Result};
use crate::operation::{OperationStatus, OperationType};
use crate::outputs::output_str;
use crate::pipeline::{DeploymentPipeline, PipelineFailure, TeardownReport};
use crate::tenant::{TenantRecord, TenantStatus, TenantStore};
use crate::workspace::{DeploymentParams, ParentResource};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{error, info, instrument, warn};

/// Output of a completed parent tenant that sub-tenants attach to.
pub const PARENT_INSTANCE_OUTPUT: &str = "db_instance_name";

const STALE_MESSAGE: &str =
    "operation interrupted: no active task owns this tenant (the orchestrator may have restarted)";
const DESTROYED_MESSAGE: &str =
    "infrastructure destroyed: submit the tenant again to provision new infrastructure";
const SHUTDOWN_MESSAGE: &str = "operation aborted: the orchestrator shut down before it finished";

/// Handed back to the caller when a provision is admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTicket {
    pub tenant_id: String,
    pub job_id: String,
    pub operation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Destroy the infrastructure, then delete the tenant record.
    Delete,
    /// Destroy the infrastructure and keep the record, FAILED with its
    /// outputs cleared, ready to be submitted again.
    InfrastructureOnly,
    /// Delete the record without touching infrastructure.
    RecordOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOutcome {
    /// None when infrastructure was deliberately left alone.
    pub report: Option<TeardownReport>,
    pub record_deleted: bool,
}

/// A teardown plus the sub-tenants removed before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub outcome: TeardownOutcome,
    pub sub_tenants_deleted: Vec<String>,
}

/// A registry entry, visible through [`TaskScheduler::active_operations`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveOperationInfo {
    pub tenant_id: String,
    pub kind: OperationType,
    pub started_at: DateTime<Utc>,
}

struct ActiveOperation {
    token: u64,
    kind: OperationType,
    started_at: DateTime<Utc>,
    handle: Option<JoinHandle<()>>,
    done: watch::Receiver<bool>,
}

struct Inner {
    store: TenantStore,
    pipeline: DeploymentPipeline,
    active: Mutex<HashMap<String, ActiveOperation>>,
    next_token: AtomicU64,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveOperation>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a tenant registered. Dropping it (normal completion, early return,
/// panic unwinding, or task abort) releases the registry entry and fires the
/// completion signal.
struct Registration {
    inner: Arc<Inner>,
    tenant_id: String,
    token: u64,
    done: watch::Sender<bool>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        {
            let mut active = self.inner.active();
            if active
                .get(&self.tenant_id)
                .is_some_and(|op| op.token == self.token)
            {
                active.remove(&self.tenant_id);
            }
        }
        self.done.send_replace(true);
    }
}

/// Aborts a nested task when the awaiting future is dropped, so aborting an
/// operation also stops the pipeline it started.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `future` on its own task. A panic inside it comes back as a
/// `JoinError` instead of unwinding through the caller.
async fn isolated<F>(future: F) -> std::result::Result<F::Output, JoinError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut task = tokio::spawn(future);
    let _guard = AbortOnDrop(task.abort_handle());
    (&mut task).await
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(store: TenantStore, pipeline: DeploymentPipeline) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                active: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &TenantStore {
        &self.inner.store
    }

    pub fn pipeline(&self) -> &DeploymentPipeline {
        &self.inner.pipeline
    }

    pub fn is_running(&self, tenant_id: &str) -> bool {
        self.inner.active().contains_key(tenant_id)
    }

    pub fn active_tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.active().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_operations(&self) -> Vec<ActiveOperationInfo> {
        let mut ops: Vec<ActiveOperationInfo> = self
            .inner
            .active()
            .iter()
            .map(|(id, op)| ActiveOperationInfo {
                tenant_id: id.clone(),
                kind: op.kind,
                started_at: op.started_at,
            })
            .collect();
        ops.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        ops
    }

    /// Wait until the tenant's current operation (if any) has finished and
    /// its final state is persisted.
    pub async fn wait_for(&self, tenant_id: &str) {
        let done = self.inner.active().get(tenant_id).map(|op| op.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the registration is already gone.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    fn register(&self, tenant_id: &str, kind: OperationType) -> Result<Registration> {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = watch::channel(false);

        let mut active = self.inner.active();
        if active.contains_key(tenant_id) {
            return Err(OrchestratorError::OperationInProgress(tenant_id.to_string()));
        }
        active.insert(
            tenant_id.to_string(),
            ActiveOperation {
                token,
                kind,
                started_at: Utc::now(),
                handle: None,
                done: done_rx,
            },
        );

        Ok(Registration {
            inner: Arc::clone(&self.inner),
            tenant_id: tenant_id.to_string(),
            token,
            done: done_tx,
        })
    }

    fn attach_handle(&self, tenant_id: &str, token: u64, handle: JoinHandle<()>) {
        let mut active = self.inner.active();
        // The task may already have finished and deregistered.
        if let Some(op) = active.get_mut(tenant_id).filter(|op| op.token == token) {
            op.handle = Some(handle);
        }
    }

    /// Admit a provisioning run for an existing tenant record.
    ///
    /// On return the record is IN_PROGRESS and the pipeline is running on a
    /// background task. Sub-tenants are checked against their parent first;
    /// a failed check leaves the record FAILED and returns
    /// [`OrchestratorError::Precondition`] without creating a workspace.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn submit(&self, tenant_id: &str) -> Result<OperationTicket> {
        let record = self.inner.store.get(tenant_id).await?;
        let registration = self.register(tenant_id, OperationType::Provision)?;
        let token = registration.token;

        let operation_id = match self.begin_provision(&record).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to start provisioning: {}", e);
                self.inner.mark_failed(tenant_id, None, &e.to_string()).await;
                return Err(e);
            }
        };

        let parent = match &record.parent_id {
            Some(parent_id) => match self.resolve_parent(parent_id).await {
                Ok(parent) => Some(parent),
                Err(e) => {
                    let message = match &e {
                        OrchestratorError::Precondition(msg) => msg.clone(),
                        other => other.to_string(),
                    };
                    warn!("Sub-tenant precondition failed: {}", message);
                    self.inner
                        .mark_failed(tenant_id, Some(&operation_id), &message)
                        .await;
                    return Err(e);
                }
            },
            None => None,
        };

        let params = DeploymentParams {
            name: record.name.clone(),
            environment: record.environment,
            region: record.region.clone(),
            parent,
        };

        let inner = Arc::clone(&self.inner);
        let id = tenant_id.to_string();
        let op_id = operation_id.clone();
        let handle = tokio::spawn(async move {
            let _registration = registration;
            inner.run_provision(&id, &op_id, params).await;
        });
        self.attach_handle(tenant_id, token, handle);

        info!(operation_id = %operation_id, "Provisioning admitted");

        Ok(OperationTicket {
            tenant_id: record.id,
            job_id: record.job_id,
            operation_id,
        })
    }

    async fn begin_provision(&self, record: &TenantRecord) -> Result<String> {
        let operation_id = self
            .inner
            .store
            .record_operation(&record.id, OperationType::Provision)
            .await?;
        self.inner
            .store
            .update_status(&record.id, TenantStatus::InProgress, None)
            .await?;
        Ok(operation_id)
    }

    async fn resolve_parent(&self, parent_id: &str) -> Result<ParentResource> {
        let parent = self
            .inner
            .store
            .find(parent_id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Precondition(format!("parent tenant not found: {}", parent_id))
            })?;

        if parent.status != TenantStatus::Completed {
            return Err(OrchestratorError::Precondition(format!(
                "parent tenant not ready: {} is {}",
                parent_id, parent.status
            )));
        }

        if self.is_running(parent_id) {
            return Err(OrchestratorError::Precondition(format!(
                "parent tenant busy: {} has an operation in progress",
                parent_id
            )));
        }

        let instance = parent
            .outputs
            .as_ref()
            .and_then(|outputs| output_str(outputs, PARENT_INSTANCE_OUTPUT))
            .ok_or_else(|| {
                OrchestratorError::Precondition(format!(
                    "parent tenant has no {} output: {}",
                    PARENT_INSTANCE_OUTPUT, parent_id
                ))
            })?;

        Ok(ParentResource {
            tenant_id: parent_id.to_string(),
            instance: instance.into_owned(),
        })
    }

    /// Tear a tenant down and wait for the result.
    ///
    /// Infrastructure-touching modes move the record to IN_PROGRESS first. The
    /// work runs on its own task, so a caller that stops waiting does not
    /// interrupt a destroy halfway through.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn teardown(&self, tenant_id: &str, mode: TeardownMode) -> Result<TeardownOutcome> {
        self.inner.store.get(tenant_id).await?;
        let registration = self.register(tenant_id, OperationType::Destroy)?;
        self.teardown_registered(registration, mode).await
    }

    /// Tear down a tenant's sub-tenants, then the tenant itself.
    ///
    /// The tenant stays registered for the whole cascade, so no new sub-tenant
    /// can be provisioned against it meanwhile. Children that appear while the
    /// cascade runs are picked up before the tenant goes. The first child
    /// failure stops the cascade and leaves the tenant untouched.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn teardown_with_sub_tenants(
        &self,
        tenant_id: &str,
        mode: TeardownMode,
    ) -> Result<CascadeOutcome> {
        let record = self.inner.store.get(tenant_id).await?;
        let registration = self.register(tenant_id, OperationType::Destroy)?;

        let mut sub_tenants_deleted = Vec::new();
        // Children are only ever removed by a record-deleting mode.
        if !record.is_sub_tenant() && mode != TeardownMode::InfrastructureOnly {
            loop {
                let children = self.inner.store.list_children(tenant_id).await?;
                if children.is_empty() {
                    break;
                }
                for child in children {
                    match self.teardown(&child.id, mode).await {
                        Ok(_) | Err(OrchestratorError::NotFound(_)) => {
                            sub_tenants_deleted.push(child.id)
                        }
                        Err(e) => {
                            warn!(sub_tenant_id = %child.id, "Cascade stopped: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
        }

        let outcome = self.teardown_registered(registration, mode).await?;

        Ok(CascadeOutcome {
            outcome,
            sub_tenants_deleted,
        })
    }

    async fn teardown_registered(
        &self,
        registration: Registration,
        mode: TeardownMode,
    ) -> Result<TeardownOutcome> {
        let tenant_id = registration.tenant_id.clone();

        if mode == TeardownMode::RecordOnly {
            self.inner.store.delete(&tenant_id).await?;
            info!("Deleted tenant record without touching infrastructure");
            return Ok(TeardownOutcome {
                report: None,
                record_deleted: true,
            });
        }

        let operation_id = self
            .inner
            .store
            .record_operation(&tenant_id, OperationType::Destroy)
            .await?;
        if let Err(e) = self
            .inner
            .store
            .update_status(&tenant_id, TenantStatus::InProgress, None)
            .await
        {
            self.inner
                .mark_failed(&tenant_id, Some(&operation_id), &e.to_string())
                .await;
            return Err(e);
        }

        let token = registration.token;
        let (result_tx, result_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let id = tenant_id.clone();
        let handle = tokio::spawn(async move {
            let _registration = registration;
            let result = inner.run_teardown(&id, &operation_id, mode).await;
            let _ = result_tx.send(result);
        });
        self.attach_handle(&tenant_id, token, handle);

        result_rx.await.map_err(|_| {
            OrchestratorError::Internal(format!("teardown of {} was aborted", tenant_id))
        })?
    }

    /// Run `work` as the tenant's only operation, recorded in the operation
    /// history as `kind`. The tenant's status is left alone.
    ///
    /// Like a teardown, the work runs on its own task and finishes even if
    /// the caller stops waiting.
    #[instrument(skip(self, work), fields(tenant_id = %tenant_id))]
    pub async fn run_exclusive<T, E, F>(
        &self,
        tenant_id: &str,
        kind: OperationType,
        work: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<OrchestratorError> + fmt::Display + Send + 'static,
    {
        self.inner.store.get(tenant_id).await?;
        let registration = self.register(tenant_id, kind)?;
        let operation_id = self.inner.store.record_operation(tenant_id, kind).await?;

        let token = registration.token;
        let (result_tx, result_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _registration = registration;
            let result = work.await;
            let (status, error) = match &result {
                Ok(_) => (OperationStatus::Success, None),
                Err(e) => (OperationStatus::Failed, Some(e.to_string())),
            };
            inner
                .close_operation(&operation_id, status, error.as_deref())
                .await;
            let _ = result_tx.send(result);
        });
        self.attach_handle(tenant_id, token, handle);

        match result_rx.await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Internal(format!(
                "operation on {} was aborted",
                tenant_id
            ))
            .into()),
        }
    }

    /// IN_PROGRESS records that no registered operation owns.
    pub async fn stale_tenants(&self) -> Result<Vec<TenantRecord>> {
        let in_progress = self
            .inner
            .store
            .list_by_status(TenantStatus::InProgress)
            .await?;

        Ok(in_progress
            .into_iter()
            .filter(|record| !self.is_running(&record.id))
            .collect())
    }

    /// Move stale IN_PROGRESS records to FAILED. Returns the ids that were
    /// changed.
    pub async fn fail_stale(&self) -> Result<Vec<String>> {
        let mut failed = Vec::new();

        for record in self.stale_tenants().await? {
            if self.is_running(&record.id) {
                continue;
            }
            let changed = self
                .inner
                .store
                .transition(
                    &record.id,
                    TenantStatus::InProgress,
                    TenantStatus::Failed,
                    Some(STALE_MESSAGE),
                )
                .await?;
            if changed {
                self.inner
                    .store
                    .fail_running_operations(&record.id, STALE_MESSAGE)
                    .await?;
                warn!(tenant_id = %record.id, "Marked stale operation as failed");
                failed.push(record.id);
            }
        }

        Ok(failed)
    }

    /// Wait up to `grace` for in-flight operations, then abort the rest and
    /// mark their tenants FAILED. Returns the aborted tenant ids.
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        let handles: Vec<(String, JoinHandle<()>)> = self
            .inner
            .active()
            .iter_mut()
            .filter_map(|(id, op)| op.handle.take().map(|h| (id.clone(), h)))
            .collect();

        if handles.is_empty() {
            return Vec::new();
        }

        info!(
            "Waiting up to {:?} for {} in-flight operations",
            grace,
            handles.len()
        );
        let deadline = tokio::time::Instant::now() + grace;
        let mut orphaned = Vec::new();

        for (tenant_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
                orphaned.push(tenant_id);
            }
        }

        for tenant_id in &orphaned {
            warn!(tenant_id = %tenant_id, "Aborted in-flight operation at shutdown");
            if let Err(e) = self
                .inner
                .store
                .transition(
                    tenant_id,
                    TenantStatus::InProgress,
                    TenantStatus::Failed,
                    Some(SHUTDOWN_MESSAGE),
                )
                .await
            {
                error!(tenant_id = %tenant_id, "Failed to mark aborted tenant: {}", e);
            }
            if let Err(e) = self
                .inner
                .store
                .fail_running_operations(tenant_id, SHUTDOWN_MESSAGE)
                .await
            {
                error!(tenant_id = %tenant_id, "Failed to close aborted operation: {}", e);
            }
        }

        orphaned
    }
}

impl Inner {
    #[instrument(skip(self, params), fields(tenant_id = %tenant_id))]
    async fn run_provision(&self, tenant_id: &str, operation_id: &str, params: DeploymentParams) {
        let pipeline = self.pipeline.clone();
        let id = tenant_id.to_string();
        let result = isolated(async move { pipeline.run_full_deployment(&id, &params).await }).await;

        let outcome = match result {
            Ok(Ok(outputs)) => {
                let safe = outputs.redacted();
                if safe.is_empty() {
                    Err("outputs missing: every reported output was secret".to_string())
                } else {
                    match self.store.update_outputs(tenant_id, &safe).await {
                        Ok(()) => Ok(safe.len()),
                        Err(e) => Err(format!("failed to persist outputs: {}", e)),
                    }
                }
            }
            Ok(Err(failure)) => Err(classified(&failure)),
            Err(e) => Err(format!("internal error: provisioning task failed: {}", e)),
        };

        match outcome {
            Ok(count) => {
                info!("Provisioning completed with {} outputs", count);
                self.finish(tenant_id, operation_id, TenantStatus::Completed, None)
                    .await;
            }
            Err(message) => {
                error!("Provisioning failed: {}", message);
                self.finish(tenant_id, operation_id, TenantStatus::Failed, Some(&message))
                    .await;
            }
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn run_teardown(
        &self,
        tenant_id: &str,
        operation_id: &str,
        mode: TeardownMode,
    ) -> Result<TeardownOutcome> {
        let pipeline = self.pipeline.clone();
        let id = tenant_id.to_string();
        let result = isolated(async move { pipeline.destroy_infrastructure(&id).await }).await;

        let (message, err) = match result {
            Ok(Ok(report)) => {
                self.close_operation(operation_id, OperationStatus::Success, None)
                    .await;
                let record_deleted = mode == TeardownMode::Delete;
                let (finalized, action) = if record_deleted {
                    (self.store.delete(tenant_id).await, "delete")
                } else {
                    (self.keep_destroyed(tenant_id).await, "update")
                };
                if let Err(e) = finalized {
                    let message =
                        format!("infrastructure destroyed but record {} failed: {}", action, e);
                    self.mark_failed(tenant_id, None, &message).await;
                    return Err(e);
                }
                info!(?report, record_deleted, "Teardown completed");
                return Ok(TeardownOutcome {
                    report: Some(report),
                    record_deleted,
                });
            }
            Ok(Err(failure)) => {
                let message = classified(&failure);
                (message.clone(), OrchestratorError::Teardown(message))
            }
            Err(e) => {
                let message = format!("internal error: teardown task failed: {}", e);
                (message.clone(), OrchestratorError::Internal(message))
            }
        };

        error!("Teardown failed: {}", message);
        self.mark_failed(tenant_id, Some(operation_id), &message).await;
        Err(err)
    }

    /// Leave a kept record without live infrastructure: no outputs, and a
    /// terminal status that sub-tenants cannot attach to.
    async fn keep_destroyed(&self, tenant_id: &str) -> Result<()> {
        self.store.clear_outputs(tenant_id).await?;
        self.store
            .update_status(tenant_id, TenantStatus::Failed, Some(DESTROYED_MESSAGE))
            .await
    }

    async fn finish(
        &self,
        tenant_id: &str,
        operation_id: &str,
        status: TenantStatus,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self
            .store
            .update_status(tenant_id, status, error_message)
            .await
        {
            error!(tenant_id = %tenant_id, "Failed to persist final status {}: {}", status, e);
        }

        let op_status = if status == TenantStatus::Completed {
            OperationStatus::Success
        } else {
            OperationStatus::Failed
        };
        self.close_operation(operation_id, op_status, error_message)
            .await;
    }

    /// Best-effort FAILED transition used on error paths.
    async fn mark_failed(&self, tenant_id: &str, operation_id: Option<&str>, message: &str) {
        if let Err(e) = self
            .store
            .update_status(tenant_id, TenantStatus::Failed, Some(message))
            .await
        {
            error!(tenant_id = %tenant_id, "Failed to mark tenant failed: {}", e);
        }
        if let Some(operation_id) = operation_id {
            self.close_operation(operation_id, OperationStatus::Failed, Some(message))
                .await;
        }
    }

    async fn close_operation(&self, operation_id: &str, status: OperationStatus, error: Option<&str>) {
        if let Err(e) = self
            .store
            .complete_operation(operation_id, status, error)
            .await
        {
            warn!(operation_id = %operation_id, "Failed to close operation: {}", e);
        }
    }
}

fn classified(failure: &PipelineFailure) -> String {
    if let Some(diagnosis) = diagnose(&failure.message) {
        info!(stage = %failure.stage, cause = diagnosis.cause, "Diagnosed failure");
    }
    classify(&failure.message)
}
