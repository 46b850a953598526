use crate::config::Config;
use crate::tables::{TableInitializer, TablesSettings};
use std::sync::Arc;
use tenant_orchestrator::{DeploymentPipeline, TaskScheduler, TenantStore, WorkspaceManager};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: TaskScheduler,
    pub tables: TableInitializer,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(scheduler: TaskScheduler, tables: TableInitializer, config: Config) -> Self {
        Self {
            scheduler,
            tables,
            config: Arc::new(config),
        }
    }

    /// Wire the scheduler, pipeline and table initializer from configuration.
    pub fn from_config(config: Config, store: TenantStore) -> Self {
        let pipeline = DeploymentPipeline::new(
            WorkspaceManager::new(config.workspace_settings()),
            config.tool_settings(),
        );
        let scheduler = TaskScheduler::new(store, pipeline);
        let tables = TableInitializer::new(TablesSettings::from_config(&config));

        Self::new(scheduler, tables, config)
    }

    pub fn store(&self) -> &TenantStore {
        self.scheduler.store()
    }
}
