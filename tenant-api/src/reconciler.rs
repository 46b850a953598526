//! Surfaces IN_PROGRESS tenants that no task owns, e.g. after a restart.

use crate::config::StalePolicy;
use std::time::Duration;
use tenant_orchestrator::{Result, TaskScheduler};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// One reconciliation pass. Returns the stale tenant ids, which under
/// [`StalePolicy::Fail`] are the ones moved to FAILED.
pub async fn reconcile_once(scheduler: &TaskScheduler, policy: StalePolicy) -> Result<Vec<String>> {
    match policy {
        StalePolicy::Fail => {
            let failed = scheduler.fail_stale().await?;
            if !failed.is_empty() {
                info!("Marked {} stale tenants as failed", failed.len());
            }
            Ok(failed)
        }
        StalePolicy::Report => {
            let stale = scheduler.stale_tenants().await?;
            for record in &stale {
                warn!(
                    tenant_id = %record.id,
                    updated_at = %record.updated_at,
                    "Tenant is IN_PROGRESS but no operation is running"
                );
            }
            Ok(stale.into_iter().map(|record| record.id).collect())
        }
    }
}

/// Run [`reconcile_once`] every `period`, starting one period from now.
pub async fn start_reconciler_task(scheduler: TaskScheduler, period: Duration, policy: StalePolicy) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Reconciler running (checks every {} seconds, policy {:?})",
        period.as_secs(),
        policy
    );

    loop {
        ticker.tick().await;

        if let Err(e) = reconcile_once(&scheduler, policy).await {
            error!("Stale operation check failed: {}", e);
        }
    }
}
