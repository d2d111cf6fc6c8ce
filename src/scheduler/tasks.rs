use std::sync::Arc;

use tracing::{error, info};

use crate::relay::{Relay, TickOutcome};
use crate::scheduler::Scheduler;

/// Run one channel check and log how it ended. Errors stop the tick, never the process.
pub async fn run_check(relay: Arc<Relay>) {
    match relay.tick().await {
        Ok(TickOutcome::Dispatched {
            message_id,
            target_name,
            outcome,
        }) => info!(
            "Check: finished message {} as {}: {:?}",
            message_id, target_name, outcome
        ),
        Ok(outcome) => info!("Check: finished: {:?}", outcome),
        Err(e) => error!("Check: aborted: {:#}", e),
    }
}

/// Register the recurring channel check
pub async fn register_relay_tasks(
    scheduler: &mut Scheduler,
    relay: Arc<Relay>,
    cron_expr: &str,
) -> anyhow::Result<()> {
    scheduler
        .add_cron_job("channel-check", cron_expr, move || {
            let relay = relay.clone();
            Box::pin(run_check(relay))
        })
        .await?;

    Ok(())
}
