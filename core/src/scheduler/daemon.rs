use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::Topic;
use crate::scheduler::AaScheduler;

/// Runs a drain whenever new triggers are announced
pub struct SchedulerDaemon {
    scheduler: Arc<AaScheduler>,
    shutdown: CancellationToken,
}

impl SchedulerDaemon {
    pub fn new(scheduler: Arc<AaScheduler>) -> Self {
        Self {
            scheduler,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Drain once, then again on every `new_aa_triggers` event until shut down
    pub async fn start_loop(&self) -> Result<()> {
        let mut events = self.scheduler.events().subscribe();
        info!("AA scheduler daemon started");
        self.tick().await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("AA scheduler daemon stopped");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Ok(event) if event.topic == Topic::NewAaTriggers => self.tick().await?,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        // a missed notification may hide new triggers
                        warn!(skipped, "event receiver lagged");
                        self.tick().await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let report = self
            .scheduler
            .drain()
            .await
            .context("Failed to drain AA triggers")?;
        debug!(triggers = report.triggers, "drain finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::test_support::{addr, Fixture};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn notification_triggers_a_drain() {
        let fixture = Fixture::new();
        let aa = fixture.deploy(
            "SINK",
            json!({"messages": [{"app": "state", "state": "{var.hits = 1}"}]}),
            &[],
        );
        let bus = EventBus::new();
        let scheduler = Arc::new(AaScheduler::new(fixture.services.clone(), bus.clone()));
        let daemon = Arc::new(SchedulerDaemon::new(scheduler));
        let token = daemon.shutdown_token();
        let handle = tokio::spawn({
            let daemon = daemon.clone();
            async move { daemon.start_loop().await }
        });

        fixture.send("T1", &addr("USER"), &aa, &[("base", 20_000)], None);
        let mut delivered = false;
        for _ in 0..50 {
            bus.notify_new_triggers();
            if fixture.ledger.pending_trigger_count() == 0 {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        handle.await.expect("join").expect("daemon");

        assert!(delivered);
        assert_eq!(fixture.state_var(&aa, "hits").await, Some("1".to_string()));
    }
}
