//! Trigger queue draining
//!
//! Pending triggers are handled one primary at a time, each inside its own
//! transaction. The shared write lock is held only while the queue is read,
//! so new triggers can be queued while a drain runs; the drain lock keeps
//! two drains from overlapping.

pub mod daemon;
pub mod model;

pub use daemon::SchedulerDaemon;
pub use model::DrainReport;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::aa::orchestrator::{handle_trigger, AaServices, Cascade};
use crate::aa::state::{AaResponse, StateVars};
use crate::aa::trigger::Trigger;
use crate::error::{AaError, Result};
use crate::events::{EventBus, EventPayload, Topic};
use crate::ledger::store::{LedgerConn, PendingTrigger};

pub struct AaScheduler {
    services: Arc<AaServices>,
    events: EventBus,
    write_lock: Arc<Mutex<()>>,
    drain_lock: Mutex<()>,
}

impl AaScheduler {
    pub fn new(services: Arc<AaServices>, events: EventBus) -> Self {
        Self {
            services,
            events,
            write_lock: Arc::new(Mutex::new(())),
            drain_lock: Mutex::new(()),
        }
    }

    /// Share the lock that writers take while queueing triggers
    pub fn with_write_lock(mut self, write_lock: Arc<Mutex<()>>) -> Self {
        self.write_lock = write_lock;
        self
    }

    pub fn write_lock(&self) -> Arc<Mutex<()>> {
        self.write_lock.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn services(&self) -> &AaServices {
        &self.services
    }

    /// Handle every queued trigger in (mci, unit, address) order
    pub async fn drain(&self) -> Result<DrainReport> {
        let _drain = self.drain_lock.lock().await;
        let pending = {
            let _write = self.write_lock.lock().await;
            let mut conn = self.services.db.connection().await?;
            conn.pending_triggers().await?
        };
        info!(count = pending.len(), "handling AA triggers");

        let mut report = DrainReport::default();
        for row in &pending {
            let responses = match self.handle_primary_trigger(row).await {
                Ok(responses) => responses,
                Err(err) => {
                    // units of the triggers committed so far are on the ledger already
                    self.publish_new_units(&report.posted_units);
                    return Err(err);
                }
            };
            for response in &responses {
                if let Some(unit) = &response.response_unit {
                    report.posted_units.push(unit.clone());
                }
                self.events.publish_response(response);
            }
            report.responses.extend(responses);
            report.triggers += 1;
        }

        self.publish_new_units(&report.posted_units);
        info!(
            triggers = report.triggers,
            responses = report.responses.len(),
            bounced = report.bounced(),
            "AA triggers handled"
        );
        Ok(report)
    }

    fn publish_new_units(&self, units: &[String]) {
        for unit in units {
            self.events
                .publish(Topic::NewAaUnit, EventPayload::Unit(unit.clone()));
        }
    }

    async fn handle_primary_trigger(&self, row: &PendingTrigger) -> Result<Vec<AaResponse>> {
        info!(mci = row.mci, unit = %row.unit, address = %row.address, "handling primary AA trigger");
        let mut conn = self.services.db.connection().await?;
        conn.begin().await?;
        match self.process(conn.as_mut(), row).await {
            Ok(responses) => {
                conn.commit().await?;
                Ok(responses)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback().await {
                    warn!("rollback after failed trigger {} failed: {}", row.unit, rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn process(&self, conn: &mut dyn LedgerConn, row: &PendingTrigger) -> Result<Vec<AaResponse>> {
        let mc_units = conn.mc_units_at(row.mci).await?;
        let [mc_unit_id] = mc_units.as_slice() else {
            return Err(AaError::McUnitCount {
                mci: row.mci,
                count: mc_units.len(),
            });
        };
        let mc_unit = conn
            .read_unit(mc_unit_id)
            .await?
            .ok_or_else(|| AaError::UnitNotFound {
                unit: mc_unit_id.clone(),
            })?;
        let unit = conn
            .read_unit(&row.unit)
            .await?
            .ok_or_else(|| AaError::UnitNotFound {
                unit: row.unit.clone(),
            })?;
        let trigger = Trigger::from_unit(&unit, &row.address)?;
        let definition: Value =
            serde_json::from_str(&row.definition).map_err(|_| AaError::BadDefinition {
                definition: row.definition.clone(),
            })?;

        let mut batch = self.services.kv.batch();
        let mut state_vars = StateVars::new();
        let mut responses = Vec::new();
        {
            let mut cascade = Cascade {
                conn: &mut *conn,
                batch: &mut batch,
                state_vars: &mut state_vars,
                responses: &mut responses,
                mci: row.mci,
                mc_unit: &mc_unit,
            };
            handle_trigger(
                &self.services,
                &mut cascade,
                &trigger,
                &definition,
                &row.address,
                false,
            )
            .await?;
        }
        conn.delete_trigger(row.mci, &row.unit, &row.address).await?;

        let started = Instant::now();
        self.services
            .kv
            .write(batch)
            .await
            .map_err(|e| AaError::BatchWrite(e.to_string()))?;
        info!("AA batch write took {}ms", started.elapsed().as_millis());
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{addr, Fixture, MCI};
    use serde_json::json;

    fn scheduler(fixture: &Fixture) -> AaScheduler {
        AaScheduler::new(fixture.services.clone(), EventBus::new())
    }

    fn echo_template() -> Value {
        json!({"messages": [{"app": "payment", "payload": {"asset": "base", "outputs": [
            {"address": "{trigger.address}", "amount": "{trigger.output.base - 20000}"}
        ]}}]})
    }

    #[tokio::test]
    async fn drains_in_mci_unit_address_order() {
        let fixture = Fixture::new();
        let aa = fixture.deploy("ECHO", echo_template(), &[]);
        let user = addr("USER");
        fixture.send("T2", &user, &aa, &[("base", 50_000)], None);
        fixture.send("T1", &user, &aa, &[("base", 50_000)], None);

        let report = scheduler(&fixture).drain().await.expect("drain");
        assert_eq!(report.triggers, 2);
        let order: Vec<&str> = report.responses.iter().map(|r| r.trigger_unit.as_str()).collect();
        let t1 = crate::test_support::unit_id("T1");
        let t2 = crate::test_support::unit_id("T2");
        assert_eq!(order, vec![t1.as_str(), t2.as_str()]);
        assert!(report.responses.iter().all(|r| !r.bounced));
        assert_eq!(fixture.ledger.pending_trigger_count(), 0);
        assert_eq!(fixture.ledger.responses().len(), 2);
    }

    #[tokio::test]
    async fn events_follow_commit_and_units_follow_the_drain() {
        let fixture = Fixture::new();
        let aa = fixture.deploy("ECHO", echo_template(), &[]);
        let user = addr("USER");
        fixture.send("T1", &user, &aa, &[("base", 50_000)], None);

        let scheduler = scheduler(&fixture);
        let mut events = scheduler.events().subscribe();
        let report = scheduler.drain().await.expect("drain");

        let mut topics = Vec::new();
        while let Ok(event) = events.try_recv() {
            topics.push(event.topic.to_string());
        }
        let unit = report.posted_units[0].clone();
        assert_eq!(
            topics,
            vec![
                "aa_response".to_string(),
                format!("aa_response_to_unit-{}", crate::test_support::unit_id("T1")),
                format!("aa_response_to_address-{}", user),
                format!("aa_response_from_aa-{}", aa),
                "new_aa_unit".to_string(),
            ]
        );
        assert_eq!(report.responses[0].response_unit.as_deref(), Some(unit.as_str()));
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let fixture = Fixture::new();
        let report = scheduler(&fixture).drain().await.expect("drain");
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn missing_mc_unit_is_fatal_and_rolled_back() {
        let fixture = Fixture::new();
        let aa = fixture.deploy("ECHO", echo_template(), &[]);
        fixture.send("T1", &addr("USER"), &aa, &[("base", 50_000)], None);
        fixture.ledger.add_trigger(MCI + 5, &crate::test_support::unit_id("T1"), &aa);

        let scheduler = scheduler(&fixture);
        let mut events = scheduler.events().subscribe();
        let err = scheduler.drain().await.expect_err("fatal");
        assert!(matches!(err, AaError::McUnitCount { mci, count: 0 } if mci == MCI + 5));
        // the trigger at MCI was handled and committed before the failure
        assert_eq!(fixture.ledger.pending_trigger_count(), 1);
        let responses = fixture.ledger.responses();
        assert_eq!(responses.len(), 1);

        let mut new_units = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.topic == Topic::NewAaUnit {
                new_units.push(event.payload);
            }
        }
        let posted = responses[0].response_unit.clone().expect("response unit");
        assert_eq!(new_units, vec![EventPayload::Unit(posted)]);
    }

    #[tokio::test]
    async fn drains_do_not_overlap() {
        let fixture = Fixture::new();
        let aa = fixture.deploy("ECHO", echo_template(), &[]);
        fixture.send("T1", &addr("USER"), &aa, &[("base", 50_000)], None);

        let scheduler = Arc::new(scheduler(&fixture));
        let (a, b) = tokio::join!(scheduler.drain(), scheduler.drain());
        let handled = a.expect("first").triggers + b.expect("second").triggers;
        assert_eq!(handled, 1);
        assert_eq!(fixture.ledger.responses().len(), 1);
    }

    #[tokio::test]
    async fn queueing_is_possible_while_a_drain_waits() {
        let fixture = Fixture::new();
        let scheduler = scheduler(&fixture);
        let lock = scheduler.write_lock();
        let guard = lock.lock().await;
        let drain = scheduler.drain();
        tokio::pin!(drain);
        // the drain waits for the write lock before reading the queue
        assert!(futures::poll!(drain.as_mut()).is_pending());
        drop(guard);
        assert!(drain.await.expect("drain").is_empty());
    }
}
