//! Trigger draining over a ledger snapshot

use std::path::Path;
use std::sync::Arc;

use aa_engine_core::formula::{FormulaEvaluator, NullEvaluator, ScriptEvaluator};
use aa_engine_core::kv::MemoryKv;
use aa_engine_core::ledger::hash::ObjectHasher;
use aa_engine_core::ledger::{LedgerSnapshot, MemoryLedger, MemoryUnitWriter, MemoryValidator};
use aa_engine_core::{AaScheduler, AaServices, DrainReport, EngineConfig, EventBus, SchedulerDaemon};
use anyhow::{Context, Result};
use console::Style;
use tracing::info;

use super::EvaluatorKind;

/// Scheduler wired to in-memory stores seeded from a snapshot
pub struct SnapshotEngine {
    pub scheduler: Arc<AaScheduler>,
    pub ledger: MemoryLedger,
    pub kv: Arc<MemoryKv>,
}

impl SnapshotEngine {
    pub async fn open(config: EngineConfig, path: &Path, evaluator: EvaluatorKind) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let snapshot: LedgerSnapshot =
            serde_json::from_str(&content).context("Failed to parse ledger snapshot")?;
        Ok(Self::from_snapshot(config, &snapshot, evaluator))
    }

    pub fn from_snapshot(config: EngineConfig, snapshot: &LedgerSnapshot, evaluator: EvaluatorKind) -> Self {
        let ledger = MemoryLedger::from_snapshot(snapshot);
        let kv = Arc::new(MemoryKv::with_entries(snapshot.kv.clone()));
        let evaluator: Arc<dyn FormulaEvaluator> = match evaluator {
            EvaluatorKind::Script => Arc::new(ScriptEvaluator),
            EvaluatorKind::Null => Arc::new(NullEvaluator),
        };
        let events = EventBus::with_capacity(config.events.channel_capacity);
        let services = Arc::new(AaServices {
            config,
            db: Arc::new(ledger.clone()),
            kv: kv.clone(),
            evaluator,
            validator: Arc::new(MemoryValidator::new(ledger.clone())),
            writer: Arc::new(MemoryUnitWriter::new(ledger.clone())),
            hasher: Arc::new(ObjectHasher),
        });
        info!(
            units = snapshot.units.len(),
            triggers = snapshot.aa_triggers.len(),
            "ledger snapshot loaded"
        );
        Self {
            scheduler: Arc::new(AaScheduler::new(services, events)),
            ledger,
            kv,
        }
    }

    /// State variables currently stored, as (address, name, value)
    pub fn state_vars(&self) -> Vec<(String, String, String)> {
        self.kv
            .scan_prefix("st\n")
            .into_iter()
            .filter_map(|(key, value)| {
                let mut parts = key.splitn(3, '\n').skip(1);
                Some((parts.next()?.to_string(), parts.next()?.to_string(), value))
            })
            .collect()
    }
}

pub async fn handle_drain(
    config: EngineConfig,
    snapshot: &Path,
    evaluator: EvaluatorKind,
    json: bool,
) -> Result<()> {
    let engine = SnapshotEngine::open(config, snapshot, evaluator).await?;
    let report = engine
        .scheduler
        .drain()
        .await
        .context("Failed to drain AA triggers")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        print_state_vars(&engine);
    }
    Ok(())
}

pub async fn handle_run(config: EngineConfig, snapshot: &Path, evaluator: EvaluatorKind) -> Result<()> {
    let engine = SnapshotEngine::open(config, snapshot, evaluator).await?;
    let daemon = SchedulerDaemon::new(engine.scheduler.clone());
    let token = daemon.shutdown_token();

    tokio::select! {
        res = daemon.start_loop() => res?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
            token.cancel();
        }
    }
    print_state_vars(&engine);
    Ok(())
}

fn print_report(report: &DrainReport) {
    let bold = Style::new().bold();
    if report.is_empty() {
        println!("No pending triggers.");
        return;
    }
    println!(
        "{} triggers, {} responses ({} bounced)",
        bold.apply_to(report.triggers),
        bold.apply_to(report.responses.len()),
        report.bounced()
    );
    for response in &report.responses {
        let status = if response.bounced {
            Style::new().red().apply_to("bounced")
        } else {
            Style::new().green().apply_to("ok")
        };
        println!(
            "  {} {} <- {} [{}]",
            status,
            response.aa_address,
            response.trigger_unit,
            response.response_unit.as_deref().unwrap_or("no unit")
        );
        if let Some(error) = &response.response.error {
            println!("      {}", Style::new().dim().apply_to(error));
        }
        if let Some(vars) = &response.response.response_vars {
            for (name, value) in vars {
                println!("      {} = {}", name, value);
            }
        }
    }
}

fn print_state_vars(engine: &SnapshotEngine) {
    let vars = engine.state_vars();
    if vars.is_empty() {
        return;
    }
    println!("{}", Style::new().bold().apply_to("State variables"));
    for (address, name, value) in vars {
        println!("  {}.{} = {}", address, name, value);
    }
}
