use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use cd_core::clock::Clock;
use cd_core::config::{ConfigSource, Strategy};
use cd_core::types::{ModeKind, StatusSnapshot};
use cd_telemetry::metrics::{global_metrics, CYCLES, CYCLE_DURATION, INCOME_PER_SEC};
use tracing::{debug, error, info, warn};

use crate::bus::{BusMessage, EventBus};
use crate::cluster::{Cluster, TargetRegistry};
use crate::engine::BatchEngine;
use crate::income::{IncomeLog, IncomeTracker};
use crate::modes::{select_mode, CycleContext, CycleResult, Mode};
use crate::shutdown::ShutdownSignal;

/// The cadence control loop.
///
/// Runs one mode cycle at a time, publishes its status, persists the income
/// window and sleeps for whatever the mode asked. Shutdown is only observed
/// while sleeping, so a started cycle always completes.
pub struct Daemon {
    cluster: Arc<dyn Cluster>,
    registry: Arc<dyn TargetRegistry>,
    clock: Arc<dyn Clock>,
    config: ConfigSource,
    bus: EventBus,
    shutdown: ShutdownSignal,
    income: IncomeTracker,
    income_log: Option<IncomeLog>,
    mode: Option<Mode>,
    /// Strategy the current mode was selected for.
    selected_for: Option<Strategy>,
    one_shot: Option<bool>,
}

impl Daemon {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        registry: Arc<dyn TargetRegistry>,
        clock: Arc<dyn Clock>,
        config: ConfigSource,
    ) -> Self {
        let income = IncomeTracker::new(&config.current().income);
        Self {
            cluster,
            registry,
            clock,
            config,
            bus: EventBus::new(),
            shutdown: ShutdownSignal::new(),
            income,
            income_log: None,
            mode: None,
            selected_for: None,
            one_shot: None,
        }
    }

    /// Load the income window from `log` and rewrite it after every cycle.
    pub fn with_income_log(mut self, log: IncomeLog) -> Result<Self> {
        self.income = log
            .load(&self.config.current().income)
            .with_context(|| format!("failed to load income log {}", log.path().display()))?;
        self.income_log = Some(log);
        Ok(self)
    }

    /// Override the configured one-shot flag.
    pub fn set_one_shot(&mut self, one_shot: bool) {
        self.one_shot = Some(one_shot);
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn income(&self) -> &IncomeTracker {
        &self.income
    }

    pub fn mode_kind(&self) -> Option<ModeKind> {
        self.mode.as_ref().map(Mode::kind)
    }

    pub fn batch_engine(&self) -> Option<&BatchEngine> {
        match &self.mode {
            Some(Mode::Batch(engine)) => Some(engine),
            _ => None,
        }
    }

    fn one_shot(&self) -> bool {
        self.one_shot
            .unwrap_or(self.config.current().daemon.one_shot)
    }

    /// Select the mode on first use and again whenever the configured
    /// strategy changes. Fails only if the fleet cannot be sized.
    async fn ensure_mode(&mut self) -> Result<(), String> {
        let strategy = self.config.current().daemon.strategy;
        if self.mode.is_some() && self.selected_for == Some(strategy) {
            return Ok(());
        }
        let nodes = self
            .cluster
            .nodes()
            .await
            .map_err(|e| format!("node inventory unavailable: {e}"))?;
        let total: f64 = nodes.iter().map(|n| n.total_capacity).sum();
        let kind = select_mode(strategy, total, &self.config.current().fleet);
        if self.mode_kind() != Some(kind) {
            info!(mode = %kind, ?strategy, total_capacity = total, "mode selected");
            self.mode = Some(Mode::new(kind));
        }
        self.selected_for = Some(strategy);
        Ok(())
    }

    /// Run exactly one cycle of the current mode.
    pub async fn run_cycle(&mut self) -> CycleResult {
        let started = Instant::now();
        self.config.refresh();
        let config = self.config.current().clone();
        self.income.apply_config(&config.income);

        let result = match self.ensure_mode().await {
            Err(message) => {
                warn!(error = %message, "cannot select mode");
                let mode = self.mode_kind().unwrap_or(ModeKind::Legacy);
                let mut status = StatusSnapshot::empty(mode, self.clock.now()).with_error(message);
                status.income_per_sec = self.income.smoothed_rate();
                CycleResult::backoff(status, &config)
            }
            Ok(()) => {
                let mut ctx = CycleContext {
                    cluster: self.cluster.as_ref(),
                    registry: self.registry.as_ref(),
                    clock: self.clock.as_ref(),
                    bus: &self.bus,
                    income: &mut self.income,
                };
                match self.mode.as_mut() {
                    Some(mode) => mode.run_cycle(&mut ctx, &config).await,
                    None => {
                        let status = StatusSnapshot::empty(ModeKind::Legacy, self.clock.now())
                            .with_error("no mode selected");
                        CycleResult::backoff(status, &config)
                    }
                }
            }
        };

        self.bus.publish(BusMessage::Status(result.status.clone()));

        if let Some(log) = &self.income_log {
            if let Err(e) = log.save(&self.income) {
                warn!(path = %log.path().display(), error = %e, "failed to save income log");
            }
        }

        let metrics = global_metrics();
        let mode = result.status.mode.to_string();
        metrics.increment_counter(CYCLES, &[("mode", mode.as_str())]);
        metrics.set_gauge(INCOME_PER_SEC, result.status.income_per_sec);
        metrics.record_histogram(CYCLE_DURATION, started.elapsed().as_secs_f64());

        info!(
            mode = %result.status.mode,
            targets = result.status.targets.len(),
            outstanding = result.status.outstanding_batches,
            dispatched = result.status.dispatched_ops,
            rejected = result.status.rejected_ops,
            income_per_sec = result.status.income_per_sec,
            error = result.status.error.as_deref().unwrap_or(""),
            sleep_ms = result.sleep.as_millis() as u64,
            "cycle complete"
        );
        result
    }

    /// Run cycles until the one-shot flag, a finished mode or shutdown
    /// stops the loop. Returns the number of cycles run.
    pub async fn run(&mut self) -> Result<u64> {
        info!(
            config = ?self.config.path(),
            one_shot = self.one_shot(),
            "cadence daemon starting"
        );
        let mut cycles = 0u64;
        loop {
            let result = self.run_cycle().await;
            cycles += 1;

            if self.one_shot() {
                info!("one-shot cycle complete, exiting");
                break;
            }
            if result.finished {
                info!(mode = %result.status.mode, "mode finished, exiting");
                break;
            }
            if self.shutdown.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(result.sleep) => {}
                _ = self.shutdown.triggered() => {
                    info!("shutdown signal received, stopping");
                    break;
                }
            }
        }

        if let Some(log) = &self.income_log {
            if let Err(e) = log.save(&self.income) {
                error!(path = %log.path().display(), error = %e, "final income log save failed");
            }
        }
        debug!(metrics = %global_metrics().export_prometheus(), "final metrics");
        info!(cycles, "cadence daemon stopped");
        Ok(cycles)
    }
}
